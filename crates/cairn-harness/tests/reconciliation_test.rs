//! End-to-end reconciliation through the simulated log.
//!
//! Every client submits MLS events optimistically and learns the outcome from
//! the confirmed log. These tests drive whole worlds round by round:
//!
//! ```text
//!   round: confirm pending (shuffled) ─► deliver to every client ─► tick queues
//!                     ▲                                                │
//!                     └────────── new submissions (joins, secrets) ◄───┘
//! ```
//!
//! - Races: every client initializes at once, losers rejoin externally.
//! - Agreement: all Remote Views end up identical.
//! - Corruption: a commit the observer accepts but members cannot apply.

use cairn_core::{
    EventLog, GroupEngine, GroupSession, LocalViewStatus, LocalViewStore, ProcessorConfig, ProcessorError,
};
use cairn_harness::{
    SimEngine, SimEnv, World,
    scenario::{Scenario, oracle},
};
use cairn_proto::{ExternalJoin, MlsPayload, StreamId};

fn stream() -> StreamId {
    StreamId::new("stream-0")
}

/// Route log output to the test harness; `RUST_LOG=cairn_core=debug` shows
/// verdicts and transitions for a failing seed.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn racing_clients_converge() {
    init_tracing();
    for clients in [1usize, 2, 3, 5] {
        for seed in 0..4 {
            let report = Scenario::new(format!("race-{clients}-{seed}"))
                .seed(seed)
                .clients(clients)
                .oracle(oracle::all_of(vec![
                    oracle::all_active(),
                    oracle::remote_views_converged(),
                    oracle::all_at_epoch(clients as u64 - 1),
                ]))
                .run()
                .await
                .unwrap();

            let stream = stream();
            let (_, first) = report.per_client(&stream).next().unwrap();
            // One InitializeGroup plus one accepted join per extra member
            let commits = first.digest.commits.len();
            assert_eq!(commits, clients - 1, "clients={clients} seed={seed}");
        }
    }
}

#[tokio::test]
async fn every_round_activates_at_least_one_more_client() {
    init_tracing();
    for clients in [2usize, 3, 5] {
        for seed in 0..6 {
            let mut world = World::new(seed);
            for i in 0..clients {
                world.add_client(format!("client-{i}"), ProcessorConfig::default());
            }
            world.create_stream(&stream());
            world.join_all(&stream()).await.unwrap();

            let mut active_before = 0;
            for round in 1..=clients {
                world.round().await;
                let report = world.report().await.unwrap();
                let active = report
                    .per_client(&stream())
                    .filter(|(_, view)| view.status == Some(LocalViewStatus::Active))
                    .count();
                assert!(
                    active >= round,
                    "clients={clients} seed={seed}: {active} active after round {round}"
                );
                assert!(active >= active_before, "clients={clients} seed={seed}: active count fell");
                active_before = active;
            }
            assert_eq!(active_before, clients);
        }
    }
}

#[tokio::test]
async fn same_seed_same_outcome() {
    init_tracing();
    let run = |seed| async move {
        let report = Scenario::new("determinism")
            .seed(seed)
            .clients(4)
            .oracle(oracle::remote_views_converged())
            .run()
            .await
            .unwrap();
        report.stream("client-0", &stream()).unwrap().digest.clone()
    };

    assert_eq!(run(42).await, run(42).await);
}

#[tokio::test]
async fn second_client_joins_externally() {
    init_tracing();
    let mut world = World::new(7);
    world.add_client("alice", ProcessorConfig::manual());
    world.add_client("bob", ProcessorConfig::manual());
    let stream = StreamId::new("ab");
    world.create_stream(&stream);

    let alice = world.processor("alice").unwrap();
    alice.initialize_or_join_group(&stream).await.unwrap();
    assert_eq!(alice.status(&stream).await, Some(LocalViewStatus::Pending));

    world.round().await;
    let alice = world.processor("alice").unwrap();
    assert_eq!(alice.status(&stream).await, Some(LocalViewStatus::Active));
    assert_eq!(alice.epoch(&stream).await, Some(0));

    let bob = world.processor("bob").unwrap();
    bob.initialize_or_join_group(&stream).await.unwrap();
    world.round().await;

    let report = world.report().await.unwrap();
    for name in ["alice", "bob"] {
        let view = report.stream(name, &stream).unwrap();
        assert_eq!(view.status, Some(LocalViewStatus::Active), "{name}");
        assert_eq!(view.epoch, Some(1), "{name}");
        assert_eq!(view.remote_epoch(), Some(1), "{name}");
        assert_eq!(view.digest.accepted.len(), 2, "{name}");
        assert!(view.digest.rejected.is_empty(), "{name}");
    }

    // Manual clients never announce, so bob only holds the epoch he joined at
    assert_eq!(report.stream("alice", &stream).unwrap().epoch_secrets, vec![0, 1]);
    assert_eq!(report.stream("bob", &stream).unwrap().epoch_secrets, vec![1]);
}

#[tokio::test]
async fn losing_initialize_is_rejected_then_rejoins() {
    init_tracing();
    let mut world = World::new(11);
    world.add_client("alice", ProcessorConfig::manual());
    world.add_client("bob", ProcessorConfig::manual());
    world.create_stream(&stream());
    world.join_all(&stream()).await.unwrap();
    world.round().await;

    let report = world.report().await.unwrap();
    let statuses: Vec<Option<LocalViewStatus>> =
        report.per_client(&stream()).map(|(_, r)| r.status).collect();
    assert!(statuses.contains(&Some(LocalViewStatus::Active)));
    assert!(statuses.contains(&Some(LocalViewStatus::Rejected)));

    // The loser discards its group and joins the winner's
    let loser = report
        .per_client(&stream())
        .find(|(_, r)| r.status == Some(LocalViewStatus::Rejected))
        .map(|(name, _)| name.to_owned())
        .unwrap();
    world.processor(&loser).unwrap().initialize_or_join_group(&stream()).await.unwrap();
    world.round().await;

    let report = world.report().await.unwrap();
    oracle::all_active()(&report).unwrap();
    oracle::all_at_epoch(1)(&report).unwrap();
    // The losing group's state went with the rejected view
    assert_eq!(world.client(&loser).unwrap().storage().group_count(), 1);
}

#[tokio::test]
async fn lost_races_do_not_accumulate_group_state() {
    init_tracing();
    for seed in 0..4 {
        let mut world = World::new(seed);
        for i in 0..5 {
            world.add_client(format!("client-{i}"), ProcessorConfig::default());
        }
        world.create_stream(&stream());
        world.join_all(&stream()).await.unwrap();
        world.run_until_quiet(16).await;

        let report = world.report().await.unwrap();
        oracle::all_active()(&report).unwrap();
        for name in world.client_names() {
            let storage = world.client(&name).unwrap().storage();
            assert_eq!(storage.group_count(), 1, "seed={seed} {name}");
        }
    }
}

#[tokio::test]
async fn clients_track_streams_independently() {
    init_tracing();
    let report = Scenario::new("two streams")
        .seed(3)
        .clients(3)
        .stream("general")
        .stream("random")
        .oracle(oracle::all_of(vec![oracle::all_active(), oracle::remote_views_converged()]))
        .run()
        .await
        .unwrap();

    let general = report.stream("client-0", &StreamId::new("general")).unwrap();
    let random = report.stream("client-0", &StreamId::new("random")).unwrap();
    assert_ne!(
        general.digest.external_info, random.digest.external_info,
        "streams must host distinct groups"
    );
}

#[tokio::test]
async fn undecryptable_commit_corrupts_members_only() {
    init_tracing();
    let mut world = World::new(5);
    world.add_client("alice", ProcessorConfig::manual());
    world.create_stream(&stream());
    let alice = world.processor("alice").unwrap();
    alice.initialize_or_join_group(&stream()).await.unwrap();
    world.round().await;

    // An outsider commits with an init secret nobody in the group can open
    let mallory = SimEngine::new(SimEnv::with_seed(99));
    let alice = world.processor("alice").unwrap();
    let info = alice.remote_digest(&stream()).await.unwrap().external_info.unwrap();
    let bad = mallory
        .external_commit_with_bad_init(&info.latest_group_info, &info.exported_tree)
        .unwrap();
    let payload = MlsPayload::ExternalJoin(ExternalJoin {
        signature_public_key: mallory.signature_public_key(),
        group_info_message: bad.group.group_info_message(true).unwrap(),
        commit: bad.commit,
        epoch: info.epoch,
    });
    world.log().submit(&stream(), payload).await.unwrap();
    world.round().await;

    let alice = world.processor("alice").unwrap();
    assert_eq!(alice.status(&stream()).await, Some(LocalViewStatus::Corrupted));
    let digest = alice.remote_digest(&stream()).await.unwrap();
    assert_eq!(digest.external_info.map(|i| i.epoch), Some(1), "observer accepted the commit");

    let err = alice.encrypt_message(&stream(), b"hello", None).await.unwrap_err();
    assert!(matches!(err, ProcessorError::Corrupted { epoch: Some(0), .. }), "got {err:?}");

    // Corruption is sticky until cleared
    alice.initialize_or_join_group(&stream()).await.unwrap();
    assert_eq!(alice.status(&stream()).await, Some(LocalViewStatus::Corrupted));
    let saved = world.client("alice").unwrap().storage().load_local_view(&stream()).await.unwrap();
    assert_eq!(saved.map(|s| s.status), Some(LocalViewStatus::Corrupted));

    assert!(alice.clear_corrupted(&stream()).await.unwrap());
    assert_eq!(alice.status(&stream()).await, None);
    let storage = world.client("alice").unwrap().storage();
    assert!(storage.load_local_view(&stream()).await.unwrap().is_none());
    assert_eq!(storage.group_count(), 0, "corrupted group state left behind");

    alice.initialize_or_join_group(&stream()).await.unwrap();
    world.round().await;

    let alice = world.processor("alice").unwrap();
    assert_eq!(alice.status(&stream()).await, Some(LocalViewStatus::Active));
    assert_eq!(alice.epoch(&stream()).await, Some(2));
    assert!(!alice.clear_corrupted(&stream()).await.unwrap());
}

#[tokio::test]
async fn failing_oracle_names_scenario() {
    init_tracing();
    let err = Scenario::new("too few rounds")
        .clients(3)
        .rounds(1)
        .oracle(oracle::all_at_epoch(2))
        .run()
        .await
        .unwrap_err();

    assert!(err.starts_with("Scenario 'too few rounds': "), "got {err}");
}
