//! Remote View replay properties.
//!
//! The Remote View is the only arbiter of which MLS event won. These tests
//! feed it hand-built confirmed events and check that verdicts depend on the
//! confirmed order alone: replays change nothing and exactly one commit wins
//! per epoch.

use std::collections::BTreeSet;

use cairn_core::{GroupEngine, GroupSession, RemoteView, StreamHistory};
use cairn_harness::{SimEngine, SimEnv};
use cairn_proto::{
    ConfirmedEvent, EpochSecret, EpochSecrets, EventId, ExternalJoin, InitializeGroup, MlsPayload,
};
use proptest::prelude::*;

type Engine = SimEngine<SimEnv>;

fn confirmed(num: u64, payload: MlsPayload) -> ConfirmedEvent {
    ConfirmedEvent {
        event_id: EventId::new(format!("event-{num}")),
        confirmed_event_num: num,
        miniblock_num: num / 4,
        payload: Some(payload),
    }
}

async fn initialize(engine: &Engine) -> (<Engine as GroupEngine>::Group, MlsPayload) {
    let group = engine.create_group().await.unwrap();
    let payload = MlsPayload::InitializeGroup(InitializeGroup {
        signature_public_key: engine.signature_public_key(),
        external_group_snapshot: group.external_group_snapshot().unwrap(),
        group_info_message: group.group_info_message(true).unwrap(),
    });
    (group, payload)
}

async fn external_join(engine: &Engine, group: &<Engine as GroupEngine>::Group) -> MlsPayload {
    let joined = engine
        .commit_external(&group.group_info_message(true).unwrap(), &group.export_tree().unwrap())
        .await
        .unwrap();
    MlsPayload::ExternalJoin(ExternalJoin {
        signature_public_key: engine.signature_public_key(),
        group_info_message: joined.group.group_info_message(true).unwrap(),
        commit: joined.commit,
        epoch: group.epoch(),
    })
}

/// Two racing InitializeGroups, two racing joins on the first, one
/// announcement.
async fn racing_events(seed: u64) -> (Engine, Vec<ConfirmedEvent>) {
    let env = SimEnv::with_seed(seed);
    let engines: Vec<Engine> = (0..4).map(|_| SimEngine::new(env.fork())).collect();

    let (group_a, init_a) = initialize(&engines[0]).await;
    let (_, init_b) = initialize(&engines[1]).await;
    let join_c = external_join(&engines[2], &group_a).await;
    let join_d = external_join(&engines[3], &group_a).await;
    let secrets = MlsPayload::EpochSecrets(EpochSecrets {
        secrets: vec![EpochSecret { epoch: 0, secret: vec![7; 48] }],
    });

    let events = vec![
        confirmed(0, init_a),
        confirmed(1, init_b),
        confirmed(2, join_c),
        confirmed(3, join_d),
        confirmed(4, secrets),
    ];
    (engines[0].clone(), events)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

#[tokio::test]
async fn first_valid_event_per_epoch_wins() {
    let (engine, events) = racing_events(1).await;
    let mut view = RemoteView::<Engine>::new(tracing::Span::none());
    for event in events {
        view.process_confirmed_event(&engine, event).await;
    }

    let accepted: Vec<&str> = view.accepted().keys().map(EventId::as_str).collect();
    let rejected: Vec<&str> = view.rejected().keys().map(EventId::as_str).collect();
    assert_eq!(accepted, vec!["event-0", "event-2", "event-4"]);
    assert_eq!(rejected, vec!["event-1", "event-3"]);

    assert_eq!(view.epoch(), Some(1));
    assert_eq!(view.commits().keys().copied().collect::<Vec<_>>(), vec![0]);
    assert_eq!(view.sealed_epoch_secrets().get(&0), Some(&vec![7; 48]));
    assert_eq!(view.processed_count(), 5);
}

#[tokio::test]
async fn commit_before_group_is_rejected() {
    let (engine, events) = racing_events(2).await;
    let mut view = RemoteView::<Engine>::new(tracing::Span::none());

    view.process_confirmed_event(&engine, events[2].clone()).await;
    assert!(view.rejected().contains_key(&events[2].event_id));
    assert!(!view.has_group());
    assert_eq!(view.external_info().unwrap(), None);
}

#[tokio::test]
async fn out_of_order_event_is_still_processed() {
    let (engine, events) = racing_events(3).await;
    let mut view = RemoteView::<Engine>::new(tracing::Span::none());

    view.process_confirmed_event(&engine, events[4].clone()).await;
    view.process_confirmed_event(&engine, events[0].clone()).await;

    assert_eq!(view.processed_count(), 2);
    assert!(view.accepted().contains_key(&events[0].event_id));
    // The high-water mark does not move backwards
    assert_eq!(view.last_confirmed_event_num(), Some(4));
}

#[tokio::test]
async fn empty_and_key_package_events_get_no_verdict() {
    let (engine, _) = racing_events(4).await;
    let mut view = RemoteView::<Engine>::new(tracing::Span::none());

    let empty = ConfirmedEvent {
        event_id: EventId::new("empty"),
        confirmed_event_num: 0,
        miniblock_num: 0,
        payload: None,
    };
    let key_package = confirmed(
        1,
        MlsPayload::KeyPackage(cairn_proto::KeyPackage {
            signature_public_key: vec![1],
            key_package: engine.generate_key_package().await.unwrap(),
        }),
    );
    view.process_confirmed_event(&engine, empty).await;
    view.process_confirmed_event(&engine, key_package).await;

    assert_eq!(view.processed_count(), 0);
    assert_eq!(view.last_confirmed_event_num(), Some(1));
}

#[tokio::test]
async fn load_from_log_skips_events_folded_into_snapshot() {
    let (engine, events) = racing_events(5).await;

    let mut live = RemoteView::<Engine>::new(tracing::Span::none());
    for event in &events[..3] {
        live.process_confirmed_event(&engine, event.clone()).await;
    }
    let snapshot = live.compact(1).unwrap();
    assert_eq!(snapshot.confirmed_event_num, 2);

    // Events arrive unsorted and include ones the snapshot already covers
    let mut history_events = events.clone();
    history_events.reverse();
    let history = StreamHistory { snapshot: Some(snapshot), events: history_events };
    let cold = RemoteView::<Engine>::load_from_log(&engine, &history, tracing::Span::none()).await;

    for event in &events[3..] {
        live.process_confirmed_event(&engine, event.clone()).await;
    }

    assert_eq!(cold.epoch(), live.epoch());
    assert_eq!(cold.external_info().unwrap(), live.external_info().unwrap());
    assert_eq!(cold.sealed_epoch_secrets(), live.sealed_epoch_secrets());
    // Only events after the snapshot get a verdict on the cold view
    assert_eq!(cold.processed_count(), 2);
    assert!(cold.rejected().contains_key(&events[3].event_id));
}

#[tokio::test]
async fn stale_snapshot_is_ignored() {
    let (engine, events) = racing_events(6).await;

    let mut view = RemoteView::<Engine>::new(tracing::Span::none());
    view.process_confirmed_event(&engine, events[0].clone()).await;
    let old = view.compact(0).unwrap();
    view.process_confirmed_event(&engine, events[2].clone()).await;
    let new = view.compact(1).unwrap();

    let mut fresh = RemoteView::<Engine>::new(tracing::Span::none());
    fresh.process_snapshot(&engine, &new).await;
    fresh.process_snapshot(&engine, &old).await;
    assert_eq!(fresh.epoch(), Some(1));
}

#[tokio::test]
async fn snapshot_behind_processed_events_is_ignored() {
    let (engine, events) = racing_events(7).await;

    let mut view = RemoteView::<Engine>::new(tracing::Span::none());
    view.process_confirmed_event(&engine, events[0].clone()).await;
    let old = view.compact(0).unwrap();
    view.process_confirmed_event(&engine, events[1].clone()).await;
    view.process_confirmed_event(&engine, events[2].clone()).await;
    let before = view.digest().unwrap();

    view.process_snapshot(&engine, &old).await;
    assert_eq!(view.epoch(), Some(1));
    assert_eq!(view.digest().unwrap(), before);

    // The losing join for epoch 0 still loses
    view.process_confirmed_event(&engine, events[3].clone()).await;
    assert!(view.rejected().contains_key(&events[3].event_id));
    assert_eq!(view.commits().len(), 1);
    assert_eq!(view.commits().get(&0), before.commits.get(&0));
}

proptest! {
    #[test]
    fn replay_is_idempotent(
        seed in 0u64..1000,
        replays in prop::collection::vec((0usize..5, 0usize..5), 0..16),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let (engine, events) = racing_events(seed).await;

            let mut once = RemoteView::<Engine>::new(tracing::Span::none());
            for event in &events {
                once.process_confirmed_event(&engine, event.clone()).await;
            }

            let mut replayed = RemoteView::<Engine>::new(tracing::Span::none());
            for (step, event) in events.iter().enumerate() {
                replayed.process_confirmed_event(&engine, event.clone()).await;
                for &(after, which) in &replays {
                    if after == step {
                        let again = events[which.min(step)].clone();
                        replayed.process_confirmed_event(&engine, again).await;
                    }
                }
            }

            assert_eq!(replayed.digest().unwrap(), once.digest().unwrap());
            assert_eq!(replayed.processed_count(), events.len());
        });
    }

    #[test]
    fn one_initialize_wins_and_one_join_per_epoch(seed in 0u64..1000, clients in 2usize..6) {
        let rt = runtime();
        rt.block_on(async {
            let env = SimEnv::with_seed(seed);
            let engines: Vec<Engine> = (0..clients).map(|_| SimEngine::new(env.fork())).collect();

            let mut view = RemoteView::<Engine>::new(tracing::Span::none());
            let mut num = 0;
            let mut groups = Vec::new();
            for engine in &engines {
                let (group, payload) = initialize(engine).await;
                groups.push(group);
                view.process_confirmed_event(&engines[0], confirmed(num, payload)).await;
                num += 1;
            }
            assert_eq!(view.accepted().len(), 1);
            assert_eq!(view.rejected().len(), clients - 1);

            // Everyone races a join against the winning group at epoch 0
            let winner = &groups[0];
            for engine in &engines[1..] {
                let payload = external_join(engine, winner).await;
                view.process_confirmed_event(&engines[0], confirmed(num, payload)).await;
                num += 1;
            }

            assert_eq!(view.epoch(), Some(1));
            assert_eq!(view.commits().len(), 1);
            assert_eq!(view.accepted().len(), 2);

            let accepted: BTreeSet<&EventId> = view.accepted().keys().collect();
            let rejected: BTreeSet<&EventId> = view.rejected().keys().collect();
            assert!(accepted.is_disjoint(&rejected));
            assert_eq!(view.processed_count(), 2 * clients - 1);
        });
    }
}
