//! Fuzzer for Remote View replay
//!
//! Builds a fixed pool of confirmed events (racing inits, racing joins, a
//! chained join, an announcement, a garbage commit, an empty event) and lets
//! the fuzzer choose which of them arrive and in what order, duplicates
//! included. Whatever the order:
//!
//! - no event is both accepted and rejected
//! - every distinct event with a payload gets exactly one verdict
//! - replaying the same sequence again changes nothing

#![no_main]

use std::{collections::BTreeSet, sync::OnceLock};

use cairn_core::{GroupEngine, GroupSession, RemoteView};
use cairn_harness::{SimEngine, SimEnv};
use cairn_proto::{
    ConfirmedEvent, EpochSecret, EpochSecrets, EventId, ExternalJoin, InitializeGroup, MlsPayload,
};
use libfuzzer_sys::fuzz_target;

type Engine = SimEngine<SimEnv>;
type Group = <Engine as GroupEngine>::Group;

struct Pool {
    engine: Engine,
    events: Vec<ConfirmedEvent>,
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().expect("runtime")
}

fn confirmed(num: u64, payload: Option<MlsPayload>) -> ConfirmedEvent {
    ConfirmedEvent {
        event_id: EventId::new(format!("event-{num}")),
        confirmed_event_num: num,
        miniblock_num: num,
        payload,
    }
}

async fn join(engine: &Engine, group: &Group) -> (Group, MlsPayload) {
    let joined = engine
        .commit_external(&group.group_info_message(true).unwrap(), &group.export_tree().unwrap())
        .await
        .unwrap();
    let payload = MlsPayload::ExternalJoin(ExternalJoin {
        signature_public_key: engine.signature_public_key(),
        group_info_message: joined.group.group_info_message(true).unwrap(),
        commit: joined.commit,
        epoch: group.epoch(),
    });
    (joined.group, payload)
}

async fn build_pool() -> Pool {
    let env = SimEnv::with_seed(0);
    let engines: Vec<Engine> = (0..5).map(|_| SimEngine::new(env.fork())).collect();

    let mut payloads = Vec::new();
    let mut groups = Vec::new();
    for engine in &engines[..2] {
        let group = engine.create_group().await.unwrap();
        payloads.push(Some(MlsPayload::InitializeGroup(InitializeGroup {
            signature_public_key: engine.signature_public_key(),
            external_group_snapshot: group.external_group_snapshot().unwrap(),
            group_info_message: group.group_info_message(true).unwrap(),
        })));
        groups.push(group);
    }

    let (after_c, join_c) = join(&engines[2], &groups[0]).await;
    let (_, join_d) = join(&engines[3], &groups[0]).await;
    let (_, join_e) = join(&engines[4], &after_c).await;
    payloads.extend([Some(join_c), Some(join_d), Some(join_e)]);

    payloads.push(Some(MlsPayload::EpochSecrets(EpochSecrets {
        secrets: vec![EpochSecret { epoch: 0, secret: vec![1; 48] }],
    })));
    payloads.push(Some(MlsPayload::ExternalJoin(ExternalJoin {
        signature_public_key: vec![9],
        commit: vec![0xff; 16],
        group_info_message: Vec::new(),
        epoch: 0,
    })));
    payloads.push(None);

    let events =
        payloads.into_iter().enumerate().map(|(num, payload)| confirmed(num as u64, payload)).collect();
    Pool { engine: engines[0].clone(), events }
}

fn pool() -> &'static Pool {
    static POOL: OnceLock<Pool> = OnceLock::new();
    POOL.get_or_init(|| runtime().block_on(build_pool()))
}

fuzz_target!(|data: &[u8]| {
    let pool = pool();
    let sequence: Vec<&ConfirmedEvent> =
        data.iter().take(64).map(|b| &pool.events[*b as usize % pool.events.len()]).collect();

    runtime().block_on(async {
        let mut view = RemoteView::<Engine>::new(tracing::Span::none());
        for event in &sequence {
            view.process_confirmed_event(&pool.engine, (*event).clone()).await;
        }

        let accepted: BTreeSet<&EventId> = view.accepted().keys().collect();
        let rejected: BTreeSet<&EventId> = view.rejected().keys().collect();
        assert!(accepted.is_disjoint(&rejected), "event with two verdicts");

        let with_payload: BTreeSet<&EventId> =
            sequence.iter().filter(|e| e.payload.is_some()).map(|e| &e.event_id).collect();
        assert_eq!(view.processed_count(), with_payload.len());

        let digest = view.digest().unwrap();
        for event in &sequence {
            view.process_confirmed_event(&pool.engine, (*event).clone()).await;
        }
        assert_eq!(view.digest().unwrap(), digest, "replay changed the view");
    });
});
