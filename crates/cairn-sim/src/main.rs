//! Cairn simulator
//!
//! Races simulated clients against one shared log, one seed at a time. Each
//! run has every client create or join every stream, runs rounds until the
//! log goes quiet, then has every client send one message per stream and
//! checks that every other client reads it.
//!
//! ```text
//! cairn-sim --clients 5 --streams 2 --seed 100 --runs 50
//! ```
//!
//! A failing seed replays identically, so it can be rerun alone with
//! `--runs 1` and `RUST_LOG=debug`.

use cairn_core::ProcessorConfig;
use cairn_harness::{World, scenario::oracle};
use cairn_proto::{EventId, StreamId};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "cairn-sim")]
#[command(about = "Race simulated MLS clients against a shared log")]
struct Args {
    /// Clients per world
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// Streams per world
    #[arg(long, default_value_t = 1)]
    streams: usize,

    /// First seed
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Number of seeds to run, starting at `--seed`
    #[arg(long, default_value_t = 1)]
    runs: u64,

    /// Give up on a run after this many rounds
    #[arg(long, default_value_t = 64)]
    max_rounds: usize,

    /// Log level used when `RUST_LOG` is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Outcome of one converged run.
struct Summary {
    rounds: usize,
    epoch: u64,
    messages: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    tracing::info!(
        clients = args.clients,
        streams = args.streams,
        seed = args.seed,
        runs = args.runs,
        "starting simulation"
    );

    let mut failures = 0u64;
    for seed in args.seed..args.seed.saturating_add(args.runs) {
        match simulate(&args, seed).await {
            Ok(summary) => tracing::info!(
                seed,
                rounds = summary.rounds,
                epoch = summary.epoch,
                messages = summary.messages,
                "run converged"
            ),
            Err(e) => {
                tracing::error!(seed, error = %e, "run failed");
                failures += 1;
            },
        }
    }

    if failures > 0 {
        return Err(format!("{failures} of {} runs failed", args.runs).into());
    }
    tracing::info!(runs = args.runs, "all runs converged");
    Ok(())
}

async fn simulate(args: &Args, seed: u64) -> Result<Summary, String> {
    let mut world = World::new(seed);
    for i in 0..args.clients {
        world.add_client(format!("client-{i}"), ProcessorConfig::default());
    }
    for s in 0..args.streams {
        let stream_id = StreamId::new(format!("stream-{s}"));
        world.create_stream(&stream_id);
        world.join_all(&stream_id).await.map_err(|e| format!("join {stream_id}: {e}"))?;
    }

    let rounds = world.run_until_quiet(args.max_rounds).await;
    let report = world.report().await.map_err(|e| e.to_string())?;
    let epoch = args.clients.saturating_sub(1) as u64;
    oracle::all_of(vec![
        oracle::all_active(),
        oracle::remote_views_converged(),
        oracle::all_at_epoch(epoch),
    ])(&report)?;

    let sent = send_messages(&world).await?;
    world.deliver().await;
    check_messages(&world, &sent).await?;

    Ok(Summary { rounds, epoch, messages: sent.len() })
}

/// Every client posts one message on every stream.
async fn send_messages(world: &World) -> Result<Vec<(StreamId, EventId, Vec<u8>)>, String> {
    let mut sent = Vec::new();
    for name in world.client_names() {
        let processor = world.processor(&name).ok_or_else(|| format!("no client {name}"))?;
        for stream_id in world.streams() {
            let plaintext = format!("{name} on {stream_id}").into_bytes();
            let envelope = processor
                .encrypt_message(stream_id, &plaintext, None)
                .await
                .map_err(|e| format!("{name} encrypt on {stream_id}: {e}"))?;
            let event_id = world
                .log()
                .post_content(stream_id, &envelope)
                .map_err(|e| format!("{name} post on {stream_id}: {e}"))?;
            sent.push((stream_id.clone(), event_id, plaintext));
        }
    }
    Ok(sent)
}

async fn check_messages(
    world: &World,
    sent: &[(StreamId, EventId, Vec<u8>)],
) -> Result<(), String> {
    for name in world.client_names() {
        let processor = world.processor(&name).ok_or_else(|| format!("no client {name}"))?;
        for (stream_id, event_id, plaintext) in sent {
            let decrypted = processor.decrypted(stream_id, event_id).await;
            if decrypted.as_ref() != Some(plaintext) {
                return Err(format!("{name} could not read {event_id} on {stream_id}"));
            }
        }
    }
    Ok(())
}
