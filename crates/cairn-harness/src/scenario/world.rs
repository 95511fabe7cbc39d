//! World state for scenario execution.
//!
//! The World owns one shared [`SimLog`] and any number of simulated clients,
//! each with its own engine, storage, processor and update queue. It moves
//! confirmed events from the log to clients in rounds:
//!
//! 1. confirm every pending submission (shuffled, one miniblock per stream)
//! 2. deliver new events and content to every client's queue
//! 3. drain each queue; processing may submit new events for the next round

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use cairn_core::{
    LocalViewStatus, MemoryStorage, Processor, ProcessorConfig, ProcessorError, QueueConfig,
    RemoteViewDigest, StreamUpdate, UpdateQueue,
};
use cairn_proto::StreamId;

use crate::{engine::SimEngine, log::SimLog, sim_env::SimEnv};

/// Processor wired to the simulated engine, log and in-memory storage.
pub type SimProcessor = Processor<SimEngine<SimEnv>, SimLog, MemoryStorage>;

#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    events: usize,
    content: usize,
}

/// One simulated client.
pub struct SimClient {
    name: String,
    env: SimEnv,
    engine: SimEngine<SimEnv>,
    storage: MemoryStorage,
    config: ProcessorConfig,
    processor: Arc<SimProcessor>,
    queue: UpdateQueue<SimProcessor, SimEnv>,
    cursors: HashMap<StreamId, Cursor>,
}

impl SimClient {
    fn new(name: String, env: SimEnv, log: SimLog, config: ProcessorConfig) -> Self {
        let engine = SimEngine::new(env.clone());
        let storage = MemoryStorage::new();
        let (processor, queue) =
            Self::wire(&name, &env, engine.clone(), log, storage.clone(), config.clone());
        Self { name, env, engine, storage, config, processor, queue, cursors: HashMap::new() }
    }

    fn wire(
        name: &str,
        env: &SimEnv,
        engine: SimEngine<SimEnv>,
        log: SimLog,
        storage: MemoryStorage,
        config: ProcessorConfig,
    ) -> (Arc<SimProcessor>, UpdateQueue<SimProcessor, SimEnv>) {
        let span = tracing::info_span!("client", nickname = %name);
        let processor = Arc::new(Processor::new(engine, log, storage, config, span.clone()));
        let queue =
            UpdateQueue::new(Arc::clone(&processor), env.clone(), QueueConfig::default(), span);
        (processor, queue)
    }

    /// Client name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The client's processor.
    pub fn processor(&self) -> &SimProcessor {
        &self.processor
    }

    /// The client's update queue.
    pub fn queue(&self) -> &UpdateQueue<SimProcessor, SimEnv> {
        &self.queue
    }

    /// The client's engine.
    pub fn engine(&self) -> &SimEngine<SimEnv> {
        &self.engine
    }

    /// The client's storage.
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }
}

/// Summary of one client's state on one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    /// Local View status
    pub status: Option<LocalViewStatus>,
    /// Epoch of the client's own group
    pub epoch: Option<u64>,
    /// Remote View summary
    pub digest: RemoteViewDigest,
    /// Epochs the client holds secrets for
    pub epoch_secrets: Vec<u64>,
}

impl StreamReport {
    /// Confirmed epoch according to the Remote View.
    pub fn remote_epoch(&self) -> Option<u64> {
        self.digest.external_info.as_ref().map(|info| info.epoch)
    }
}

/// Snapshot of every client on every stream, for oracles.
#[derive(Debug, Clone, Default)]
pub struct Report {
    clients: BTreeMap<String, BTreeMap<StreamId, StreamReport>>,
}

impl Report {
    /// One client's view of one stream.
    pub fn stream(&self, client: &str, stream_id: &StreamId) -> Option<&StreamReport> {
        self.clients.get(client).and_then(|streams| streams.get(stream_id))
    }

    /// Client names.
    pub fn clients(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    /// Every stream id any client has seen.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> =
            self.clients.values().flat_map(|streams| streams.keys().cloned()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Every client's view of one stream.
    pub fn per_client(&self, stream_id: &StreamId) -> impl Iterator<Item = (&str, &StreamReport)> {
        self.clients
            .iter()
            .filter_map(move |(name, streams)| streams.get(stream_id).map(|r| (name.as_str(), r)))
    }
}

/// World state containing the log and all clients.
pub struct World {
    env: SimEnv,
    log: SimLog,
    clients: BTreeMap<String, SimClient>,
    streams: Vec<StreamId>,
    rounds: usize,
}

impl World {
    /// Create an empty world. Everything random derives from `seed`.
    pub fn new(seed: u64) -> Self {
        let env = SimEnv::with_seed(seed);
        let log = SimLog::new(env.fork());
        Self { env, log, clients: BTreeMap::new(), streams: Vec::new(), rounds: 0 }
    }

    /// The shared log.
    pub fn log(&self) -> &SimLog {
        &self.log
    }

    /// Add a client.
    pub fn add_client(&mut self, name: impl Into<String>, config: ProcessorConfig) {
        let name = name.into();
        let client = SimClient::new(name.clone(), self.env.fork(), self.log.clone(), config);
        self.clients.insert(name, client);
    }

    /// Create a stream on the log.
    pub fn create_stream(&mut self, stream_id: &StreamId) {
        self.log.create_stream(stream_id);
        if !self.streams.contains(stream_id) {
            self.streams.push(stream_id.clone());
        }
    }

    /// Streams created so far.
    pub fn streams(&self) -> &[StreamId] {
        &self.streams
    }

    /// Client names in order.
    pub fn client_names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    /// Client by name.
    pub fn client(&self, name: &str) -> Option<&SimClient> {
        self.clients.get(name)
    }

    /// A client's processor.
    pub fn processor(&self, name: &str) -> Option<&SimProcessor> {
        self.clients.get(name).map(SimClient::processor)
    }

    /// Rounds run so far.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Have every client create or join a stream's group.
    pub async fn join_all(&self, stream_id: &StreamId) -> Result<(), ProcessorError> {
        for client in self.clients.values() {
            client.processor.initialize_or_join_group(stream_id).await?;
        }
        Ok(())
    }

    /// Deliver everything new on the log to every client and let each
    /// client's queue run dry. Returns the number of items delivered.
    pub async fn deliver(&mut self) -> usize {
        let mut delivered = 0;
        for client in self.clients.values_mut() {
            for stream_id in &self.streams {
                let cursor = client.cursors.entry(stream_id.clone()).or_default();
                let events = self.log.events_since(stream_id, cursor.events);
                let content = self.log.content_since(stream_id, cursor.content);
                if events.is_empty() && content.is_empty() {
                    continue;
                }
                cursor.events += events.len();
                cursor.content += content.len();
                delivered += events.len() + content.len();

                let mut update = StreamUpdate::new(stream_id.clone());
                update.confirmed_events = events;
                update.encrypted_content = content;
                client.queue.enqueue_stream_update(update);
            }

            while client.queue.tick().await {}
        }
        delivered
    }

    /// Confirm pending submissions, then deliver.
    pub async fn round(&mut self) -> usize {
        let confirmed = self.log.confirm_all();
        let delivered = self.deliver().await;
        self.rounds += 1;
        tracing::debug!(round = self.rounds, confirmed, delivered, "round complete");
        confirmed
    }

    /// Run a fixed number of rounds.
    pub async fn run_rounds(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.round().await;
        }
    }

    /// Run rounds until a round confirms nothing, up to `max_rounds`.
    ///
    /// Returns the number of rounds run.
    pub async fn run_until_quiet(&mut self, max_rounds: usize) -> usize {
        for ran in 1..=max_rounds {
            if self.round().await == 0 {
                return ran;
            }
        }
        max_rounds
    }

    /// Publish a compaction snapshot of `stream_id` taken from `client`'s
    /// Remote View.
    pub async fn compact(&self, client: &str, stream_id: &StreamId) -> Result<(), ProcessorError> {
        let Some(client) = self.clients.get(client) else {
            return Ok(());
        };
        let miniblock_num = self.log.miniblock_num(stream_id);
        let snapshot = client.processor.compact(stream_id, miniblock_num).await?;
        self.log.store_snapshot(stream_id, snapshot);
        Ok(())
    }

    /// Restart a client: same identity and storage, fresh in-memory state.
    ///
    /// Every stream is rebuilt with [`cairn_core::Processor::track_stream`].
    /// Content is redelivered from the start.
    pub async fn restart_client(&mut self, name: &str) -> Result<(), ProcessorError> {
        let Some(client) = self.clients.get_mut(name) else {
            return Ok(());
        };
        client.queue.stop().await;

        let (processor, queue) = SimClient::wire(
            &client.name,
            &client.env,
            client.engine.clone(),
            self.log.clone(),
            client.storage.clone(),
            client.config.clone(),
        );
        client.processor = processor;
        client.queue = queue;
        client.cursors.clear();

        for stream_id in &self.streams {
            client.processor.track_stream(stream_id).await?;
            let cursor = Cursor { events: self.log.confirmed_count(stream_id), content: 0 };
            client.cursors.insert(stream_id.clone(), cursor);
        }
        Ok(())
    }

    /// Summarize every client on every stream.
    pub async fn report(&self) -> Result<Report, ProcessorError> {
        let mut report = Report::default();
        for (name, client) in &self.clients {
            let mut streams = BTreeMap::new();
            for stream_id in &self.streams {
                let processor = &client.processor;
                let stream_report = StreamReport {
                    status: processor.status(stream_id).await,
                    epoch: processor.epoch(stream_id).await,
                    digest: processor.remote_digest(stream_id).await?,
                    epoch_secrets: processor.epoch_secret_ids(stream_id).await,
                };
                streams.insert(stream_id.clone(), stream_report);
            }
            report.clients.insert(name.clone(), streams);
        }
        Ok(report)
    }
}
