//! Per-client update queue.
//!
//! Confirmed snapshots, confirmed events and encrypted content arrive from
//! many streams in arbitrary interleavings. The queue merges them into one
//! [`StreamUpdate`] per stream and hands those to a delegate one at a time,
//! in the order streams were first enqueued.
//!
//! # Ticking
//!
//! ```text
//! enqueue ──► request tick ──► (delay) ──► dequeue oldest stream ──► delegate
//!                 ▲                                                     │
//!                 └──────────── reschedule once delegate settles ◄──────┘
//! ```
//!
//! - At most one tick is in flight.
//! - Ticking pauses while nothing is queued or while the client is
//!   backgrounded; queued work is kept.
//! - Delegate errors are logged and never stop the loop.
//! - [`UpdateQueue::stop`] cancels a pending timer and waits for an in-flight
//!   tick, so once it returns the delegate is idle.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use cairn_proto::{ConfirmedEvent, ConfirmedSnapshot, EncryptedContentItem, StreamId};
use tokio::task::JoinHandle;

use crate::{config::QueueConfig, env::Environment, error::ProcessorError};

/// Work accumulated for one stream since it was last dequeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUpdate {
    /// Stream the work belongs to
    pub stream_id: StreamId,
    /// Compaction snapshots, in arrival order
    pub snapshots: Vec<ConfirmedSnapshot>,
    /// Confirmed MLS events, in arrival order
    pub confirmed_events: Vec<ConfirmedEvent>,
    /// Encrypted application content
    pub encrypted_content: Vec<EncryptedContentItem>,
}

impl StreamUpdate {
    /// Empty update for a stream.
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            snapshots: Vec::new(),
            confirmed_events: Vec::new(),
            encrypted_content: Vec::new(),
        }
    }

    /// Append another update's work after ours.
    pub fn merge(&mut self, other: StreamUpdate) {
        self.snapshots.extend(other.snapshots);
        self.confirmed_events.extend(other.confirmed_events);
        self.encrypted_content.extend(other.encrypted_content);
    }

    /// Whether the update carries no work.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
            && self.confirmed_events.is_empty()
            && self.encrypted_content.is_empty()
    }
}

/// Consumer of dequeued stream updates.
#[async_trait]
pub trait StreamUpdateDelegate: Send + Sync + 'static {
    /// Process one stream's accumulated update.
    async fn handle_stream_update(&self, update: StreamUpdate) -> Result<(), ProcessorError>;
}

#[derive(Default)]
struct PendingUpdates {
    order: VecDeque<StreamId>,
    updates: HashMap<StreamId, StreamUpdate>,
}

impl PendingUpdates {
    fn entry(&mut self, stream_id: &StreamId) -> &mut StreamUpdate {
        if !self.updates.contains_key(stream_id) {
            self.order.push_back(stream_id.clone());
        }
        self.updates.entry(stream_id.clone()).or_insert_with(|| StreamUpdate::new(stream_id.clone()))
    }

    fn pop(&mut self) -> Option<StreamUpdate> {
        let stream_id = self.order.pop_front()?;
        self.updates.remove(&stream_id)
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Default)]
struct TickState {
    started: bool,
    backgrounded: bool,
    running: bool,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

struct QueueInner<D, Env> {
    delegate: Arc<D>,
    env: Env,
    config: QueueConfig,
    pending: Mutex<PendingUpdates>,
    state: Mutex<TickState>,
    span: tracing::Span,
}

/// Cooperative scheduler feeding stream updates to a delegate.
pub struct UpdateQueue<D, Env> {
    inner: Arc<QueueInner<D, Env>>,
}

impl<D, Env> Clone for UpdateQueue<D, Env> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<D: StreamUpdateDelegate, Env: Environment> UpdateQueue<D, Env> {
    /// Create a stopped queue.
    pub fn new(delegate: Arc<D>, env: Env, config: QueueConfig, span: tracing::Span) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                delegate,
                env,
                config,
                pending: Mutex::new(PendingUpdates::default()),
                state: Mutex::new(TickState::default()),
                span,
            }),
        }
    }

    /// Queue a compaction snapshot.
    pub fn enqueue_confirmed_snapshot(&self, stream_id: &StreamId, snapshot: ConfirmedSnapshot) {
        self.inner.lock_pending().entry(stream_id).snapshots.push(snapshot);
        self.inner.check_start_ticking();
    }

    /// Queue a confirmed MLS event.
    pub fn enqueue_confirmed_event(&self, stream_id: &StreamId, event: ConfirmedEvent) {
        self.inner.lock_pending().entry(stream_id).confirmed_events.push(event);
        self.inner.check_start_ticking();
    }

    /// Queue encrypted content for decryption.
    pub fn enqueue_encrypted_content(&self, item: EncryptedContentItem) {
        let stream_id = item.stream_id.clone();
        self.inner.lock_pending().entry(&stream_id).encrypted_content.push(item);
        self.inner.check_start_ticking();
    }

    /// Queue a whole update, merging with any queued work for the stream.
    pub fn enqueue_stream_update(&self, update: StreamUpdate) {
        let stream_id = update.stream_id.clone();
        self.inner.lock_pending().entry(&stream_id).merge(update);
        self.inner.check_start_ticking();
    }

    /// Remove and return the oldest-enqueued stream's update.
    pub fn dequeue_stream_update(&self) -> Option<StreamUpdate> {
        self.inner.lock_pending().pop()
    }

    /// Streams with queued work, oldest first.
    pub fn pending_streams(&self) -> Vec<StreamId> {
        self.inner.lock_pending().order.iter().cloned().collect()
    }

    /// Begin ticking.
    pub fn start(&self) {
        self.inner.lock_state().started = true;
        self.inner.check_start_ticking();
    }

    /// Stop ticking.
    ///
    /// Cancels a pending timer and waits for an in-flight tick. Safe to call
    /// when already stopped.
    pub async fn stop(&self) {
        let in_flight = {
            let mut state = self.inner.lock_state();
            state.started = false;
            match state.task.take() {
                Some(task) if state.running => Some(task),
                Some(task) => {
                    task.abort();
                    None
                },
                None => None,
            }
        };

        let Some(task) = in_flight else {
            return;
        };
        if let Err(e) = task.await {
            tracing::error!(parent: &self.inner.span, error = %e, "in-flight tick failed during stop");
        }
    }

    /// Pause or resume ticking when the client goes to or returns from the
    /// background.
    pub fn set_backgrounded(&self, backgrounded: bool) {
        self.inner.lock_state().backgrounded = backgrounded;
        if !backgrounded {
            self.inner.check_start_ticking();
        }
    }

    /// Whether a tick is scheduled or running.
    pub fn is_ticking(&self) -> bool {
        self.inner.lock_state().task.is_some()
    }

    /// Run one tick inline.
    ///
    /// For manual drivers that never call [`Self::start`]; returns whether a
    /// stream update was processed.
    pub async fn tick(&self) -> bool {
        let update = self.inner.lock_pending().pop();
        match update {
            Some(update) => {
                self.inner.dispatch(update).await;
                true
            },
            None => false,
        }
    }
}

impl<D: StreamUpdateDelegate, Env: Environment> QueueInner<D, Env> {
    fn lock_pending(&self) -> MutexGuard<'_, PendingUpdates> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, TickState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_pause_ticking(&self, state: &TickState) -> bool {
        state.backgrounded || self.lock_pending().is_empty()
    }

    fn check_start_ticking(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if !state.started || state.running || state.task.is_some() {
            return;
        }
        if self.should_pause_ticking(&state) {
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        let inner = Arc::clone(self);
        state.task = Some(tokio::spawn(async move { inner.run_tick(generation).await }));
    }

    async fn run_tick(self: Arc<Self>, generation: u64) {
        self.env.sleep(self.config.delay).await;

        {
            let mut state = self.lock_state();
            if !state.started || state.generation != generation {
                return;
            }
            if state.backgrounded {
                // Work stays queued; resuming schedules a fresh tick
                state.task = None;
                return;
            }
            state.running = true;
        }

        let update = self.lock_pending().pop();
        if let Some(update) = update {
            self.dispatch(update).await;
        }

        {
            let mut state = self.lock_state();
            if state.generation == generation {
                state.running = false;
                state.task = None;
            }
        }
        self.check_start_ticking();
    }

    async fn dispatch(&self, update: StreamUpdate) {
        let stream_id = update.stream_id.clone();
        let started = self.env.now();

        if let Err(e) = self.delegate.handle_stream_update(update).await {
            tracing::error!(
                parent: &self.span,
                stream_id = %stream_id,
                error = %e,
                "stream update failed"
            );
        }

        tracing::trace!(
            parent: &self.span,
            stream_id = %stream_id,
            elapsed_us = self.env.now().duration_since(started).as_micros() as u64,
            "stream update handled"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use cairn_proto::EventId;

    use super::*;
    use crate::{env::SystemEnv, error::LogError};

    fn event(num: u64) -> ConfirmedEvent {
        ConfirmedEvent {
            event_id: EventId::new(format!("e{num}")),
            confirmed_event_num: num,
            miniblock_num: 0,
            payload: None,
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(StreamId, usize)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        completed: AtomicUsize,
        fail_next: AtomicBool,
        work: Duration,
    }

    impl Recorder {
        fn with_work(work: Duration) -> Self {
            Self { work, ..Self::default() }
        }

        fn seen(&self) -> Vec<(StreamId, usize)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StreamUpdateDelegate for Recorder {
        async fn handle_stream_update(&self, update: StreamUpdate) -> Result<(), ProcessorError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            self.seen.lock().unwrap().push((update.stream_id.clone(), update.confirmed_events.len()));
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(ProcessorError::Submission(LogError::Unavailable("test".into())));
            }
            Ok(())
        }
    }

    fn queue(recorder: &Arc<Recorder>) -> UpdateQueue<Recorder, SystemEnv> {
        UpdateQueue::new(
            Arc::clone(recorder),
            SystemEnv,
            QueueConfig::default(),
            tracing::Span::none(),
        )
    }

    #[test]
    fn dequeue_merges_per_stream_in_first_enqueue_order() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        let s1 = StreamId::new("s1");
        let s2 = StreamId::new("s2");

        queue.enqueue_confirmed_event(&s1, event(1));
        queue.enqueue_confirmed_event(&s2, event(2));
        queue.enqueue_confirmed_event(&s1, event(3));

        let first = queue.dequeue_stream_update().unwrap();
        assert_eq!(first.stream_id, s1);
        assert_eq!(first.confirmed_events, vec![event(1), event(3)]);

        let second = queue.dequeue_stream_update().unwrap();
        assert_eq!(second.stream_id, s2);
        assert_eq!(second.confirmed_events, vec![event(2)]);

        assert!(queue.dequeue_stream_update().is_none());
    }

    #[test]
    fn stream_update_merge_appends() {
        let s = StreamId::new("s");
        let mut a = StreamUpdate::new(s.clone());
        a.confirmed_events.push(event(1));
        let mut b = StreamUpdate::new(s);
        b.confirmed_events.push(event(2));
        b.snapshots.push(ConfirmedSnapshot::default());

        a.merge(b);
        assert_eq!(a.confirmed_events, vec![event(1), event(2)]);
        assert_eq!(a.snapshots.len(), 1);
        assert!(!a.is_empty());
    }

    #[test]
    fn stopped_queue_does_not_tick() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.enqueue_confirmed_event(&StreamId::new("s"), event(1));
        assert!(!queue.is_ticking());
        assert_eq!(queue.pending_streams(), vec![StreamId::new("s")]);
    }

    #[tokio::test(start_paused = true)]
    async fn started_queue_drains_one_stream_per_tick() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.start();

        queue.enqueue_confirmed_event(&StreamId::new("a"), event(1));
        queue.enqueue_confirmed_event(&StreamId::new("b"), event(2));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(recorder.seen(), vec![(StreamId::new("a"), 1), (StreamId::new("b"), 1)]);
        assert!(!queue.is_ticking());
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_never_overlap() {
        let recorder = Arc::new(Recorder::with_work(Duration::from_millis(30)));
        let queue = queue(&recorder);
        queue.start();

        for i in 0..5 {
            queue.enqueue_confirmed_event(&StreamId::new(format!("s{i}")), event(i));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(recorder.completed.load(Ordering::SeqCst), 5);
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn delegate_errors_do_not_stop_the_loop() {
        let recorder = Arc::new(Recorder::default());
        recorder.fail_next.store(true, Ordering::SeqCst);
        let queue = queue(&recorder);
        queue.start();

        queue.enqueue_confirmed_event(&StreamId::new("a"), event(1));
        queue.enqueue_confirmed_event(&StreamId::new("b"), event(2));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(recorder.completed.load(Ordering::SeqCst), 2);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_tick() {
        let recorder = Arc::new(Recorder::with_work(Duration::from_millis(200)));
        let queue = queue(&recorder);
        queue.start();

        queue.enqueue_confirmed_event(&StreamId::new("a"), event(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.in_flight.load(Ordering::SeqCst), 1);

        queue.stop().await;
        assert_eq!(recorder.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_timer() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.start();

        queue.enqueue_confirmed_event(&StreamId::new("a"), event(1));
        queue.stop().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(recorder.seen().is_empty());
        assert_eq!(queue.pending_streams(), vec![StreamId::new("a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_idle_returns() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.stop().await;
        queue.start();
        queue.stop().await;
        assert!(!queue.is_ticking());
    }

    #[tokio::test(start_paused = true)]
    async fn backgrounded_queue_keeps_work_until_resumed() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.set_backgrounded(true);
        queue.start();

        queue.enqueue_confirmed_event(&StreamId::new("a"), event(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(recorder.seen().is_empty());

        queue.set_backgrounded(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.seen(), vec![(StreamId::new("a"), 1)]);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn backgrounding_skips_already_scheduled_tick() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.start();

        queue.enqueue_confirmed_event(&StreamId::new("a"), event(1));
        assert!(queue.is_ticking());
        queue.set_backgrounded(true);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(recorder.seen().is_empty());
        assert!(!queue.is_ticking());
        assert_eq!(queue.pending_streams(), vec![StreamId::new("a")]);

        queue.set_backgrounded(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.seen(), vec![(StreamId::new("a"), 1)]);
        queue.stop().await;
    }

    #[tokio::test]
    async fn manual_tick_processes_one_update() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.enqueue_confirmed_event(&StreamId::new("a"), event(1));
        queue.enqueue_confirmed_event(&StreamId::new("b"), event(2));

        assert!(queue.tick().await);
        assert_eq!(recorder.seen(), vec![(StreamId::new("a"), 1)]);
        assert!(queue.tick().await);
        assert!(!queue.tick().await);
    }
}
