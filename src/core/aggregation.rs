//! The dual-timer aggregation loop.
//!
//! A fast main timer assembles one sample per tick into a pending buffer; a
//! slower flush timer swaps the buffer for an empty one and hands the old
//! batch to the transport. A batch that fails to send is logged, counted and
//! dropped.
//!
//! ```text
//!   main tick ──▶ gate ──▶ capture? ──▶ assemble ──▶ buffer.push
//!   flush tick ─▶ take(buffer) ──▶ transport.send_batch
//! ```
//!
//! Each timer runs in its own task and awaits its callback before polling
//! the next tick, so a slow tab query or a slow upload never overlaps with
//! itself. Buffer appends and swaps happen under one mutex, so a sample
//! assembled while a flush is in flight lands in the fresh buffer.

use crate::collector::assembler::SampleAssembler;
use crate::collector::probe::PageProbe;
use crate::collector::snapshot::{FrameCapture, SnapshotGate};
use crate::collector::tracker::SharedInputTracker;
use crate::collector::types::Sample;
use crate::config::CollectionOptions;
use crate::transparency::SharedTransparencyLog;
use crate::transport::Transport;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Everything the loop reads from. Passed in rather than kept in globals.
#[derive(Clone)]
pub struct CollectorContext {
    pub tracker: SharedInputTracker,
    pub probe: Arc<dyn PageProbe>,
    pub capture: Arc<dyn FrameCapture>,
    pub transport: Arc<dyn Transport>,
    pub log: SharedTransparencyLog,
}

/// Lifecycle of an [`AggregationLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// No timers registered
    Idle,
    /// Both timers active
    Running,
    /// Timers cancelled, terminal
    Stopped,
}

/// Result of one flush tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Empty,
    /// The batch was delivered
    Sent(usize),
    /// The transport failed and the batch was discarded
    Dropped(usize),
}

/// Errors from configuring or stopping the loop.
#[derive(Debug)]
pub enum AggregationError {
    AlreadyRunning,
    Stopped,
    InvalidInterval(&'static str),
}

impl std::fmt::Display for AggregationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationError::AlreadyRunning => write!(f, "Aggregation loop is already running"),
            AggregationError::Stopped => write!(f, "Aggregation loop has been stopped"),
            AggregationError::InvalidInterval(name) => {
                write!(f, "Interval '{name}' must be greater than zero")
            }
        }
    }
}

impl std::error::Error for AggregationError {}

/// State shared by the two timer tasks.
pub struct CollectionCycle {
    assembler: SampleAssembler,
    capture: Arc<dyn FrameCapture>,
    transport: Arc<dyn Transport>,
    log: SharedTransparencyLog,
    gate: Mutex<SnapshotGate>,
    buffer: Mutex<Vec<Sample>>,
}

impl CollectionCycle {
    pub fn new(user_id: &str, options: &CollectionOptions, context: &CollectorContext) -> Self {
        Self {
            assembler: SampleAssembler::new(
                user_id,
                options.url,
                context.tracker.clone(),
                context.probe.clone(),
            ),
            capture: context.capture.clone(),
            transport: context.transport.clone(),
            log: context.log.clone(),
            gate: Mutex::new(SnapshotGate::new(
                options.main_interval,
                options.emotions_interval,
            )),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// One main tick: maybe capture a frame, assemble a sample, buffer it.
    pub async fn main_tick(&self) {
        let wants_frame = lock(&self.gate).tick();
        let image = if wants_frame {
            self.capture.capture_frame().await
        } else {
            None
        };

        let sample = self.assembler.assemble(image).await;
        self.log.record_sample(sample.image.is_some());
        lock(&self.buffer).push(sample);
    }

    /// One flush tick: swap the buffer out and send what it held.
    pub async fn flush_tick(&self) -> FlushOutcome {
        let batch = std::mem::take(&mut *lock(&self.buffer));
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let count = batch.len();
        match self.transport.send_batch(&batch).await {
            Ok(()) => {
                tracing::debug!("sent batch of {count} samples");
                self.log.record_batch_sent();
                FlushOutcome::Sent(count)
            }
            Err(e) => {
                tracing::warn!("dropping batch of {count} samples: {e}");
                self.log.record_batch_dropped(count as u64);
                FlushOutcome::Dropped(count)
            }
        }
    }

    /// Number of samples waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub fn user_id(&self) -> &str {
        self.assembler.user_id()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns the timers and the cycle they drive.
pub struct AggregationLoop {
    context: CollectorContext,
    state: LoopState,
    cycle: Option<Arc<CollectionCycle>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AggregationLoop {
    pub fn new(context: CollectorContext) -> Self {
        Self {
            context,
            state: LoopState::Idle,
            cycle: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Start collecting for `user_id`.
    ///
    /// An empty `user_id` leaves the loop idle: no timers start and nothing
    /// is collected. Must be called from within a tokio runtime.
    pub fn configure(
        &mut self,
        user_id: &str,
        options: CollectionOptions,
    ) -> Result<LoopState, AggregationError> {
        match self.state {
            LoopState::Running => return Err(AggregationError::AlreadyRunning),
            LoopState::Stopped => return Err(AggregationError::Stopped),
            LoopState::Idle => {}
        }

        if user_id.trim().is_empty() {
            tracing::info!("no user id, collection stays idle");
            return Ok(LoopState::Idle);
        }
        if options.main_interval.is_zero() {
            return Err(AggregationError::InvalidInterval("mainInterval"));
        }
        if options.send_interval.is_zero() {
            return Err(AggregationError::InvalidInterval("sendInterval"));
        }

        let cycle = Arc::new(CollectionCycle::new(user_id, &options, &self.context));
        let gate = SnapshotGate::new(options.main_interval, options.emotions_interval);
        if gate.captures() {
            tracing::info!(
                "collection started: main {:?}, flush {:?}, frame every {} ticks",
                options.main_interval,
                options.send_interval,
                gate.cycles_per_capture()
            );
        } else {
            tracing::warn!(
                "emotions interval {:?} is shorter than main interval {:?}, no webcam frames will be captured",
                options.emotions_interval,
                options.main_interval
            );
            tracing::info!(
                "collection started: main {:?}, flush {:?}",
                options.main_interval,
                options.send_interval
            );
        }

        let main = cycle.clone();
        self.tasks.push(tokio::spawn(run_timer(
            options.main_interval,
            self.cancel.clone(),
            move || {
                let cycle = main.clone();
                async move { cycle.main_tick().await }
            },
        )));

        let flush = cycle.clone();
        self.tasks.push(tokio::spawn(run_timer(
            options.send_interval,
            self.cancel.clone(),
            move || {
                let cycle = flush.clone();
                async move {
                    cycle.flush_tick().await;
                }
            },
        )));

        self.cycle = Some(cycle);
        self.state = LoopState::Running;
        Ok(self.state)
    }

    /// Cancel both timers, wait for them, and flush what is still pending.
    pub async fn stop(&mut self) -> Result<FlushOutcome, AggregationError> {
        match self.state {
            LoopState::Stopped => return Err(AggregationError::Stopped),
            LoopState::Idle => {
                self.state = LoopState::Stopped;
                return Ok(FlushOutcome::Empty);
            }
            LoopState::Running => {}
        }

        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!("collection timer task failed: {e}");
            }
        }
        self.state = LoopState::Stopped;

        let outcome = match self.cycle {
            Some(ref cycle) => cycle.flush_tick().await,
            None => FlushOutcome::Empty,
        };
        tracing::info!("collection stopped, final flush: {outcome:?}");
        Ok(outcome)
    }

    /// Samples waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.cycle.as_ref().map(|c| c.pending_len()).unwrap_or(0)
    }

    /// The running cycle, if any.
    pub fn cycle(&self) -> Option<&Arc<CollectionCycle>> {
        self.cycle.as_ref()
    }
}

/// Fire `on_tick` every `period` (first fire one period after start) until
/// `cancel` is triggered. Late ticks are delayed, never bunched.
async fn run_timer<F, Fut>(period: Duration, cancel: CancellationToken, mut on_tick: F)
where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => on_tick().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::types::{ScrollLocation, WindowSize};
    use crate::transparency::create_shared_log;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct BlankProbe;

    #[async_trait]
    impl PageProbe for BlankProbe {
        async fn active_url(&self) -> Option<String> {
            Some("https://example.com/path".to_string())
        }
        async fn scroll_location(&self) -> Option<ScrollLocation> {
            None
        }
        async fn window_size(&self) -> Option<WindowSize> {
            None
        }
    }

    struct CountingCapture;

    #[async_trait]
    impl FrameCapture for CountingCapture {
        async fn capture_frame(&self) -> Option<String> {
            Some("data:image/jpeg;base64,AA".to_string())
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        batches: Mutex<Vec<Vec<Sample>>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_batch(&self, batch: &[Sample]) -> Result<(), TransportError> {
            self.batches.lock().unwrap().push(batch.to_vec());
            if self.fail.load(Ordering::SeqCst) {
                Err(TransportError::Network("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Holds every send until released.
    #[derive(Default)]
    struct ParkedTransport {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        batches: Mutex<Vec<Vec<Sample>>>,
    }

    #[async_trait]
    impl Transport for ParkedTransport {
        async fn send_batch(&self, batch: &[Sample]) -> Result<(), TransportError> {
            self.batches.lock().unwrap().push(batch.to_vec());
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    fn context(transport: Arc<RecordingTransport>) -> CollectorContext {
        CollectorContext {
            tracker: SharedInputTracker::new(),
            probe: Arc::new(BlankProbe),
            capture: Arc::new(CountingCapture),
            transport,
            log: create_shared_log(),
        }
    }

    #[tokio::test]
    async fn test_twelve_ticks_then_one_flush() {
        let transport = Arc::new(RecordingTransport::default());
        let cycle = CollectionCycle::new(
            "user-1",
            &CollectionOptions::default(),
            &context(transport.clone()),
        );

        for _ in 0..12 {
            cycle.main_tick().await;
        }
        assert_eq!(cycle.pending_len(), 12);
        assert!(transport.batches.lock().unwrap().is_empty());

        assert_eq!(cycle.flush_tick().await, FlushOutcome::Sent(12));
        assert_eq!(cycle.pending_len(), 0);

        let batches = transport.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 12);
        assert!(batches[0].iter().all(|s| s.user_id == "user-1"));
    }

    #[tokio::test]
    async fn test_one_frame_per_ten_ticks() {
        let transport = Arc::new(RecordingTransport::default());
        let cycle = CollectionCycle::new(
            "user-1",
            &CollectionOptions::default(),
            &context(transport.clone()),
        );

        for _ in 0..25 {
            cycle.main_tick().await;
        }
        cycle.flush_tick().await;

        let batches = transport.batches.lock().unwrap();
        let with_frame: Vec<usize> = batches[0]
            .iter()
            .enumerate()
            .filter(|(_, s)| s.image.is_some())
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(with_frame, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_empty_buffer_skips_transport() {
        let transport = Arc::new(RecordingTransport::default());
        let cycle = CollectionCycle::new(
            "user-1",
            &CollectionOptions::default(),
            &context(transport.clone()),
        );

        assert_eq!(cycle.flush_tick().await, FlushOutcome::Empty);
        assert!(transport.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped_not_retried() {
        let transport = Arc::new(RecordingTransport::default());
        transport.fail.store(true, Ordering::SeqCst);
        let ctx = context(transport.clone());
        let log = ctx.log.clone();
        let cycle = CollectionCycle::new("user-1", &CollectionOptions::default(), &ctx);

        for _ in 0..3 {
            cycle.main_tick().await;
        }
        assert_eq!(cycle.flush_tick().await, FlushOutcome::Dropped(3));
        assert_eq!(cycle.pending_len(), 0);

        transport.fail.store(false, Ordering::SeqCst);
        cycle.main_tick().await;
        assert_eq!(cycle.flush_tick().await, FlushOutcome::Sent(1));

        let batches = transport.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(log.stats().samples_dropped, 3);
    }

    #[tokio::test]
    async fn test_sample_during_inflight_send_goes_to_next_batch() {
        let transport = Arc::new(ParkedTransport::default());
        let ctx = CollectorContext {
            tracker: SharedInputTracker::new(),
            probe: Arc::new(BlankProbe),
            capture: Arc::new(CountingCapture),
            transport: transport.clone(),
            log: create_shared_log(),
        };
        let cycle = Arc::new(CollectionCycle::new(
            "user-1",
            &CollectionOptions::default(),
            &ctx,
        ));

        for _ in 0..3 {
            cycle.main_tick().await;
        }
        let flush = {
            let cycle = cycle.clone();
            tokio::spawn(async move { cycle.flush_tick().await })
        };

        // The send is parked with the swapped-out batch.
        transport.entered.notified().await;
        assert_eq!(cycle.pending_len(), 0);
        let late_tick = tokio::time::timeout(Duration::from_secs(1), cycle.main_tick()).await;
        assert!(late_tick.is_ok(), "main tick must not wait on the send");
        assert_eq!(cycle.pending_len(), 1);

        transport.release.notify_one();
        assert_eq!(flush.await.unwrap(), FlushOutcome::Sent(3));
        {
            let batches = transport.batches.lock().unwrap();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].len(), 3);
        }
        assert_eq!(cycle.pending_len(), 1);

        let next = {
            let cycle = cycle.clone();
            tokio::spawn(async move { cycle.flush_tick().await })
        };
        transport.entered.notified().await;
        transport.release.notify_one();
        assert_eq!(next.await.unwrap(), FlushOutcome::Sent(1));
        let batches = transport.batches.lock().unwrap();
        assert_eq!(batches[1].len(), 1);
        assert!(batches[1][0].timestamp >= batches[0][2].timestamp);
    }

    #[tokio::test]
    async fn test_short_emotions_interval_captures_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let options = CollectionOptions {
            main_interval: Duration::from_millis(1000),
            emotions_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let cycle = CollectionCycle::new("user-1", &options, &context(transport.clone()));

        for _ in 0..5 {
            cycle.main_tick().await;
        }
        assert_eq!(cycle.flush_tick().await, FlushOutcome::Sent(5));
        let batches = transport.batches.lock().unwrap();
        assert!(batches[0].iter().all(|s| s.image.is_none()));
    }

    #[tokio::test]
    async fn test_empty_user_id_stays_idle() {
        let transport = Arc::new(RecordingTransport::default());
        let mut aggregation = AggregationLoop::new(context(transport));

        let state = aggregation
            .configure("", CollectionOptions::default())
            .unwrap();
        assert_eq!(state, LoopState::Idle);
        assert!(aggregation.cycle().is_none());
        assert_eq!(aggregation.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_zero_main_interval_is_rejected() {
        let transport = Arc::new(RecordingTransport::default());
        let mut aggregation = AggregationLoop::new(context(transport));
        let options = CollectionOptions {
            main_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            aggregation.configure("user-1", options),
            Err(AggregationError::InvalidInterval(_))
        ));
        assert_eq!(aggregation.state(), LoopState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_drive_sampling_and_flush() {
        let transport = Arc::new(RecordingTransport::default());
        let mut aggregation = AggregationLoop::new(context(transport.clone()));
        let options = CollectionOptions {
            main_interval: Duration::from_millis(100),
            emotions_interval: Duration::from_millis(1000),
            send_interval: Duration::from_millis(5050),
            ..Default::default()
        };

        assert_eq!(
            aggregation.configure("user-1", options.clone()).unwrap(),
            LoopState::Running
        );
        assert!(matches!(
            aggregation.configure("user-1", options),
            Err(AggregationError::AlreadyRunning)
        ));

        tokio::time::sleep(Duration::from_millis(1250)).await;
        assert_eq!(aggregation.pending_len(), 12);
        assert!(transport.batches.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(5075 - 1250)).await;
        {
            let batches = transport.batches.lock().unwrap();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].len(), 50);
        }
        assert_eq!(aggregation.pending_len(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let outcome = aggregation.stop().await.unwrap();
        assert_eq!(outcome, FlushOutcome::Sent(3));
        assert_eq!(aggregation.state(), LoopState::Stopped);
        assert_eq!(transport.batches.lock().unwrap().len(), 2);

        assert!(matches!(
            aggregation.configure("user-1", CollectionOptions::default()),
            Err(AggregationError::Stopped)
        ));
    }
}
