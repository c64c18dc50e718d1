//! Worker loop: bounded-concurrency dispatch of popped jobs
//!
//! One control task owns all loop bookkeeping (in-flight map, throttle
//! ring, disposed flag) and is fed by an event channel. Pops, consumer
//! callbacks and per-job timers each run as their own tasks and re-enter
//! the loop through that channel, so any number of them may be outstanding
//! while the bookkeeping stays single-threaded.

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::job::{JobRecord, JobView};
use crate::outcome::{Outcome, OutcomeProcessor};
use crate::pop::PopModel;
use crate::queue::JobQueue;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Extra slots in the throttle ring beyond the concurrency target.
const BUFFER_GRACE: usize = 5;

/// Window inside which a full ring of error re-entries means trouble.
const THROTTLE_LIMIT: Duration = Duration::from_secs(5);

/// Pause once throttling engages.
const THROTTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Unique worker identifier
pub type WorkerId = Uuid;

/// Consumer callback invoked once per dispatch attempt.
///
/// `Ok(())` reports success; `Err` reports a user error, recorded in the
/// job's process item. The callback races a `processTimeout` timer: if the
/// timer fires first the attempt is a ghost, and whatever the callback
/// eventually returns is dropped.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process one job attempt.
    async fn handle(&self, job: JobView, data: Option<serde_json::Value>) -> anyhow::Result<()>;
}

/// Adapter turning a plain async function or closure into a [`JobHandler`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(JobView, Option<serde_json::Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, job: JobView, data: Option<serde_json::Value>) -> anyhow::Result<()> {
        (self.0)(job, data).await
    }
}

/// Wrap an async function or closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(JobView, Option<serde_json::Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    HandlerFn(f)
}

/// Events re-entering the control task
enum Event {
    PopDone(Result<JobRecord>),
    Finished { job_id: String, outcome: Outcome },
    TimedOut { job_id: String },
    ThrottleExpired,
    Dispose,
}

/// Worker processing jobs for a set of job names
pub struct Worker {
    /// Worker ID
    id: WorkerId,

    /// Job names this worker pops
    names: Vec<String>,

    /// Configuration
    config: WorkerConfig,

    /// Queue this worker runs against
    queue: JobQueue,

    /// Consumer callback
    handler: Arc<dyn JobHandler>,

    /// Event channel into the control task
    tx: mpsc::UnboundedSender<Event>,

    /// Receiver side, taken by `start`
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,

    /// Shared counters
    stats: Arc<StatsInner>,

    /// Short-circuits every entry point once set
    disposed: Arc<AtomicBool>,
}

impl Worker {
    /// Create a worker. Fails synchronously on invalid inputs: no job
    /// names, an empty job name, or a zero concurrency target.
    pub fn new(
        queue: JobQueue,
        names: Vec<String>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Result<Self> {
        if names.is_empty() {
            return Err(Error::BadArgument("no job names to process".to_string()));
        }
        if names.iter().any(|name| name.is_empty()) {
            return Err(Error::BadArgument("empty job name".to_string()));
        }
        if config.concurrent_jobs == 0 {
            return Err(Error::BadArgument(
                "concurrent_jobs must be at least 1".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = WorkerId::new_v4();
        info!(worker_id = %id, names = ?names, "worker created");

        Ok(Self {
            id,
            names,
            config,
            queue,
            handler,
            tx,
            rx: Mutex::new(Some(rx)),
            stats: Arc::new(StatsInner::default()),
            disposed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Worker id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Job names this worker pops.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Start the control task. Can be called once.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let rx = self
            .rx
            .lock()
            .expect("worker receiver lock poisoned")
            .take()
            .ok_or_else(|| Error::BadArgument("worker already started".to_string()))?;

        let store = self.queue.store().clone();
        let router = self.queue.router().clone();
        let state = LoopState {
            id: self.id,
            names: self.names.clone(),
            config: self.config.clone(),
            handler: Arc::clone(&self.handler),
            pop: PopModel::new(
                self.queue.pool().clone(),
                self.queue.keys().clone(),
                store.clone(),
            ),
            outcomes: OutcomeProcessor::new(store, router),
            tx: self.tx.clone(),
            in_flight: HashMap::new(),
            pending_pops: 0,
            pop_tasks: Vec::new(),
            ring: ThrottleRing::new(self.config.concurrent_jobs + BUFFER_GRACE, THROTTLE_LIMIT),
            throttled: false,
            stats: Arc::clone(&self.stats),
            disposed: Arc::clone(&self.disposed),
        };

        Ok(tokio::spawn(state.run(rx)))
    }

    /// Dispose the worker: stop popping, clear pending timers, abandon
    /// in-flight jobs (they stay `processing` until ghost recovery).
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Event::Dispose);
    }

    /// Snapshot of the worker's counters.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            jobs_processed: self.stats.processed.load(Ordering::SeqCst),
            jobs_succeeded: self.stats.succeeded.load(Ordering::SeqCst),
            jobs_failed: self.stats.failed.load(Ordering::SeqCst),
            jobs_ghosted: self.stats.ghosted.load(Ordering::SeqCst),
            in_flight: self.stats.in_flight.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("names", &self.names)
            .field("concurrent_jobs", &self.config.concurrent_jobs)
            .finish()
    }
}

/// A leased job being processed
struct InFlight {
    record: JobRecord,
    timer: JoinHandle<()>,
}

/// All bookkeeping, owned by the control task
struct LoopState {
    id: WorkerId,
    names: Vec<String>,
    config: WorkerConfig,
    handler: Arc<dyn JobHandler>,
    pop: PopModel,
    outcomes: OutcomeProcessor,
    tx: mpsc::UnboundedSender<Event>,
    in_flight: HashMap<String, InFlight>,
    pending_pops: usize,
    pop_tasks: Vec<JoinHandle<()>>,
    ring: ThrottleRing,
    throttled: bool,
    stats: Arc<StatsInner>,
    disposed: Arc<AtomicBool>,
}

impl LoopState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        info!(
            worker_id = %self.id,
            names = ?self.names,
            concurrent = self.config.concurrent_jobs,
            "worker running"
        );

        self.fill();

        while let Some(event) = rx.recv().await {
            match event {
                Event::Dispose => {
                    self.shutdown();
                    break;
                }
                _ if self.disposed.load(Ordering::SeqCst) => {
                    // dispose raced ahead of this event
                }
                Event::PopDone(result) => {
                    self.pending_pops = self.pending_pops.saturating_sub(1);
                    self.on_pop(result);
                }
                Event::Finished { job_id, outcome } => {
                    self.complete(&job_id, outcome).await;
                    self.fill();
                }
                Event::TimedOut { job_id } => {
                    self.complete(&job_id, Outcome::timeout()).await;
                    self.fill();
                }
                Event::ThrottleExpired => {
                    self.throttled = false;
                    self.ring.clear();
                    self.fill();
                }
            }
        }
    }

    /// Keep enough pops outstanding to reach the concurrency target.
    fn fill(&mut self) {
        if self.disposed.load(Ordering::SeqCst) || self.throttled {
            return;
        }

        self.pop_tasks.retain(|handle| !handle.is_finished());

        while self.in_flight.len() + self.pending_pops < self.config.concurrent_jobs {
            self.pending_pops += 1;
            let pop = self.pop.clone();
            let names = self.names.clone();
            let timeout = self.config.pop_timeout();
            let tx = self.tx.clone();

            self.pop_tasks.push(tokio::spawn(async move {
                let result = pop.pop(&names, timeout).await;
                let _ = tx.send(Event::PopDone(result));
            }));
        }
    }

    fn on_pop(&mut self, result: Result<JobRecord>) {
        match result {
            Ok(record) => {
                self.dispatch(record);
                self.fill();
            }
            Err(Error::Empty) => {
                // nothing arrived before the pop timeout, just re-pop
                self.fill();
            }
            Err(err) => {
                error!(worker_id = %self.id, error = %err, "pop failed");

                if self.ring.record(Instant::now()) && !self.throttled {
                    self.throttled = true;
                    warn!(
                        worker_id = %self.id,
                        pause_ms = THROTTLE_TIMEOUT.as_millis() as u64,
                        "pop failures arriving too fast, throttling"
                    );
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(THROTTLE_TIMEOUT).await;
                        let _ = tx.send(Event::ThrottleExpired);
                    });
                }

                if !self.throttled {
                    self.fill();
                }
            }
        }
    }

    /// Hand a leased job to the consumer callback and arm its timer.
    fn dispatch(&mut self, record: JobRecord) {
        let job_id = record.id.clone();
        let timeout = Duration::from_millis(record.process_timeout);

        let timer = {
            let tx = self.tx.clone();
            let id = job_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(Event::TimedOut { job_id: id });
            })
        };

        let handler = Arc::clone(&self.handler);
        let tx = self.tx.clone();
        let view = record.public_view();
        let data = record.data.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(handler.handle(view, data))
                .catch_unwind()
                .await;
            let outcome = match result {
                Ok(Ok(())) => Outcome::success(),
                Ok(Err(err)) => Outcome::error(err.to_string()),
                Err(payload) => {
                    error!(job_id = %id, "job handler panicked");
                    Outcome::error(panic_message(payload.as_ref()))
                }
            };
            let _ = tx.send(Event::Finished {
                job_id: id,
                outcome,
            });
        });

        debug!(
            worker_id = %self.id,
            job_id = %job_id,
            job_name = %record.name,
            attempt = record.attempt_count(),
            "job dispatched"
        );
        self.in_flight.insert(job_id, InFlight { record, timer });
        self.stats
            .in_flight
            .store(self.in_flight.len() as u64, Ordering::SeqCst);
    }

    /// Apply an attempt outcome. Complete-once: the first of the handler
    /// completion and the timeout timer wins; the loser finds the job id
    /// gone from the in-flight map and is dropped here.
    async fn complete(&mut self, job_id: &str, outcome: Outcome) {
        let Some(entry) = self.in_flight.remove(job_id) else {
            trace!(worker_id = %self.id, job_id, "completion for job no longer in flight, dropped");
            return;
        };
        entry.timer.abort();

        self.stats
            .in_flight
            .store(self.in_flight.len() as u64, Ordering::SeqCst);
        self.stats.processed.fetch_add(1, Ordering::SeqCst);
        if outcome.success {
            self.stats.succeeded.fetch_add(1, Ordering::SeqCst);
        } else if outcome.timed_out {
            self.stats.ghosted.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stats.failed.fetch_add(1, Ordering::SeqCst);
        }

        let mut record = entry.record;
        if let Err(err) = self.outcomes.process(&mut record, &outcome).await {
            // The job stays `processing`; ghost recovery resurrects it.
            error!(
                worker_id = %self.id,
                job_id = %record.id,
                error = %err,
                "failed to persist job outcome"
            );
        }
    }

    fn shutdown(&mut self) {
        for handle in self.pop_tasks.drain(..) {
            handle.abort();
        }
        for (_, entry) in self.in_flight.drain() {
            entry.timer.abort();
        }
        self.stats.in_flight.store(0, Ordering::SeqCst);
        info!(worker_id = %self.id, "worker disposed, in-flight jobs abandoned");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job handler panicked".to_string()
    }
}

/// Ring of recent error-path loop re-entries.
///
/// Holds the last `capacity` entries; once full, a new entry whose oldest
/// neighbor is still inside the window means the loop is spinning on
/// failures and throttling should engage.
struct ThrottleRing {
    capacity: usize,
    window: Duration,
    entries: VecDeque<Instant>,
}

impl ThrottleRing {
    fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Record a re-entry; returns true when throttling should engage.
    fn record(&mut self, now: Instant) -> bool {
        self.entries.push_back(now);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        if self.entries.len() < self.capacity {
            return false;
        }
        match self.entries.front() {
            Some(oldest) => now.duration_since(*oldest) < self.window,
            None => false,
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Default)]
struct StatsInner {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    ghosted: AtomicU64,
    in_flight: AtomicU64,
}

/// Worker counters snapshot
#[derive(Debug, Clone)]
pub struct WorkerStats {
    /// Total attempts whose outcome this worker recorded
    pub jobs_processed: u64,

    /// Attempts that succeeded
    pub jobs_succeeded: u64,

    /// Attempts that failed with a user error
    pub jobs_failed: u64,

    /// Attempts that ghosted
    pub jobs_ghosted: u64,

    /// Jobs currently leased
    pub in_flight: u64,
}

impl WorkerStats {
    /// Fraction of recorded attempts that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.jobs_processed == 0 {
            0.0
        } else {
            self.jobs_succeeded as f64 / self.jobs_processed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobOptions, QueueConfig, RedisConfig};
    use crate::connection::RedisPool;
    use crate::job::{now_ms, JobState};
    use crate::scheduler::Scheduler;
    use crate::config::SchedulerConfig;
    use std::sync::atomic::AtomicU32;
    use uuid::Uuid;

    async fn test_queue() -> Option<JobQueue> {
        let pool = RedisPool::new(RedisConfig::development()).await.ok()?;
        let config = QueueConfig::with_namespace(format!("convtest:{}", Uuid::new_v4().simple()));
        Some(JobQueue::new(pool, &config))
    }

    fn fast_config(concurrent_jobs: usize) -> WorkerConfig {
        WorkerConfig {
            concurrent_jobs,
            pop_timeout_ms: 500,
        }
    }

    async fn wait_for_terminal(queue: &JobQueue, id: &str, max: Duration) -> JobRecord {
        let deadline = Instant::now() + max;
        loop {
            let record = queue.fetch(id).await.unwrap();
            if record.complete {
                return record;
            }
            assert!(
                Instant::now() < deadline,
                "job {} did not reach a terminal state within {:?} (state: {})",
                id,
                max,
                record.state
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn queue_len(queue: &JobQueue, name: &str) -> i64 {
        let mut conn = queue.pool().shared().await.unwrap();
        let len: i64 = redis::cmd("LLEN")
            .arg(queue.keys().queue(name))
            .query_async(&mut conn)
            .await
            .unwrap();
        len
    }

    #[test]
    fn test_throttle_ring_engages_only_when_full_and_fast() {
        let base = Instant::now();
        let mut ring = ThrottleRing::new(3, Duration::from_secs(5));

        assert!(!ring.record(base));
        assert!(!ring.record(base + Duration::from_millis(10)));
        // Ring is full and the oldest entry is recent: engage.
        assert!(ring.record(base + Duration::from_millis(20)));

        ring.clear();
        assert!(!ring.record(base + Duration::from_secs(10)));
    }

    #[test]
    fn test_throttle_ring_slow_failures_do_not_engage() {
        let base = Instant::now();
        let mut ring = ThrottleRing::new(3, Duration::from_secs(5));

        assert!(!ring.record(base));
        assert!(!ring.record(base + Duration::from_secs(6)));
        // Oldest visible entry is 13s before this one: outside the window.
        assert!(!ring.record(base + Duration::from_secs(13)));
        // Still spread out once the ring slides forward.
        assert!(!ring.record(base + Duration::from_secs(14)));
        // A genuine burst engages: the whole ring now sits inside 1.5s.
        assert!(ring.record(base + Duration::from_millis(14_500)));
    }

    #[test]
    fn test_worker_stats_success_rate() {
        let stats = WorkerStats {
            jobs_processed: 4,
            jobs_succeeded: 3,
            jobs_failed: 1,
            jobs_ghosted: 0,
            in_flight: 0,
        };
        assert!((stats.success_rate() - 0.75).abs() < f64::EPSILON);

        let empty = WorkerStats {
            jobs_processed: 0,
            jobs_succeeded: 0,
            jobs_failed: 0,
            jobs_ghosted: 0,
            in_flight: 0,
        };
        assert_eq!(empty.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_worker_rejects_bad_arguments() {
        let Some(queue) = test_queue().await else { return };
        let handler = Arc::new(handler_fn(|_job, _data| async move { anyhow::Ok(()) }));

        let err = Worker::new(queue.clone(), vec![], handler.clone(), fast_config(1)).unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));

        let err = Worker::new(
            queue.clone(),
            vec!["".to_string()],
            handler.clone(),
            fast_config(1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));

        let err =
            Worker::new(queue, vec!["mail".to_string()], handler, fast_config(0)).unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));
    }

    #[tokio::test]
    async fn test_worker_starts_once() {
        let Some(queue) = test_queue().await else { return };
        let handler = Arc::new(handler_fn(|_job, _data| async move { anyhow::Ok(()) }));
        let worker = Worker::new(queue, vec!["mail".to_string()], handler, fast_config(1)).unwrap();

        let _handle = worker.start().unwrap();
        let err = worker.start().unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));
        worker.dispose();
    }

    #[tokio::test]
    async fn test_happy_path_success() {
        let Some(queue) = test_queue().await else { return };
        let job = queue
            .create(
                "mail",
                Some(serde_json::json!("hi")),
                JobOptions::default().with_retry(3),
            )
            .await
            .unwrap();

        let seen_data = Arc::new(Mutex::new(None));
        let seen = seen_data.clone();
        let handler = Arc::new(handler_fn(move |job: JobView, data| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = Some((job.name.clone(), data));
                anyhow::Ok(())
            }
        }));

        let worker =
            Worker::new(queue.clone(), vec!["mail".to_string()], handler, fast_config(1)).unwrap();
        let _handle = worker.start().unwrap();

        let record = wait_for_terminal(&queue, &job.id, Duration::from_secs(5)).await;
        worker.dispose();

        assert_eq!(record.state, JobState::Success);
        assert!(record.complete);
        assert!(record.success);
        assert!(record.finish_time.is_some());
        assert_eq!(record.runs.len(), 1);
        assert_eq!(record.runs[0].state, JobState::Success);
        assert_eq!(queue_len(&queue, "mail").await, 0);

        let (name, data) = seen_data.lock().unwrap().clone().unwrap();
        assert_eq!(name, "mail");
        assert_eq!(data, Some(serde_json::json!("hi")));

        let stats = worker.stats();
        assert_eq!(stats.jobs_processed, 1);
        assert_eq!(stats.jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let Some(queue) = test_queue().await else { return };
        let job = queue
            .create("mail", None, JobOptions::default().with_retry(3))
            .await
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_h = calls.clone();
        let handler = Arc::new(handler_fn(move |_job, _data| {
            let calls = calls_h.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow::anyhow!("oops"))
                } else {
                    Ok(())
                }
            }
        }));

        let worker =
            Worker::new(queue.clone(), vec!["mail".to_string()], handler, fast_config(1)).unwrap();
        let _handle = worker.start().unwrap();

        let record = wait_for_terminal(&queue, &job.id, Duration::from_secs(5)).await;
        worker.dispose();

        assert_eq!(record.state, JobState::Success);
        assert_eq!(record.runs.len(), 2);
        assert_eq!(record.runs[0].state, JobState::Fail);
        assert_eq!(record.runs[0].error_message.as_deref(), Some("oops"));
        assert_eq!(record.runs[1].state, JobState::Success);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails() {
        let Some(queue) = test_queue().await else { return };
        let job = queue
            .create("mail", None, JobOptions::default().with_retry(2))
            .await
            .unwrap();

        let handler = Arc::new(handler_fn(|_job, _data| async move {
            Err(anyhow::anyhow!("always broken"))
        }));

        let worker =
            Worker::new(queue.clone(), vec!["mail".to_string()], handler, fast_config(1)).unwrap();
        let _handle = worker.start().unwrap();

        let record = wait_for_terminal(&queue, &job.id, Duration::from_secs(5)).await;
        worker.dispose();

        assert_eq!(record.state, JobState::Fail);
        assert!(!record.success);
        assert_eq!(record.runs.len(), 3);
        assert!(record
            .runs
            .iter()
            .all(|run| run.state == JobState::Fail));
        assert_eq!(queue_len(&queue, "mail").await, 0);
    }

    #[tokio::test]
    async fn test_ghost_once_then_succeed() {
        let Some(queue) = test_queue().await else { return };
        let job = queue
            .create(
                "mail",
                None,
                JobOptions::default()
                    .with_ghost_retry(1)
                    .with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_h = calls.clone();
        let handler = Arc::new(handler_fn(move |_job, _data| {
            let calls = calls_h.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    // never report in time
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                anyhow::Ok(())
            }
        }));

        let worker =
            Worker::new(queue.clone(), vec!["mail".to_string()], handler, fast_config(1)).unwrap();
        let _handle = worker.start().unwrap();

        let record = wait_for_terminal(&queue, &job.id, Duration::from_secs(10)).await;
        worker.dispose();

        assert_eq!(record.state, JobState::Success);
        assert_eq!(record.runs.len(), 2);
        assert_eq!(record.runs[0].state, JobState::Ghost);
        assert_eq!(record.runs[1].state, JobState::Success);

        let stats = worker.stats();
        assert_eq!(stats.jobs_ghosted, 1);
        assert_eq!(stats.jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn test_ghost_exhaustion_fails() {
        let Some(queue) = test_queue().await else { return };
        let job = queue
            .create(
                "mail",
                None,
                JobOptions::default()
                    .with_ghost_retry(1)
                    .with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap();

        let handler = Arc::new(handler_fn(|_job, _data| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            anyhow::Ok(())
        }));

        let worker =
            Worker::new(queue.clone(), vec!["mail".to_string()], handler, fast_config(1)).unwrap();
        let _handle = worker.start().unwrap();

        let record = wait_for_terminal(&queue, &job.id, Duration::from_secs(10)).await;
        worker.dispose();

        assert_eq!(record.state, JobState::Fail);
        assert_eq!(record.runs.len(), 2);
        assert!(record.runs.iter().all(|run| run.state == JobState::Ghost));
    }

    #[tokio::test]
    async fn test_timeout_without_ghost_retry_fails_and_late_result_is_dropped() {
        let Some(queue) = test_queue().await else { return };
        let job = queue
            .create(
                "mail",
                None,
                JobOptions::default().with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        let handler = Arc::new(handler_fn(|_job, _data| async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            anyhow::Ok(())
        }));

        let worker =
            Worker::new(queue.clone(), vec!["mail".to_string()], handler, fast_config(1)).unwrap();
        let _handle = worker.start().unwrap();

        let record = wait_for_terminal(&queue, &job.id, Duration::from_secs(5)).await;

        assert_eq!(record.state, JobState::Fail);
        assert_eq!(record.runs.len(), 1);
        assert_eq!(record.runs[0].state, JobState::Ghost);

        // Let the abandoned handler finish; its late success must not
        // resurrect the job.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let after = queue.fetch(&job.id).await.unwrap();
        assert_eq!(after.state, JobState::Fail);
        assert_eq!(after.runs.len(), 1);

        let stats = worker.stats();
        assert_eq!(stats.jobs_processed, 1);
        assert_eq!(stats.jobs_ghosted, 1);
        worker.dispose();
    }

    #[tokio::test]
    async fn test_panicking_handler_is_an_error_outcome() {
        let Some(queue) = test_queue().await else { return };
        let job = queue
            .create("mail", None, JobOptions::default())
            .await
            .unwrap();

        let handler = Arc::new(handler_fn(|_job, _data| async move { panic!("boom") }));

        let worker =
            Worker::new(queue.clone(), vec!["mail".to_string()], handler, fast_config(1)).unwrap();
        let _handle = worker.start().unwrap();

        let record = wait_for_terminal(&queue, &job.id, Duration::from_secs(5)).await;

        assert_eq!(record.state, JobState::Fail);
        assert_eq!(record.runs[0].state, JobState::Fail);
        assert_eq!(record.runs[0].error_message.as_deref(), Some("boom"));

        // The loop survives the panic and keeps processing.
        let second = queue
            .create("mail", None, JobOptions::default())
            .await
            .unwrap();
        let record = wait_for_terminal(&queue, &second.id, Duration::from_secs(5)).await;
        assert_eq!(record.state, JobState::Fail);
        worker.dispose();
    }

    #[tokio::test]
    async fn test_concurrency_target_is_reached() {
        let Some(queue) = test_queue().await else { return };

        for _ in 0..3 {
            queue
                .create("mail", None, JobOptions::default())
                .await
                .unwrap();
        }

        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let active_h = active.clone();
        let peak_h = peak.clone();
        let handler = Arc::new(handler_fn(move |_job, _data| {
            let active = active_h.clone();
            let peak = peak_h.clone();
            async move {
                let current = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(400)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        }));

        let worker =
            Worker::new(queue.clone(), vec!["mail".to_string()], handler, fast_config(3)).unwrap();
        let _handle = worker.start().unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        worker.dispose();

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(queue.state_count(JobState::Success).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_scheduled_job_runs_after_due_time() {
        let Some(queue) = test_queue().await else { return };

        let due = now_ms() + 200;
        let job = queue
            .create("mail", None, JobOptions::default().schedule_at(due))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Delayed);

        let scheduler = Arc::new(Scheduler::new(
            &queue,
            SchedulerConfig {
                tick_interval_ms: 50,
                ..SchedulerConfig::default()
            },
        ));
        let scheduler_handle = scheduler.clone().start();

        let handler = Arc::new(handler_fn(|_job, _data| async move { anyhow::Ok(()) }));
        let worker =
            Worker::new(queue.clone(), vec!["mail".to_string()], handler, fast_config(1)).unwrap();
        let _handle = worker.start().unwrap();

        let record = wait_for_terminal(&queue, &job.id, Duration::from_secs(10)).await;
        worker.dispose();
        scheduler.stop();
        let _ = scheduler_handle.await;

        assert_eq!(record.state, JobState::Success);
        assert_eq!(record.runs.len(), 1);
        // The attempt could not have started before the due time.
        assert!(record.runs[0].start_time + 25 >= due);
    }

    #[tokio::test]
    async fn test_disposed_worker_pops_nothing() {
        let Some(queue) = test_queue().await else { return };

        let handler = Arc::new(handler_fn(|_job, _data| async move { anyhow::Ok(()) }));
        let worker =
            Worker::new(queue.clone(), vec!["mail".to_string()], handler, fast_config(1)).unwrap();
        let handle = worker.start().unwrap();

        worker.dispose();
        let _ = handle.await;

        let job = queue
            .create("mail", None, JobOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let record = queue.fetch(&job.id).await.unwrap();
        assert_eq!(record.state, JobState::New);
        assert_eq!(queue_len(&queue, "mail").await, 1);
    }
}
