//! §4.E Worker Pool: lifecycle, the dispatcher task, and the per-worker
//! execution loop with panic recovery.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{WharfError, WharfResult};
use crate::job::{JobStatus, Timestamp};
use crate::queue::{ClaimedJob, JobQueue};
use crate::registry::{HandlerOutcome, TypeRegistry};

/// Returns the caller's clock as nanoseconds since the Unix epoch — the
/// "caller's clock" half of the time-source split described in the design
/// notes. Reservation/stale-pool comparisons use the store's clock
/// instead, fetched inside the relevant script.
pub fn now_ns() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_nanos() as i64
}

/// Tunables for a [`Pool`]. All fields fall back to their defaults on
/// `Default::default()`; `PoolConfig::new()` is identical to that.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker tasks. Defaults to the number of available CPU
    /// cores.
    pub num_workers: usize,
    /// Maximum jobs reserved per `popNextJobs` call. Defaults to
    /// `num_workers`.
    pub batch_size: usize,
    /// Minimum delay between reservation polls.
    pub min_wait: Duration,
    /// How often this pool renews its own heartbeat.
    pub heartbeat_interval: Duration,
    /// How long another pool's heartbeat may go unrenewed before it's
    /// considered stale and purged.
    pub stale_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let num_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let heartbeat_interval = Duration::from_secs(2);
        Self {
            num_workers,
            batch_size: num_workers,
            min_wait: Duration::from_millis(200),
            heartbeat_interval,
            stale_timeout: heartbeat_interval * 5,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn with_min_wait(mut self, d: Duration) -> Self {
        self.min_wait = d;
        self
    }

    pub fn with_heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d;
        self
    }

    pub fn with_stale_timeout(mut self, d: Duration) -> Self {
        self.stale_timeout = d;
        self
    }
}

/// A pool's position in its lifecycle. Transitions are unidirectional:
/// `New -> Running -> Draining -> Closed`. Re-`start`ing a closed pool is
/// a [`WharfError::Misconfiguration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    New,
    Running,
    Draining,
    Closed,
}

const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_CLOSED: u8 = 3;

struct AtomicPoolState(std::sync::atomic::AtomicU8);

impl AtomicPoolState {
    fn new() -> Self {
        Self(std::sync::atomic::AtomicU8::new(STATE_NEW))
    }

    fn load(&self) -> PoolState {
        match self.0.load(Ordering::SeqCst) {
            STATE_NEW => PoolState::New,
            STATE_RUNNING => PoolState::Running,
            STATE_DRAINING => PoolState::Draining,
            _ => PoolState::Closed,
        }
    }

    fn store(&self, state: PoolState) {
        let code = match state {
            PoolState::New => STATE_NEW,
            PoolState::Running => STATE_RUNNING,
            PoolState::Draining => STATE_DRAINING,
            PoolState::Closed => STATE_CLOSED,
        };
        self.0.store(code, Ordering::SeqCst);
    }
}

/// A point-in-time snapshot of pool activity, for monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    pub active_workers: usize,
    pub jobs_finished: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
}

struct SharedStats {
    active_workers: AtomicUsize,
    jobs_finished: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_failed: AtomicU64,
}

impl SharedStats {
    fn new() -> Self {
        Self {
            active_workers: AtomicUsize::new(0),
            jobs_finished: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
        }
    }

    fn snapshot(&self, num_workers: usize) -> PoolStats {
        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst),
            jobs_finished: self.jobs_finished.load(Ordering::SeqCst),
            jobs_retried: self.jobs_retried.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
        }
    }
}

/// The first fatal error observed by the dispatcher or heartbeat task,
/// latched so [`Pool::wait`] can return it. Handler errors never reach
/// this slot — only store/transport failures do.
#[derive(Default)]
struct FatalSlot(std::sync::Mutex<Option<WharfError>>);

impl FatalSlot {
    fn record(&self, err: WharfError) {
        let mut guard = self.0.lock().expect("fatal error slot poisoned");
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    fn take(&self) -> Option<WharfError> {
        self.0.lock().expect("fatal error slot poisoned").take()
    }
}

/// §4.E Worker Pool. Generic over the store-facing [`JobQueue`]
/// implementation so the same scheduling logic runs unchanged against
/// `wharf-redis` or the in-memory fake in `wharf-testing`.
pub struct Pool<Q: JobQueue> {
    pool_id: String,
    queue: Arc<Q>,
    registry: Arc<TypeRegistry>,
    config: PoolConfig,
    state: Arc<AtomicPoolState>,
    stats: Arc<SharedStats>,
    shutdown: Arc<Notify>,
    fatal: Arc<FatalSlot>,
    tasks: Vec<JoinHandle<()>>,
}

impl<Q: JobQueue> Pool<Q> {
    pub fn new(queue: Arc<Q>, registry: Arc<TypeRegistry>, config: PoolConfig) -> Self {
        Self {
            pool_id: uuid::Uuid::new_v4().to_string(),
            queue,
            registry,
            config,
            state: Arc::new(AtomicPoolState::new()),
            stats: Arc::new(SharedStats::new()),
            shutdown: Arc::new(Notify::new()),
            fatal: Arc::new(FatalSlot::default()),
            tasks: Vec::new(),
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn state(&self) -> PoolState {
        self.state.load()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot(self.config.num_workers)
    }

    /// Assigns a fresh pool id (already done at construction), begins the
    /// heartbeat loop, and spawns `NumWorkers` worker tasks plus one
    /// dispatcher task.
    ///
    /// Re-`start`ing a closed (or already-running) pool is a
    /// [`WharfError::Misconfiguration`].
    pub fn start(&mut self) -> WharfResult<()> {
        if self.state.load() != PoolState::New {
            return Err(WharfError::Misconfiguration(
                "pool has already been started".into(),
            ));
        }
        self.state.store(PoolState::Running);

        let (tx, rx) = mpsc::channel::<ClaimedJob>(self.config.batch_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let buffer_len = Arc::new(AtomicUsize::new(0));

        info!(pool_id = %self.pool_id, num_workers = self.config.num_workers, "starting worker pool");

        self.tasks.push(self.spawn_heartbeat());
        self.tasks.push(self.spawn_dispatcher(tx, Arc::clone(&buffer_len)));
        for worker_index in 0..self.config.num_workers {
            self.tasks
                .push(self.spawn_worker(worker_index, Arc::clone(&rx), Arc::clone(&buffer_len)));
        }

        Ok(())
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let pool_id = self.pool_id.clone();
        let interval = self.config.heartbeat_interval;
        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);
        let fatal = Arc::clone(&self.fatal);

        tokio::spawn(async move {
            loop {
                if state.load() != PoolState::Running {
                    break;
                }
                if let Err(e) = queue.heartbeat(&pool_id, now_ns()).await {
                    warn!(pool_id = %pool_id, error = %e, "heartbeat failed");
                    fatal.record(e);
                }
                if wait_or_shutdown(interval, &shutdown).await {
                    break;
                }
            }
        })
    }

    fn spawn_dispatcher(
        &self,
        tx: mpsc::Sender<ClaimedJob>,
        buffer_len: Arc<AtomicUsize>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let pool_id = self.pool_id.clone();
        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);
        let fatal = Arc::clone(&self.fatal);

        tokio::spawn(async move {
            let mut last_purge = Instant::now()
                .checked_sub(config.heartbeat_interval)
                .unwrap_or_else(Instant::now);

            loop {
                if state.load() == PoolState::Draining && buffer_len.load(Ordering::SeqCst) == 0 {
                    debug!(pool_id = %pool_id, "dispatcher draining and buffer empty, exiting");
                    break;
                }

                if state.load() != PoolState::Draining {
                    match queue.pop_next_jobs(config.batch_size, &pool_id, now_ns()).await {
                        Ok(jobs) => {
                            for job in jobs {
                                buffer_len.fetch_add(1, Ordering::SeqCst);
                                if tx.send(job).await.is_err() {
                                    buffer_len.fetch_sub(1, Ordering::SeqCst);
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(pool_id = %pool_id, error = %e, "reservation poll failed, retrying next cycle");
                            fatal.record(e);
                        }
                    }

                    if last_purge.elapsed() >= config.heartbeat_interval {
                        purge_stale_pools(&*queue, &pool_id, &config, &fatal).await;
                        last_purge = Instant::now();
                    }
                }

                if state.load() == PoolState::Draining {
                    // Don't burn CPU busy-polling buffer_len while workers drain.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }

                if wait_or_shutdown(config.min_wait, &shutdown).await {
                    // Shutdown notified: loop again immediately to re-check
                    // draining/buffer-empty instead of sleeping further.
                    continue;
                }
            }
            // Dropping `tx` here signals workers that no further jobs are
            // coming once the channel's buffered items are drained.
        })
    }

    fn spawn_worker(
        &self,
        worker_index: usize,
        rx: Arc<Mutex<mpsc::Receiver<ClaimedJob>>>,
        buffer_len: Arc<AtomicUsize>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let registry = Arc::clone(&self.registry);
        let pool_id = self.pool_id.clone();
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            debug!(pool_id = %pool_id, worker_index, "worker started");
            loop {
                let claimed = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(claimed) = claimed else {
                    break;
                };
                buffer_len.fetch_sub(1, Ordering::SeqCst);
                run_one_job(&*queue, &registry, &stats, claimed).await;
            }
            debug!(pool_id = %pool_id, worker_index, "worker stopped");
        })
    }

    /// Moves to *draining*: the dispatcher stops polling for new
    /// reservations. Already-buffered and already-executing jobs run to
    /// completion.
    pub fn close(&self) {
        let current = self.state.load();
        if current == PoolState::Running {
            self.state.store(PoolState::Draining);
        }
        self.shutdown.notify_waiters();
    }

    /// Blocks until all workers and the dispatcher have exited. Returns
    /// the first fatal error observed (store unreachable, script error);
    /// handler errors are never fatal to the pool.
    pub async fn wait(mut self) -> WharfResult<()> {
        for task in self.tasks.drain(..) {
            if let Err(join_err) = task.await {
                error!(pool_id = %self.pool_id, error = %join_err, "pool task panicked");
            }
        }
        self.state.store(PoolState::Closed);
        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn purge_stale_pools<Q: JobQueue>(
    queue: &Q,
    self_pool_id: &str,
    config: &PoolConfig,
    fatal: &FatalSlot,
) {
    let now = now_ns();
    let stale_after_ns = config.stale_timeout.as_nanos() as i64;
    match queue.stale_pool_ids(now, stale_after_ns).await {
        Ok(ids) => {
            for id in ids {
                if id == self_pool_id {
                    continue;
                }
                if let Err(e) = queue.purge_stale_pool(&id, now).await {
                    warn!(pool_id = %id, error = %e, "failed to purge stale pool");
                    fatal.record(e);
                } else {
                    info!(pool_id = %id, "purged stale pool");
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to list stale pools");
            fatal.record(e);
        }
    }
}

/// Runs the handler for one claimed job, trapping panics via `tokio::spawn`
/// + `JoinHandle`, and applies the resulting status transition. The
/// worker never re-queues a job locally — every outcome is expressed as a
/// call into the `JobQueue` (§4.B.2/§4.B.3).
async fn run_one_job<Q: JobQueue>(
    queue: &Q,
    registry: &Arc<TypeRegistry>,
    stats: &Arc<SharedStats>,
    claimed: ClaimedJob,
) {
    stats.active_workers.fetch_add(1, Ordering::SeqCst);
    let outcome = execute_with_panic_capture(Arc::clone(registry), claimed.clone()).await;
    stats.active_workers.fetch_sub(1, Ordering::SeqCst);

    let now = now_ns();
    match outcome {
        JobOutcome::Success => {
            if let Err(e) = queue.set_job_status(&claimed.id, JobStatus::Finished, now).await {
                error!(job_id = %claimed.id, error = %e, "failed to mark job finished");
            } else {
                stats.jobs_finished.fetch_add(1, Ordering::SeqCst);
            }
        }
        JobOutcome::Retryable(msg) => {
            if let Err(e) = queue.retry_or_fail_job(&claimed.id, &msg, now, false).await {
                error!(job_id = %claimed.id, error = %e, "failed to apply retry/fail transition");
            } else {
                stats.jobs_retried.fetch_add(1, Ordering::SeqCst);
            }
        }
        JobOutcome::Permanent(msg) => {
            if let Err(e) = queue.retry_or_fail_job(&claimed.id, &msg, now, true).await {
                error!(job_id = %claimed.id, error = %e, "failed to apply permanent failure");
            } else {
                stats.jobs_failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

enum JobOutcome {
    Success,
    /// Decrements the retry budget; may requeue.
    Retryable(String),
    /// Bypasses the retry budget entirely (§7: `UnknownType`/`DecodeError`
    /// are permanent regardless of remaining retries).
    Permanent(String),
}

async fn execute_with_panic_capture(registry: Arc<TypeRegistry>, claimed: ClaimedJob) -> JobOutcome {
    let handle = tokio::spawn(async move { registry.dispatch(&claimed.type_name, claimed.payload).await });

    match handle.await {
        Ok(Ok(HandlerOutcome::Success)) => JobOutcome::Success,
        Ok(Ok(HandlerOutcome::HandlerFailed(msg))) => JobOutcome::Retryable(msg),
        Ok(Ok(HandlerOutcome::DecodeFailed(msg))) => JobOutcome::Permanent(format!("decode error: {msg}")),
        Ok(Err(WharfError::UnknownType(name))) => {
            JobOutcome::Permanent(format!("unknown job type {name:?}"))
        }
        Ok(Err(other)) => JobOutcome::Retryable(other.to_string()),
        Err(join_err) if join_err.is_panic() => {
            JobOutcome::Retryable(panic_message(join_err))
        }
        Err(join_err) => JobOutcome::Retryable(format!("handler task cancelled: {join_err}")),
    }
}

fn panic_message(join_err: tokio::task::JoinError) -> String {
    match join_err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "handler panicked with a non-string payload".to_string()
            }
        }
        Err(_) => "handler panicked".to_string(),
    }
}

/// Sleeps for `duration` unless `shutdown` is notified first. Returns
/// `true` if the sleep was interrupted by shutdown.
async fn wait_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    let sleep = tokio::time::sleep(duration);
    tokio::select! {
        _ = sleep => false,
        _ = shutdown.notified() => true,
    }
}
