//! The `JobQueue` trait: the store-facing contract that components A
//! (Store Gateway) and B (Scripts) present to the rest of the crate.
//!
//! A concrete implementation (see the `wharf-redis` crate) owns the
//! connection to the backing store and the server-side scripts that make
//! every transition in this trait atomic. Nothing above this trait —
//! the data model, the type registry, or the worker pool — is allowed to
//! assume anything about *how* atomicity is achieved; see the "Atomicity
//! without local locks" design note.

use async_trait::async_trait;

use crate::error::WharfResult;
use crate::job::{Job, JobStatus, Priority, Timestamp};

/// One job handed back by [`JobQueue::pop_next_jobs`]: just enough to
/// decode and invoke the handler, without shipping the rest of the Job's
/// bookkeeping fields back over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: String,
    pub type_name: String,
    pub payload: Vec<u8>,
}

/// Per-status counts over the whole queue, exposed for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: u64,
    pub executing: u64,
    pub finished: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.queued + self.executing + self.finished + self.failed + self.cancelled
    }
}

/// The store-facing contract: everything in §4.A/§4.B/§4.C of the design.
///
/// Every method here either is, or is built entirely out of, one atomic
/// server-side operation. None of them may be decomposed into multiple
/// round trips by a caller trying to reimplement part of the protocol
/// client-side — that's precisely the race the design notes warn against.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// §4.C `Schedule`. Assigns an id, writes the job hash, and indexes it
    /// under `status:queued`, `time`, and `type:<name>` in one
    /// transaction. Returns the fully-populated `Job`.
    async fn schedule(
        &self,
        type_name: &str,
        priority: Priority,
        time: Timestamp,
        payload: Vec<u8>,
        retries: u32,
    ) -> WharfResult<Job>;

    /// §4.C `ScheduleRecurring`. Identical to `schedule` but `freq` must be
    /// strictly positive.
    async fn schedule_recurring(
        &self,
        type_name: &str,
        priority: Priority,
        first_time: Timestamp,
        freq: i64,
        payload: Vec<u8>,
        retries: u32,
    ) -> WharfResult<Job>;

    /// §4.C `FindById`.
    async fn find_by_id(&self, id: &str) -> WharfResult<Option<Job>>;

    /// §4.C query helper: every job of a given type, most-ready-first.
    async fn jobs_by_type(&self, type_name: &str) -> WharfResult<Vec<Job>>;

    /// §4.C query helper: every job currently in a given status.
    async fn jobs_by_status(&self, status: JobStatus) -> WharfResult<Vec<Job>>;

    /// Aggregate counts across the status indices, for monitoring.
    async fn stats(&self) -> WharfResult<QueueStats>;

    /// §4.C `Cancel`. Moves a non-terminal job to `Cancelled`. A no-op
    /// error (not a panic) if the job is already terminal or missing.
    async fn cancel(&self, id: &str) -> WharfResult<()>;

    /// §4.C `Destroy`, i.e. §4.B.5 `destroyJob`: removes the job from
    /// every index and deletes its hash.
    async fn destroy(&self, id: &str) -> WharfResult<()>;

    /// §4.B.1 `popNextJobs`. Atomically reserves up to `batch_size` ready
    /// jobs for `pool_id`, in priority order (ties broken by ascending
    /// id), and returns their `(id, type_name, payload)` triples. Never
    /// blocks; returns fewer than `batch_size` if fewer are available.
    async fn pop_next_jobs(
        &self,
        batch_size: usize,
        pool_id: &str,
        now: Timestamp,
    ) -> WharfResult<Vec<ClaimedJob>>;

    /// §4.B.2 `retryOrFailJob`. Applied by a worker on handler failure (or
    /// by `purge_stale_pool` on every job orphaned by a dead pool).
    ///
    /// `permanent` bypasses the retry budget entirely and moves the job
    /// straight to `Failed` regardless of remaining retries. §7 calls
    /// `UnknownType` and `DecodeError` permanent failures even when the
    /// job has retries left; `permanent` is how the worker expresses that
    /// without forking this method's "decrement or fail" decision into a
    /// second script.
    async fn retry_or_fail_job(
        &self,
        id: &str,
        err_msg: &str,
        now: Timestamp,
        permanent: bool,
    ) -> WharfResult<()>;

    /// §4.B.3 `setJobStatus`. The only legal way to reach `Finished`;
    /// recurring jobs are rescheduled to `Queued` as part of the same
    /// atomic step instead of staying `Finished`.
    async fn set_job_status(&self, id: &str, new_status: JobStatus, now: Timestamp) -> WharfResult<()>;

    /// §4.B.4 `purgeStalePool`. Re-queues every job owned by `pool_id`
    /// unconditionally (with a "stale pool" error message), without
    /// touching its retry budget — the pool crashed, the job never
    /// actually failed — then deletes the pool's heartbeat and
    /// `executing:<pool_id>` index. Idempotent: safe for two live pools
    /// to race on the same stale pool id.
    async fn purge_stale_pool(&self, pool_id: &str, now: Timestamp) -> WharfResult<()>;

    /// Records `now` as `pool_id`'s latest heartbeat in `pools:heartbeats`.
    /// Called by the pool's heartbeat task every *H*.
    async fn heartbeat(&self, pool_id: &str, now: Timestamp) -> WharfResult<()>;

    /// Every pool id whose heartbeat is older than `stale_after`
    /// relative to `now`. Used by the dispatcher to decide which pools to
    /// purge.
    async fn stale_pool_ids(&self, now: Timestamp, stale_after_ns: i64) -> WharfResult<Vec<String>>;
}
