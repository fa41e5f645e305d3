//! # wharf
//!
//! A distributed, persistent job queue: producers schedule work against a
//! shared store, a fleet of worker pools claims and executes it, and every
//! claim is exactly-once even when pools crash mid-job.
//!
//! ## Core Concepts
//!
//! wharf separates **what to run** from **how it's claimed**:
//! - [`job::Job`] = a persisted unit of work and its lifecycle
//! - [`queue::JobQueue`] = the store-facing contract every transition goes
//!   through; no caller is allowed to assume anything about *how* it
//!   achieves atomicity
//! - [`registry::TypeRegistry`] = the process-wide map from a job-type name
//!   to its decoder and handler
//! - [`pool::Pool`] = the worker fleet that dispatches, executes, and
//!   retries
//!
//! ## Architecture
//!
//! ```text
//! Producer
//!     │
//!     ▼ TypeHandle::schedule()
//! JobQueue::schedule() ─────────► store (hash + status/time/type indices)
//!
//! Pool::start()
//!     │
//!     ├─► dispatcher task ─── pop_next_jobs() ──► bounded work buffer
//!     │         │
//!     │         └─ every H: purge_stale_pool() for dead pools
//!     │
//!     ├─► heartbeat task ─── heartbeat() every H
//!     │
//!     └─► worker task × N ── TypeRegistry::dispatch() ──► handler
//!                   │
//!                   └─► set_job_status() / retry_or_fail_job()
//! ```
//!
//! ## Key Invariants
//!
//! 1. **A job belongs to exactly one status index at a time** — enforced
//!    by the store, never assembled client-side from multiple round trips.
//! 2. **Claiming is exactly-once** — `pop_next_jobs` is one atomic
//!    operation; two pools racing on the same job never both win.
//! 3. **Handler failures never unwind a worker** — panics are caught at a
//!    task boundary and applied to the retry budget exactly like a
//!    returned `Err`.
//! 4. **Recurring jobs never linger in `Finished`** — `setJobStatus`
//!    reschedules them to `Queued` within the same atomic step.
//! 5. **A stale pool's jobs are reclaimable by any live pool** —
//!    `purgeStalePool` is idempotent, so two pools racing on the same dead
//!    pool id is safe.
//!
//! ## What This Is Not
//!
//! wharf is **not**:
//! - A message bus or pub/sub system
//! - A workflow/saga engine with cross-job dependencies
//! - A cron daemon (recurring jobs are a queue primitive, not a calendar)
//!
//! wharf **is**:
//! > A distributed, persistent job queue with exactly-once dispatch and
//! > first-class recurrence.

pub mod error;
pub mod job;
pub mod pool;
pub mod queue;
pub mod registry;

pub use error::{Categorizable, WharfError, WharfResult};
pub use job::{Job, JobStatus, Priority, Timestamp};
pub use pool::{now_ns, Pool, PoolConfig, PoolStats, PoolState};
pub use queue::{ClaimedJob, JobQueue, QueueStats};
pub use registry::{Encoder, Handler, HandlerOutcome, JsonEncoder, TypeHandle, TypeRegistry};

pub use async_trait::async_trait;
