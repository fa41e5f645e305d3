//! The Job entity, its lifecycle, and the indices it lives in.
//!
//! This module is pure data: it knows the shape of a [`Job`] and the rules
//! that govern its [`JobStatus`] transitions, but never touches the store.
//! Persisting a `Job` and driving it through those transitions is the
//! [`crate::queue::JobQueue`] trait's job.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Nanoseconds since the Unix epoch. The store's clock is authoritative for
/// reservation and stale-pool checks; the caller's clock is authoritative
/// for `Schedule`/`ScheduleRecurring`. See the crate-level docs for why the
/// split exists.
pub type Timestamp = i64;

/// Signed job priority. Larger values run earlier.
pub type Priority = i64;

/// A job's position in its lifecycle.
///
/// Invariant: a job is a member of exactly one `jobs:status:<S>` index at
/// any moment, and that index always matches this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Written inside the scheduling transaction, before the status
    /// indices are populated. Never observable outside that transaction.
    Saved,
    /// Ready (or scheduled for the future) and waiting for a worker.
    Queued,
    /// Claimed by a pool; `pool_id` is set.
    Executing,
    /// Terminal for one-off jobs; recurring jobs never linger here because
    /// `setJobStatus(finished)` immediately requeues them.
    Finished,
    /// Terminal: retries exhausted.
    Failed,
    /// Terminal: producer-requested cancellation of a non-terminal job.
    Cancelled,
    /// Terminal: all indices and the job hash have been removed.
    Destroyed,
}

impl JobStatus {
    /// A status a job can never leave under its own power; only Cancel or
    /// Destroy (explicit producer action) change it further, and Destroy
    /// removes the job outright.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Destroyed
        )
    }

    /// The Redis key suffix for this status's sorted-set index, e.g.
    /// `jobs:status:queued`.
    pub fn as_key_segment(self) -> &'static str {
        match self {
            JobStatus::Saved => "saved",
            JobStatus::Queued => "queued",
            JobStatus::Executing => "executing",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key_segment())
    }
}

/// A persisted unit of work.
///
/// `payload` is an opaque byte string; decoding it into the handler's
/// argument type is the [`crate::registry::Encoder`]'s job, not this
/// struct's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub type_name: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub time: Timestamp,
    /// Recurrence interval in nanoseconds. `0` means one-off.
    pub freq: i64,
    /// Remaining retry budget. Never negative.
    pub retries: u32,
    pub status: JobStatus,
    /// `0` until the job is first claimed.
    pub started: Timestamp,
    /// `0` until the job reaches a terminal outcome.
    pub finished: Timestamp,
    /// Populated only on permanent failure.
    pub error: String,
    /// Populated only while `status == Executing`.
    pub pool_id: String,
}

impl Job {
    /// Constructs a freshly-scheduled, one-off job in the `Saved` status.
    /// Callers (the [`crate::queue::JobQueue`] implementation) are
    /// responsible for moving it to `Queued` as part of the same
    /// transaction that indexes it.
    pub fn new_one_off(
        id: String,
        type_name: String,
        payload: Vec<u8>,
        priority: Priority,
        time: Timestamp,
        retries: u32,
    ) -> Self {
        Self {
            id,
            type_name,
            payload,
            priority,
            time,
            freq: 0,
            retries,
            status: JobStatus::Saved,
            started: 0,
            finished: 0,
            error: String::new(),
            pool_id: String::new(),
        }
    }

    /// Constructs a freshly-scheduled recurring job. `freq` must be
    /// strictly positive; a `freq` of zero denotes a one-off job and
    /// should go through [`Job::new_one_off`] instead.
    pub fn new_recurring(
        id: String,
        type_name: String,
        payload: Vec<u8>,
        priority: Priority,
        first_time: Timestamp,
        freq: i64,
        retries: u32,
    ) -> Self {
        debug_assert!(freq > 0, "freq must be positive for a recurring job");
        Self {
            freq,
            ..Self::new_one_off(id, type_name, payload, priority, first_time, retries)
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.freq > 0
    }

    /// The score a job occupies in a `jobs:status:<S>` sorted set: `-priority`,
    /// so that the lowest score is the highest-priority job.
    pub fn priority_score(&self) -> i64 {
        -self.priority
    }

    /// Applies the "advance `time` to strictly greater than now" rule from
    /// the recurring-reschedule design note: `max(time + freq, now + freq)`.
    /// Pure client-side mirror of what `setJobStatus`'s Lua computes
    /// server-side; exposed so tests can assert on it without a store.
    pub fn next_recurrence(&self, now: Timestamp) -> Timestamp {
        debug_assert!(self.is_recurring());
        std::cmp::max(self.time + self.freq, now + self.freq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Destroyed.is_terminal());
        assert!(!JobStatus::Saved.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Executing.is_terminal());
    }

    #[test]
    fn priority_score_is_negated() {
        let job = Job::new_one_off("a".into(), "t".into(), vec![], 50, 0, 0);
        assert_eq!(job.priority_score(), -50);
    }

    #[test]
    fn next_recurrence_is_strictly_after_now() {
        let job = Job::new_recurring("a".into(), "t".into(), vec![], 0, 1_000, 500, 0);
        // handler ran long: now is already past time + freq
        assert_eq!(job.next_recurrence(2_000), 2_500);
        // handler was quick: time + freq already strictly greater than now
        assert_eq!(job.next_recurrence(1_100), 1_500);
    }

    #[test]
    fn recurring_round_trips_through_json() {
        let job = Job::new_recurring("a".into(), "report".into(), b"x".to_vec(), 10, 5, 100, 3);
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(job, decoded);
    }
}
