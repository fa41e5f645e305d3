//! An in-memory [`JobQueue`] fake, so handlers and the worker pool can be
//! exercised without a live store. Mirrors the shape of a real backend
//! (indices, atomic-by-construction transitions) closely enough that
//! tests written against it carry over to `wharf-redis` unchanged.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use wharf_core::error::{WharfError, WharfResult};
use wharf_core::job::{Job, JobStatus, Priority, Timestamp};
use wharf_core::queue::{ClaimedJob, JobQueue, QueueStats};

/// In-memory stand-in for a real job store. Every method takes the same
/// lock-free path a concurrent backend would: per-job state lives behind
/// a single `DashMap` entry, so two callers racing on the same id observe
/// one winner, never a torn update.
pub struct FakeJobQueue {
    jobs: DashMap<String, Job>,
    heartbeats: DashMap<String, Timestamp>,
    next_id: AtomicU64,
}

impl Default for FakeJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeJobQueue {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            heartbeats: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn fresh_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("job-{n}")
    }

    /// Test helper: total number of pool heartbeats currently tracked.
    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.len()
    }
}

#[async_trait]
impl JobQueue for FakeJobQueue {
    async fn schedule(
        &self,
        type_name: &str,
        priority: Priority,
        time: Timestamp,
        payload: Vec<u8>,
        retries: u32,
    ) -> WharfResult<Job> {
        let id = self.fresh_id();
        let mut job = Job::new_one_off(id.clone(), type_name.to_string(), payload, priority, time, retries);
        job.status = JobStatus::Queued;
        self.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn schedule_recurring(
        &self,
        type_name: &str,
        priority: Priority,
        first_time: Timestamp,
        freq: i64,
        payload: Vec<u8>,
        retries: u32,
    ) -> WharfResult<Job> {
        let id = self.fresh_id();
        let mut job = Job::new_recurring(
            id.clone(),
            type_name.to_string(),
            payload,
            priority,
            first_time,
            freq,
            retries,
        );
        job.status = JobStatus::Queued;
        self.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: &str) -> WharfResult<Option<Job>> {
        Ok(self.jobs.get(id).map(|e| e.value().clone()))
    }

    async fn jobs_by_type(&self, type_name: &str) -> WharfResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|e| e.value().type_name == type_name)
            .map(|e| e.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.priority_score().cmp(&b.priority_score()).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn jobs_by_status(&self, status: JobStatus) -> WharfResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|e| e.value().status == status)
            .map(|e| e.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.priority_score().cmp(&b.priority_score()).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn stats(&self) -> WharfResult<QueueStats> {
        let mut stats = QueueStats::default();
        for entry in self.jobs.iter() {
            match entry.value().status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Executing => stats.executing += 1,
                JobStatus::Finished => stats.finished += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Saved | JobStatus::Destroyed => {}
            }
        }
        Ok(stats)
    }

    async fn cancel(&self, id: &str) -> WharfResult<()> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| WharfError::Misconfiguration(format!("job {id:?} not found")))?;
        if entry.status.is_terminal() {
            return Err(WharfError::Misconfiguration(format!(
                "job {id:?} is already terminal ({})",
                entry.status
            )));
        }
        entry.status = JobStatus::Cancelled;
        entry.pool_id.clear();
        Ok(())
    }

    async fn destroy(&self, id: &str) -> WharfResult<()> {
        self.jobs.remove(id);
        Ok(())
    }

    async fn pop_next_jobs(
        &self,
        batch_size: usize,
        pool_id: &str,
        now: Timestamp,
    ) -> WharfResult<Vec<ClaimedJob>> {
        let mut candidates: Vec<(i64, String)> = self
            .jobs
            .iter()
            .filter(|e| e.value().status == JobStatus::Queued && e.value().time <= now)
            .map(|e| (e.value().priority_score(), e.value().id.clone()))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(mut job) = self.jobs.get_mut(&id) {
                if job.status != JobStatus::Queued {
                    // Lost the race to another caller between the scan and
                    // the claim; skip it.
                    continue;
                }
                job.status = JobStatus::Executing;
                job.started = now;
                job.pool_id = pool_id.to_string();
                claimed.push(ClaimedJob {
                    id: job.id.clone(),
                    type_name: job.type_name.clone(),
                    payload: job.payload.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn retry_or_fail_job(
        &self,
        id: &str,
        err_msg: &str,
        now: Timestamp,
        permanent: bool,
    ) -> WharfResult<()> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| WharfError::Misconfiguration(format!("job {id:?} not found")))?;
        entry.error = err_msg.to_string();
        if !permanent && entry.retries > 0 {
            entry.retries -= 1;
            entry.status = JobStatus::Queued;
            entry.pool_id.clear();
        } else {
            entry.status = JobStatus::Failed;
            entry.finished = now;
            entry.pool_id.clear();
        }
        Ok(())
    }

    async fn set_job_status(&self, id: &str, new_status: JobStatus, now: Timestamp) -> WharfResult<()> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| WharfError::Misconfiguration(format!("job {id:?} not found")))?;

        if new_status == JobStatus::Finished && entry.is_recurring() {
            let next = entry.next_recurrence(now);
            entry.time = next;
            entry.status = JobStatus::Queued;
            entry.started = 0;
            entry.finished = 0;
            entry.pool_id.clear();
            entry.error.clear();
            return Ok(());
        }

        entry.status = new_status;
        if new_status.is_terminal() {
            entry.finished = now;
            entry.pool_id.clear();
        }
        Ok(())
    }

    async fn purge_stale_pool(&self, pool_id: &str, now: Timestamp) -> WharfResult<()> {
        let stranded: Vec<String> = self
            .jobs
            .iter()
            .filter(|e| e.value().status == JobStatus::Executing && e.value().pool_id == pool_id)
            .map(|e| e.value().id.clone())
            .collect();

        for id in stranded {
            if let Some(mut entry) = self.jobs.get_mut(&id) {
                entry.status = JobStatus::Queued;
                entry.error = format!("pool {pool_id} is stale");
                entry.pool_id.clear();
            }
        }
        self.heartbeats.remove(pool_id);
        Ok(())
    }

    async fn heartbeat(&self, pool_id: &str, now: Timestamp) -> WharfResult<()> {
        self.heartbeats.insert(pool_id.to_string(), now);
        Ok(())
    }

    async fn stale_pool_ids(&self, now: Timestamp, stale_after_ns: i64) -> WharfResult<Vec<String>> {
        Ok(self
            .heartbeats
            .iter()
            .filter(|e| now - *e.value() > stale_after_ns)
            .map(|e| e.key().clone())
            .collect())
    }
}
