//! Redis-backed [`JobQueue`]: the concrete Store Gateway (§4.A) and the
//! atomic Lua scripts (§4.B) that make every transition exactly-once.
//!
//! Key layout, all under a configurable namespace (default `wharf`):
//!
//! - `jobs:<id>` — hash of job fields
//! - `jobs:status:<status>` — sorted set, score is `-priority` for
//!   `queued`/`executing`, claim/finish time for terminal statuses
//! - `jobs:time` — sorted set, score is scheduled time (kept for a future
//!   "jobs due before T" query; not consulted by the reservation path,
//!   which scans `jobs:status:queued` directly)
//! - `jobs:type:<name>` — sorted set of every job of that type
//! - `jobs:executing:<pool_id>` — sorted set of jobs claimed by one pool
//! - `pools:heartbeats` — sorted set, member is a pool id, score is its
//!   last heartbeat time
//!
//! Cluster deployments would need hash tags on the per-job keys the
//! scripts touch together; this implementation targets a single Redis
//! node or a non-cluster replica set, same as the reservation scripts it's
//! grounded on.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;

use wharf_core::error::{WharfError, WharfResult};
use wharf_core::job::{Job, JobStatus, Priority, Timestamp};
use wharf_core::pool::now_ns;
use wharf_core::queue::{ClaimedJob, JobQueue, QueueStats};

/// Key-naming policy for a `RedisJobQueue`. Two queues sharing a Redis
/// instance under different namespaces never see each other's jobs.
#[derive(Debug, Clone)]
pub struct Config {
    namespace: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "wharf".to_string(),
        }
    }
}

impl Config {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:jobs:{}", self.namespace, id)
    }

    fn status_key(&self, status: JobStatus) -> String {
        format!("{}:jobs:status:{}", self.namespace, status.as_key_segment())
    }

    fn time_key(&self) -> String {
        format!("{}:jobs:time", self.namespace)
    }

    fn type_key(&self, type_name: &str) -> String {
        format!("{}:jobs:type:{}", self.namespace, type_name)
    }

    fn executing_key(&self, pool_id: &str) -> String {
        format!("{}:jobs:executing:{}", self.namespace, pool_id)
    }

    fn heartbeats_key(&self) -> String {
        format!("{}:pools:heartbeats", self.namespace)
    }
}

struct Scripts {
    pop_next_jobs: Script,
    retry_or_fail_job: Script,
    set_job_status: Script,
    destroy_job: Script,
    purge_stale_pool: Script,
    cancel_job: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            pop_next_jobs: Script::new(include_str!("../lua/pop_next_jobs.lua")),
            retry_or_fail_job: Script::new(include_str!("../lua/retry_or_fail_job.lua")),
            set_job_status: Script::new(include_str!("../lua/set_job_status.lua")),
            destroy_job: Script::new(include_str!("../lua/destroy_job.lua")),
            purge_stale_pool: Script::new(include_str!("../lua/purge_stale_pool.lua")),
            cancel_job: Script::new(include_str!("../lua/cancel_job.lua")),
        }
    }
}

/// A [`JobQueue`] backed by Redis. Holds one multiplexed
/// `ConnectionManager`, which already auto-reconnects; the `Mutex` just
/// serializes pipeline construction, not network round trips.
pub struct RedisJobQueue {
    conn: Mutex<ConnectionManager>,
    config: Config,
    scripts: Scripts,
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str, config: Config) -> WharfResult<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| WharfError::Misconfiguration(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| WharfError::TransientStore(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
            scripts: Scripts::load(),
        })
    }

    async fn load_job(&self, conn: &mut ConnectionManager, id: &str) -> WharfResult<Option<Job>> {
        let key = self.config.job_key(id);
        let fields: HashMap<String, Vec<u8>> = conn.hgetall(&key).await.map_err(store_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        hash_to_job(id, &fields).map(Some)
    }

    async fn write_new_job(&self, job: &Job) -> WharfResult<()> {
        let mut conn = self.conn.lock().await;
        let job_key = self.config.job_key(&job.id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(
                &job_key,
                &[
                    ("type_name", job.type_name.clone().into_bytes()),
                    ("payload", job.payload.clone()),
                    ("priority", job.priority.to_string().into_bytes()),
                    ("time", job.time.to_string().into_bytes()),
                    ("freq", job.freq.to_string().into_bytes()),
                    ("retries", job.retries.to_string().into_bytes()),
                    ("status", JobStatus::Queued.as_key_segment().as_bytes().to_vec()),
                    ("started", b"0".to_vec()),
                    ("finished", b"0".to_vec()),
                    ("error", Vec::new()),
                    ("pool_id", Vec::new()),
                ],
            )
            .ignore()
            .zadd(self.config.status_key(JobStatus::Queued), &job.id, job.priority_score())
            .ignore()
            .zadd(self.config.time_key(), &job.id, job.time)
            .ignore()
            .zadd(self.config.type_key(&job.type_name), &job.id, job.priority_score())
            .ignore();

        pipe.query_async(&mut *conn).await.map_err(store_err)
    }
}

fn store_err(e: redis::RedisError) -> WharfError {
    WharfError::TransientStore(e.to_string())
}

fn field_string(fields: &HashMap<String, Vec<u8>>, name: &str) -> WharfResult<String> {
    fields
        .get(name)
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .ok_or_else(|| WharfError::TransientStore(format!("job hash missing field {name:?}")))
}

fn field_i64(fields: &HashMap<String, Vec<u8>>, name: &str) -> WharfResult<i64> {
    field_string(fields, name)?
        .parse()
        .map_err(|_| WharfError::TransientStore(format!("job field {name:?} is not an integer")))
}

fn parse_status(s: &str) -> WharfResult<JobStatus> {
    Ok(match s {
        "saved" => JobStatus::Saved,
        "queued" => JobStatus::Queued,
        "executing" => JobStatus::Executing,
        "finished" => JobStatus::Finished,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        "destroyed" => JobStatus::Destroyed,
        other => return Err(WharfError::TransientStore(format!("unknown job status {other:?}"))),
    })
}

fn hash_to_job(id: &str, fields: &HashMap<String, Vec<u8>>) -> WharfResult<Job> {
    Ok(Job {
        id: id.to_string(),
        type_name: field_string(fields, "type_name")?,
        payload: fields.get("payload").cloned().unwrap_or_default(),
        priority: field_i64(fields, "priority")?,
        time: field_i64(fields, "time")?,
        freq: field_i64(fields, "freq")?,
        retries: field_i64(fields, "retries")? as u32,
        status: parse_status(&field_string(fields, "status")?)?,
        started: field_i64(fields, "started")?,
        finished: field_i64(fields, "finished")?,
        error: fields
            .get("error")
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default(),
        pool_id: fields
            .get("pool_id")
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default(),
    })
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn schedule(
        &self,
        type_name: &str,
        priority: Priority,
        time: Timestamp,
        payload: Vec<u8>,
        retries: u32,
    ) -> WharfResult<Job> {
        let job = Job::new_one_off(
            uuid::Uuid::new_v4().to_string(),
            type_name.to_string(),
            payload,
            priority,
            time,
            retries,
        );
        self.write_new_job(&job).await?;
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
        let job = Job::new_recurring(
            uuid::Uuid::new_v4().to_string(),
            type_name.to_string(),
            payload,
            priority,
            first_time,
            freq,
            retries,
        );
        self.write_new_job(&job).await?;
        Ok(job)
    }

    async fn find_by_id(&self, id: &str) -> WharfResult<Option<Job>> {
        let mut conn = self.conn.lock().await;
        self.load_job(&mut conn, id).await
    }

    async fn jobs_by_type(&self, type_name: &str) -> WharfResult<Vec<Job>> {
        let mut conn = self.conn.lock().await;
        let ids: Vec<String> = conn
            .zrange(self.config.type_key(type_name), 0, -1)
            .await
            .map_err(store_err)?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load_job(&mut conn, &id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn jobs_by_status(&self, status: JobStatus) -> WharfResult<Vec<Job>> {
        let mut conn = self.conn.lock().await;
        let ids: Vec<String> = conn
            .zrange(self.config.status_key(status), 0, -1)
            .await
            .map_err(store_err)?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load_job(&mut conn, &id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn stats(&self) -> WharfResult<QueueStats> {
        let mut conn = self.conn.lock().await;
        Ok(QueueStats {
            queued: conn.zcard(self.config.status_key(JobStatus::Queued)).await.map_err(store_err)?,
            executing: conn
                .zcard(self.config.status_key(JobStatus::Executing))
                .await
                .map_err(store_err)?,
            finished: conn
                .zcard(self.config.status_key(JobStatus::Finished))
                .await
                .map_err(store_err)?,
            failed: conn.zcard(self.config.status_key(JobStatus::Failed)).await.map_err(store_err)?,
            cancelled: conn
                .zcard(self.config.status_key(JobStatus::Cancelled))
                .await
                .map_err(store_err)?,
        })
    }

    async fn cancel(&self, id: &str) -> WharfResult<()> {
        let mut conn = self.conn.lock().await;
        let result: redis::RedisResult<i64> = self
            .scripts
            .cancel_job
            .key(self.config.job_key(id))
            .key(self.config.status_key(JobStatus::Cancelled))
            .arg(id)
            .arg(now_ns())
            .arg(&self.config.namespace)
            .invoke_async(&mut *conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("not_found") || e.to_string().contains("already_terminal") => {
                Err(WharfError::Misconfiguration(format!("cannot cancel job {id:?}: {e}")))
            }
            Err(e) => Err(store_err(e)),
        }
    }

    async fn destroy(&self, id: &str) -> WharfResult<()> {
        let mut conn = self.conn.lock().await;
        let _: i64 = self
            .scripts
            .destroy_job
            .key(self.config.job_key(id))
            .key(self.config.time_key())
            .arg(id)
            .arg(&self.config.namespace)
            .invoke_async(&mut *conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn pop_next_jobs(
        &self,
        batch_size: usize,
        pool_id: &str,
        now: Timestamp,
    ) -> WharfResult<Vec<ClaimedJob>> {
        let mut conn = self.conn.lock().await;
        let flat: Vec<Vec<u8>> = self
            .scripts
            .pop_next_jobs
            .key(self.config.status_key(JobStatus::Queued))
            .key(self.config.status_key(JobStatus::Executing))
            .key(self.config.executing_key(pool_id))
            .arg(batch_size)
            .arg(pool_id)
            .arg(now)
            .arg(&self.config.namespace)
            .invoke_async(&mut *conn)
            .await
            .map_err(store_err)?;

        Ok(flat
            .chunks_exact(3)
            .map(|chunk| ClaimedJob {
                id: String::from_utf8_lossy(&chunk[0]).into_owned(),
                type_name: String::from_utf8_lossy(&chunk[1]).into_owned(),
                payload: chunk[2].clone(),
            })
            .collect())
    }

    async fn retry_or_fail_job(
        &self,
        id: &str,
        err_msg: &str,
        now: Timestamp,
        permanent: bool,
    ) -> WharfResult<()> {
        let mut conn = self.conn.lock().await;
        let _: i64 = self
            .scripts
            .retry_or_fail_job
            .key(self.config.job_key(id))
            .key(self.config.status_key(JobStatus::Queued))
            .key(self.config.status_key(JobStatus::Failed))
            .key(self.config.status_key(JobStatus::Executing))
            .arg(id)
            .arg(err_msg)
            .arg(now)
            .arg(if permanent { "1" } else { "0" })
            .arg(&self.config.namespace)
            .invoke_async(&mut *conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_job_status(&self, id: &str, new_status: JobStatus, now: Timestamp) -> WharfResult<()> {
        let mut conn = self.conn.lock().await;
        let _: i64 = self
            .scripts
            .set_job_status
            .key(self.config.job_key(id))
            .key(self.config.status_key(new_status))
            .key(self.config.status_key(JobStatus::Queued))
            .key(self.config.status_key(JobStatus::Executing))
            .arg(id)
            .arg(new_status.as_key_segment())
            .arg(now)
            .arg(&self.config.namespace)
            .invoke_async(&mut *conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn purge_stale_pool(&self, pool_id: &str, now: Timestamp) -> WharfResult<()> {
        let mut conn = self.conn.lock().await;
        let _: i64 = self
            .scripts
            .purge_stale_pool
            .key(self.config.executing_key(pool_id))
            .key(self.config.heartbeats_key())
            .key(self.config.status_key(JobStatus::Queued))
            .key(self.config.status_key(JobStatus::Executing))
            .arg(pool_id)
            .arg(now)
            .arg(format!("pool {pool_id} is stale"))
            .arg(&self.config.namespace)
            .invoke_async(&mut *conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn heartbeat(&self, pool_id: &str, now: Timestamp) -> WharfResult<()> {
        let mut conn = self.conn.lock().await;
        conn.zadd::<_, _, _, ()>(self.config.heartbeats_key(), pool_id, now)
            .await
            .map_err(store_err)
    }

    async fn stale_pool_ids(&self, now: Timestamp, stale_after_ns: i64) -> WharfResult<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let cutoff = now - stale_after_ns;
        conn.zrangebyscore(self.config.heartbeats_key(), "-inf", cutoff)
            .await
            .map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    //! Integration tests against a live Redis, gated on `REDIS_URL` the
    //! same way the reservation-queue tests this module is grounded on are
    //! gated. Run with:
    //! `REDIS_URL=redis://127.0.0.1 cargo test -p wharf-redis -- --ignored`.
    use super::*;

    async fn test_queue() -> Option<RedisJobQueue> {
        let url = std::env::var("REDIS_URL").ok()?;
        let namespace = format!("wharf-test-{}", uuid::Uuid::new_v4());
        Some(
            RedisJobQueue::connect(&url, Config::new(namespace))
                .await
                .expect("connect to REDIS_URL"),
        )
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn schedule_then_pop_claims_the_job() {
        let Some(queue) = test_queue().await else { return };
        let job = queue.schedule("greet", 0, 0, b"hi".to_vec(), 3).await.unwrap();

        let claimed = queue.pop_next_jobs(10, "pool-a", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);
        assert_eq!(claimed[0].payload, b"hi");
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn retry_then_permanent_failure() {
        let Some(queue) = test_queue().await else { return };
        let job = queue.schedule("t", 0, 0, vec![], 2).await.unwrap();
        queue.pop_next_jobs(10, "pool-a", 0).await.unwrap();

        queue.retry_or_fail_job(&job.id, "decode error", 1, true).await.unwrap();
        let reloaded = queue.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Failed);
        assert_eq!(reloaded.retries, 2);
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn purge_stale_pool_reclaims_executing_jobs() {
        let Some(queue) = test_queue().await else { return };
        let job = queue.schedule("t", 0, 0, vec![], 1).await.unwrap();
        queue.pop_next_jobs(10, "dead-pool", 0).await.unwrap();
        queue.heartbeat("dead-pool", 0).await.unwrap();

        queue.purge_stale_pool("dead-pool", 100).await.unwrap();

        let reloaded = queue.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Queued);
        assert_eq!(reloaded.retries, 1);
        assert!(reloaded.pool_id.is_empty());
    }
}
