//! Redis implementation of the `requeue` store gateway.
//!
//! All multi-step state transitions run as server-side Lua scripts
//! (`scripts` module), so any number of pools on any number of machines
//! can share one database without client-side locking. The key layout is
//! documented in the `keys` module and is stable.
//!
//! Clocks: scheduling and heartbeat writes use the caller's clock, while
//! reservation and staleness comparisons use the store's clock (`TIME`,
//! read inside the scripts or alongside the heartbeat scan). Keep client
//! clocks roughly synchronized with the store for staleness detection to
//! be meaningful.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, RedisError};
use requeue::{
    backend::{Backend, BackendError, NewJob, ReservedJob},
    job::{Job, JobId, JobStatus},
    pool::PoolId,
};

mod codec;
mod keys;
mod scripts;

use keys::Namespace;
use scripts::Scripts;

const STALE_POOL_ERROR: &str = "requeued from stale pool";

/// Redis-backed [`Backend`] over a shared multiplexed connection.
///
/// Cloning is cheap; clones share the connection and the loaded scripts.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    namespace: Namespace,
    scripts: Arc<Scripts>,
}

fn transport(error: RedisError) -> BackendError {
    BackendError::Transport(error.to_string())
}

impl RedisBackend {
    pub const DEFAULT_NAMESPACE: &'static str = "requeue";

    pub async fn from_url(
        url: &str,
        namespace: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let client = redis::Client::open(url).map_err(transport)?;
        Self::from_client(client, namespace).await
    }

    pub async fn from_client(
        client: redis::Client,
        namespace: impl Into<String>,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            conn: ConnectionManager::new(client).await.map_err(transport)?,
            namespace: Namespace::new(namespace),
            scripts: Arc::new(Scripts::new()),
        })
    }

    /// The store's clock, in nanoseconds since the epoch.
    async fn store_now(&self, conn: &mut ConnectionManager) -> Result<i64, BackendError> {
        let (secs, micros): (i64, i64) = redis::cmd("TIME")
            .query_async(conn)
            .await
            .map_err(transport)?;
        Ok(secs * 1_000_000_000 + micros * 1_000)
    }

    /// Maps a transition script's reply: the resulting (or refusing)
    /// status, or empty when the job does not exist.
    fn parse_transition(id: &JobId, status: String) -> Result<JobStatus, BackendError> {
        if status.is_empty() {
            return Err(BackendError::JobNotFound(id.clone()));
        }
        JobStatus::parse(&status)
            .ok_or_else(|| BackendError::Decode(format!("unknown status {status:?}")))
    }

    async fn fetch_all(&self, ids: Vec<String>) -> Result<Vec<Job>, BackendError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            // Jobs destroyed between the index read and here are skipped.
            if let Some(job) = self.fetch_job(&JobId::from(id)).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn scan_heartbeat_keys(
        &self,
        conn: &mut ConnectionManager,
    ) -> Result<Vec<String>, BackendError> {
        let pattern = self.namespace.heartbeat_pattern();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(conn)
                .await
                .map_err(transport)?;
            keys.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, BackendError> {
        let id = JobId::random();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(self.namespace.job(&id), &codec::hash_fields(&id, &job))
            .ignore()
            .zadd(
                self.namespace.status(JobStatus::Queued),
                id.as_str(),
                -job.priority,
            )
            .ignore()
            .zadd(self.namespace.time(), id.as_str(), codec::to_ns(job.time))
            .ignore()
            .sadd(self.namespace.job_type(&job.type_name), id.as_str())
            .ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(transport)?;
        Ok(id)
    }

    async fn reserve_jobs(
        &self,
        batch_size: usize,
        pool_id: &PoolId,
    ) -> Result<Vec<ReservedJob>, BackendError> {
        let mut conn = self.conn.clone();
        let reply: Vec<(String, String, Vec<u8>)> = self
            .scripts
            .pop_next_jobs
            .arg(self.namespace.prefix())
            .arg(batch_size)
            .arg(pool_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        Ok(reply
            .into_iter()
            .map(|(id, type_name, payload)| ReservedJob {
                id: JobId::from(id),
                type_name,
                payload,
            })
            .collect())
    }

    async fn retry_or_fail(&self, id: &JobId, error: &str) -> Result<JobStatus, BackendError> {
        let mut conn = self.conn.clone();
        let status: String = self
            .scripts
            .retry_or_fail
            .arg(self.namespace.prefix())
            .arg(id.as_str())
            .arg(error)
            .arg("0")
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        Self::parse_transition(id, status)
    }

    async fn fail_job(&self, id: &JobId, error: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let status: String = self
            .scripts
            .retry_or_fail
            .arg(self.namespace.prefix())
            .arg(id.as_str())
            .arg(error)
            .arg("1")
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        Self::parse_transition(id, status).map(|_| ())
    }

    async fn mark_finished(&self, id: &JobId) -> Result<JobStatus, BackendError> {
        let mut conn = self.conn.clone();
        let status: String = self
            .scripts
            .mark_finished
            .arg(self.namespace.prefix())
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        Self::parse_transition(id, status)
    }

    async fn cancel_job(&self, id: &JobId) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let status: String = self
            .scripts
            .cancel
            .arg(self.namespace.prefix())
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        match Self::parse_transition(id, status)? {
            JobStatus::Cancelled => Ok(()),
            refused => Err(BackendError::NotCancellable(id.clone(), refused)),
        }
    }

    async fn destroy_job(&self, id: &JobId) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .scripts
            .destroy
            .arg(self.namespace.prefix())
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        if removed == 0 {
            return Err(BackendError::JobNotFound(id.clone()));
        }
        Ok(())
    }

    async fn fetch_job(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, Vec<u8>> = conn
            .hgetall(self.namespace.job(id))
            .await
            .map_err(transport)?;
        if map.is_empty() {
            return Ok(None);
        }
        codec::job_from_hash(map).map(Some)
    }

    async fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, BackendError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrange(self.namespace.status(status), 0, -1)
            .await
            .map_err(transport)?;
        self.fetch_all(ids).await
    }

    async fn jobs_by_type(&self, type_name: &str) -> Result<Vec<Job>, BackendError> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = conn
            .smembers(self.namespace.job_type(type_name))
            .await
            .map_err(transport)?;
        ids.sort();
        self.fetch_all(ids).await
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, BackendError> {
        let mut conn = self.conn.clone();
        conn.zcard(self.namespace.status(status))
            .await
            .map_err(transport)
    }

    async fn count_by_type(&self, type_name: &str) -> Result<u64, BackendError> {
        let mut conn = self.conn.clone();
        conn.scard(self.namespace.job_type(type_name))
            .await
            .map_err(transport)
    }

    async fn heartbeat(&self, pool_id: &PoolId) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(
                self.namespace.heartbeat(pool_id),
                codec::to_ns(Utc::now()),
            )
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn stale_pools(&self, stale_after: TimeDelta) -> Result<Vec<PoolId>, BackendError> {
        let mut conn = self.conn.clone();
        let keys = self.scan_heartbeat_keys(&mut conn).await?;
        let now = self.store_now(&mut conn).await?;
        let stale_ns = stale_after.num_nanoseconds().unwrap_or(i64::MAX);

        let mut stale = Vec::new();
        for key in keys {
            let Some(pool_id) = self.namespace.pool_of_heartbeat_key(&key) else {
                continue;
            };
            let last: Option<i64> = conn.get(&key).await.map_err(transport)?;
            if let Some(last) = last {
                if now - last > stale_ns {
                    stale.push(pool_id);
                }
            }
        }
        Ok(stale)
    }

    async fn purge_stale_pool(&self, pool_id: &PoolId) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _requeued: i64 = self
            .scripts
            .purge_stale_pool
            .arg(self.namespace.prefix())
            .arg(pool_id.as_str())
            .arg(STALE_POOL_ERROR)
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        Ok(())
    }
}
