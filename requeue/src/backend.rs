use std::ops::Deref;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::{
    job::{Job, JobId, JobStatus},
    pool::PoolId,
};

pub mod memory;

/// A job about to be persisted for the first time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub type_name: String,
    pub payload: Vec<u8>,
    pub priority: i64,
    pub time: DateTime<Utc>,
    pub freq: Option<TimeDelta>,
    pub retries: u32,
}

/// What a reservation hands to a worker: just enough to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedJob {
    pub id: JobId,
    pub type_name: String,
    pub payload: Vec<u8>,
}

/// The store gateway contract.
///
/// Every multi-step state transition behind these operations is atomic on
/// the store side; implementations must not replicate the transitions
/// client-side, since that reintroduces races under multi-pool deployment.
///
/// Transport and store failures surface as [`BackendError::Transport`]; the
/// gateway itself never retries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Persists a new job and indexes it as `queued`, all in one
    /// transaction.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, BackendError>;

    /// Atomically moves up to `batch_size` ready jobs (queued, eligible by
    /// time, highest priority first, ties by ascending id) into `executing`
    /// under `pool_id` and returns them. Returns fewer when fewer are
    /// ready; never blocks.
    async fn reserve_jobs(
        &self,
        batch_size: usize,
        pool_id: &PoolId,
    ) -> Result<Vec<ReservedJob>, BackendError>;

    /// Records a failed execution: re-queues the job if it has retry budget
    /// left (decrementing it, leaving `time` unchanged), otherwise fails it
    /// permanently with `error`. No-op unless the job is executing.
    async fn retry_or_fail(&self, id: &JobId, error: &str) -> Result<JobStatus, BackendError>;

    /// Fails the job permanently regardless of remaining retries. Used for
    /// errors a retry cannot fix (unknown type, undecodable payload).
    async fn fail_job(&self, id: &JobId, error: &str) -> Result<(), BackendError>;

    /// Marks a successful execution. One-off jobs become `finished`;
    /// recurring jobs go back to `queued` with `time` advanced past now.
    /// Returns the resulting status. No-op unless the job is executing.
    async fn mark_finished(&self, id: &JobId) -> Result<JobStatus, BackendError>;

    /// Moves a non-terminal job to `cancelled`, preventing any future
    /// execution. A running handler is not interrupted.
    async fn cancel_job(&self, id: &JobId) -> Result<(), BackendError>;

    /// Removes the job from every index and deletes its attributes.
    async fn destroy_job(&self, id: &JobId) -> Result<(), BackendError>;

    async fn fetch_job(&self, id: &JobId) -> Result<Option<Job>, BackendError>;

    async fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, BackendError>;

    async fn jobs_by_type(&self, type_name: &str) -> Result<Vec<Job>, BackendError>;

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, BackendError>;

    async fn count_by_type(&self, type_name: &str) -> Result<u64, BackendError>;

    /// Records that `pool_id` is alive right now.
    async fn heartbeat(&self, pool_id: &PoolId) -> Result<(), BackendError>;

    /// Discovers pools whose last heartbeat is older than `stale_after`.
    async fn stale_pools(&self, stale_after: TimeDelta) -> Result<Vec<PoolId>, BackendError>;

    /// Re-queues (or fails, when out of retries) every job owned by
    /// `pool_id` and deletes the pool's heartbeat and executing set.
    /// Idempotent and safe to invoke concurrently from several live pools.
    async fn purge_stale_pool(&self, pool_id: &PoolId) -> Result<(), BackendError>;
}

#[async_trait]
impl<T, S> Backend for S
where
    T: Backend,
    S: Deref<Target = T> + Send + Sync,
{
    async fn enqueue(&self, job: NewJob) -> Result<JobId, BackendError> {
        self.deref().enqueue(job).await
    }
    async fn reserve_jobs(
        &self,
        batch_size: usize,
        pool_id: &PoolId,
    ) -> Result<Vec<ReservedJob>, BackendError> {
        self.deref().reserve_jobs(batch_size, pool_id).await
    }
    async fn retry_or_fail(&self, id: &JobId, error: &str) -> Result<JobStatus, BackendError> {
        self.deref().retry_or_fail(id, error).await
    }
    async fn fail_job(&self, id: &JobId, error: &str) -> Result<(), BackendError> {
        self.deref().fail_job(id, error).await
    }
    async fn mark_finished(&self, id: &JobId) -> Result<JobStatus, BackendError> {
        self.deref().mark_finished(id).await
    }
    async fn cancel_job(&self, id: &JobId) -> Result<(), BackendError> {
        self.deref().cancel_job(id).await
    }
    async fn destroy_job(&self, id: &JobId) -> Result<(), BackendError> {
        self.deref().destroy_job(id).await
    }
    async fn fetch_job(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        self.deref().fetch_job(id).await
    }
    async fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, BackendError> {
        self.deref().jobs_by_status(status).await
    }
    async fn jobs_by_type(&self, type_name: &str) -> Result<Vec<Job>, BackendError> {
        self.deref().jobs_by_type(type_name).await
    }
    async fn count_by_status(&self, status: JobStatus) -> Result<u64, BackendError> {
        self.deref().count_by_status(status).await
    }
    async fn count_by_type(&self, type_name: &str) -> Result<u64, BackendError> {
        self.deref().count_by_type(type_name).await
    }
    async fn heartbeat(&self, pool_id: &PoolId) -> Result<(), BackendError> {
        self.deref().heartbeat(pool_id).await
    }
    async fn stale_pools(&self, stale_after: TimeDelta) -> Result<Vec<PoolId>, BackendError> {
        self.deref().stale_pools(stale_after).await
    }
    async fn purge_stale_pool(&self, pool_id: &PoolId) -> Result<(), BackendError> {
        self.deref().purge_stale_pool(pool_id).await
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// Network or store failure. Retriable: the dispatcher tries again on
    /// its next poll.
    #[error("store transport failure: {0}")]
    Transport(String),
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("job {0} is {1} and cannot be cancelled")]
    NotCancellable(JobId, JobStatus),
    #[error("failed to decode stored job: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, BackendError::Transport(_))
    }
}
