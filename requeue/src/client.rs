use std::{marker::PhantomData, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    backend::{Backend, BackendError},
    job::{builder::JobBuilder, Job, JobId, JobStatus},
    job_type::JobType,
    pool::{Pool, PoolConfig},
    registry::{RegistryError, TypeRegistry},
    RequeueError,
};

/// Entry point of the library: owns the store gateway and the type
/// registry, hands out [`TypeHandle`]s to producers and [`Pool`]s to
/// consumers.
///
/// Cloning a backend is cheap (they share their connection), so one
/// `Client` per process is the expected shape.
pub struct Client<B> {
    backend: B,
    registry: Arc<TypeRegistry>,
}

impl<B> Client<B>
where
    B: Backend + Clone + Send + Sync + 'static,
{
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            registry: Arc::new(TypeRegistry::new()),
        }
    }

    /// Registers `handler` under `T::NAME` with the type's default retry
    /// budget. Registering a name twice is an error.
    pub fn register<T: JobType>(&self, handler: T) -> Result<TypeHandle<T, B>, RegistryError> {
        self.register_with_retries(handler, T::RETRIES)
    }

    /// Registers `handler` with an explicit retry budget.
    pub fn register_with_retries<T: JobType>(
        &self,
        handler: T,
        retries: u32,
    ) -> Result<TypeHandle<T, B>, RegistryError> {
        self.registry.insert(handler, retries)?;
        Ok(TypeHandle {
            backend: self.backend.clone(),
            retries,
            _job_type: PhantomData,
        })
    }

    /// Creates a worker pool over this client's backend and registry. The
    /// pool is not started.
    pub fn pool(&self, config: PoolConfig) -> Pool<B> {
        Pool::new(self.backend.clone(), Arc::clone(&self.registry), config)
    }

    pub async fn find_job(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        self.backend.fetch_job(id).await
    }

    pub async fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, BackendError> {
        self.backend.jobs_by_status(status).await
    }

    pub async fn jobs_by_type(&self, type_name: &str) -> Result<Vec<Job>, BackendError> {
        self.backend.jobs_by_type(type_name).await
    }

    pub async fn count_by_status(&self, status: JobStatus) -> Result<u64, BackendError> {
        self.backend.count_by_status(status).await
    }

    pub async fn count_by_type(&self, type_name: &str) -> Result<u64, BackendError> {
        self.backend.count_by_type(type_name).await
    }
}

/// Producer-side handle for one registered job type.
pub struct TypeHandle<T, B>
where
    T: JobType,
{
    backend: B,
    retries: u32,
    _job_type: PhantomData<fn(T)>,
}

impl<T, B> std::fmt::Debug for TypeHandle<T, B>
where
    T: JobType,
    B: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeHandle")
            .field("backend", &self.backend)
            .field("retries", &self.retries)
            .finish()
    }
}

impl<T, B> Clone for TypeHandle<T, B>
where
    T: JobType,
    B: Clone,
{
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            retries: self.retries,
            _job_type: PhantomData,
        }
    }
}

impl<T, B> TypeHandle<T, B>
where
    T: JobType,
    B: Backend + Clone,
{
    /// A builder for the less common scheduling options.
    pub fn build(&self) -> JobBuilder<T, B> {
        JobBuilder::new(self.backend.clone(), self.retries)
    }

    /// Schedules a one-off execution at `run_at`.
    pub async fn schedule(
        &self,
        priority: i64,
        run_at: DateTime<Utc>,
        data: T::Data,
    ) -> Result<JobHandle<B>, RequeueError> {
        self.build()
            .with_priority(priority)
            .run_at(run_at)
            .schedule(data)
            .await
    }

    /// Schedules a recurring execution: first at `first_run`, then again
    /// `every` after each successful completion.
    pub async fn schedule_recurring(
        &self,
        priority: i64,
        first_run: DateTime<Utc>,
        every: TimeDelta,
        data: T::Data,
    ) -> Result<JobHandle<B>, RequeueError> {
        self.build()
            .with_priority(priority)
            .run_at(first_run)
            .recurring_every(every)
            .schedule(data)
            .await
    }
}

/// Handle to one persisted job.
#[derive(Clone)]
pub struct JobHandle<B> {
    id: JobId,
    backend: B,
}

impl<B> std::fmt::Debug for JobHandle<B>
where
    B: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .finish()
    }
}

impl<B> JobHandle<B>
where
    B: Backend,
{
    pub(crate) fn new(id: JobId, backend: B) -> Self {
        Self { id, backend }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Re-reads the job from the store. A destroyed job is reported as
    /// [`JobStatus::Destroyed`].
    pub async fn status(&self) -> Result<JobStatus, BackendError> {
        Ok(self
            .backend
            .fetch_job(&self.id)
            .await?
            .map(|job| job.status)
            .unwrap_or(JobStatus::Destroyed))
    }

    /// Re-reads the full job snapshot.
    pub async fn refresh(&self) -> Result<Job, BackendError> {
        self.backend
            .fetch_job(&self.id)
            .await?
            .ok_or_else(|| BackendError::JobNotFound(self.id.clone()))
    }

    /// Prevents any future execution. Does not interrupt a handler that is
    /// already running.
    pub async fn cancel(&self) -> Result<(), BackendError> {
        self.backend.cancel_job(&self.id).await
    }

    /// Removes the job from every index and deletes its attributes.
    pub async fn destroy(&self) -> Result<(), BackendError> {
        self.backend.destroy_job(&self.id).await
    }
}
