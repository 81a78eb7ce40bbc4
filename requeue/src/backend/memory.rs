//! An in-memory implementation of [`Backend`].
//!
//! Provided for testing purposes and not designed for use in a production
//! system: it is a correct implementation of the gateway contract, not an
//! optimized one, and it persists nothing.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{Backend, BackendError, NewJob, ReservedJob};
use crate::{
    job::{Job, JobId, JobStatus},
    pool::PoolId,
};

/// In-memory [`Backend`], shared by cloning.
///
/// Several "pools" may point at one instance to simulate a multi-process
/// deployment in tests; every operation takes the single state lock, which
/// stands in for the store's serial script execution.
#[derive(Clone, Default, Debug)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
}

#[derive(Default, Debug)]
struct State {
    jobs: HashMap<JobId, Job>,
    executing: HashMap<PoolId, HashSet<JobId>>,
    heartbeats: HashMap<PoolId, DateTime<Utc>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdates (or fabricates) a pool heartbeat. Test hook for staleness
    /// scenarios, mirroring a pool that stopped without a clean close.
    pub fn record_heartbeat_at(&self, pool_id: &PoolId, at: DateTime<Utc>) {
        self.lock().heartbeats.insert(pool_id.clone(), at);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn release_ownership(&mut self, id: &JobId, pool_id: Option<&PoolId>) {
        if let Some(pool_id) = pool_id {
            if let Some(owned) = self.executing.get_mut(pool_id) {
                owned.remove(id);
            }
        }
    }

    /// The shared tail of a failed execution: back to `queued` while budget
    /// remains (time untouched), otherwise permanently `failed`.
    fn fail_or_requeue(
        &mut self,
        id: &JobId,
        error: &str,
        force: bool,
    ) -> Result<JobStatus, BackendError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| BackendError::JobNotFound(id.clone()))?;
        if job.status != JobStatus::Executing {
            return Ok(job.status);
        }
        let owner = job.pool_id.take();
        if force || job.retries == 0 {
            job.status = JobStatus::Failed;
            job.error = Some(error.to_owned());
            job.finished = Some(Utc::now());
        } else {
            job.retries -= 1;
            job.status = JobStatus::Queued;
            job.started = None;
        }
        let status = job.status;
        let id = id.clone();
        self.release_ownership(&id, owner.as_ref());
        Ok(status)
    }
}

fn reservation_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    // Highest priority first, ties by ascending id.
    b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, BackendError> {
        let id = JobId::random();
        self.lock().jobs.insert(
            id.clone(),
            Job {
                id: id.clone(),
                type_name: job.type_name,
                payload: job.payload,
                priority: job.priority,
                time: job.time,
                freq: job.freq,
                retries: job.retries,
                status: JobStatus::Queued,
                started: None,
                finished: None,
                error: None,
                pool_id: None,
            },
        );
        Ok(id)
    }

    async fn reserve_jobs(
        &self,
        batch_size: usize,
        pool_id: &PoolId,
    ) -> Result<Vec<ReservedJob>, BackendError> {
        let now = Utc::now();
        let mut state = self.lock();

        let mut ready: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued && job.time <= now)
            .collect();
        ready.sort_by(|a, b| reservation_order(a, b));
        let picked: Vec<JobId> = ready
            .into_iter()
            .take(batch_size)
            .map(|job| job.id.clone())
            .collect();

        let mut reserved = Vec::with_capacity(picked.len());
        for id in picked {
            let job = state
                .jobs
                .get_mut(&id)
                .ok_or_else(|| BackendError::JobNotFound(id.clone()))?;
            job.status = JobStatus::Executing;
            job.pool_id = Some(pool_id.clone());
            job.started = Some(now);
            reserved.push(ReservedJob {
                id: id.clone(),
                type_name: job.type_name.clone(),
                payload: job.payload.clone(),
            });
            state.executing.entry(pool_id.clone()).or_default().insert(id);
        }
        Ok(reserved)
    }

    async fn retry_or_fail(&self, id: &JobId, error: &str) -> Result<JobStatus, BackendError> {
        self.lock().fail_or_requeue(id, error, false)
    }

    async fn fail_job(&self, id: &JobId, error: &str) -> Result<(), BackendError> {
        self.lock().fail_or_requeue(id, error, true).map(|_| ())
    }

    async fn mark_finished(&self, id: &JobId) -> Result<JobStatus, BackendError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| BackendError::JobNotFound(id.clone()))?;
        if job.status != JobStatus::Executing {
            return Ok(job.status);
        }
        let owner = job.pool_id.take();
        let status = match job.freq {
            Some(freq) => {
                let now = Utc::now();
                job.time = (job.time + freq).max(now + freq);
                job.status = JobStatus::Queued;
                job.started = None;
                job.finished = None;
                job.error = None;
                JobStatus::Queued
            }
            None => {
                job.status = JobStatus::Finished;
                job.finished = Some(Utc::now());
                JobStatus::Finished
            }
        };
        state.release_ownership(id, owner.as_ref());
        Ok(status)
    }

    async fn cancel_job(&self, id: &JobId) -> Result<(), BackendError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| BackendError::JobNotFound(id.clone()))?;
        if job.status.is_terminal() {
            return Err(BackendError::NotCancellable(id.clone(), job.status));
        }
        let owner = job.pool_id.take();
        job.status = JobStatus::Cancelled;
        state.release_ownership(id, owner.as_ref());
        Ok(())
    }

    async fn destroy_job(&self, id: &JobId) -> Result<(), BackendError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .remove(id)
            .ok_or_else(|| BackendError::JobNotFound(id.clone()))?;
        state.release_ownership(id, job.pool_id.as_ref());
        Ok(())
    }

    async fn fetch_job(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    async fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, BackendError> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by(reservation_order);
        Ok(jobs)
    }

    async fn jobs_by_type(&self, type_name: &str) -> Result<Vec<Job>, BackendError> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|job| job.type_name == type_name)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, BackendError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|job| job.status == status)
            .count() as u64)
    }

    async fn count_by_type(&self, type_name: &str) -> Result<u64, BackendError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|job| job.type_name == type_name)
            .count() as u64)
    }

    async fn heartbeat(&self, pool_id: &PoolId) -> Result<(), BackendError> {
        self.lock().heartbeats.insert(pool_id.clone(), Utc::now());
        Ok(())
    }

    async fn stale_pools(&self, stale_after: TimeDelta) -> Result<Vec<PoolId>, BackendError> {
        let now = Utc::now();
        Ok(self
            .lock()
            .heartbeats
            .iter()
            .filter(|(_, last)| now - **last > stale_after)
            .map(|(pool_id, _)| pool_id.clone())
            .collect())
    }

    async fn purge_stale_pool(&self, pool_id: &PoolId) -> Result<(), BackendError> {
        let mut state = self.lock();
        let owned = state.executing.remove(pool_id).unwrap_or_default();
        for id in owned {
            // Missing jobs were destroyed while orphaned; nothing to do.
            let _ = state.fail_or_requeue(&id, "requeued from stale pool", false);
        }
        state.heartbeats.remove(pool_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn new_job(type_name: &str, priority: i64, time: DateTime<Utc>) -> NewJob {
        NewJob {
            type_name: type_name.to_owned(),
            payload: b"{}".to_vec(),
            priority,
            time,
            freq: None,
            retries: 0,
        }
    }

    fn owned_ids(backend: &InMemoryBackend, pool_id: &PoolId) -> HashSet<JobId> {
        backend
            .lock()
            .executing
            .get(pool_id)
            .cloned()
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn enqueue_then_fetch_round_trips() {
        let backend = InMemoryBackend::new();
        let time = Utc::now();
        let id = backend
            .enqueue(NewJob {
                type_name: "greet".to_owned(),
                payload: b"\"world\"".to_vec(),
                priority: 7,
                time,
                freq: Some(TimeDelta::minutes(5)),
                retries: 3,
            })
            .await
            .unwrap();

        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.type_name, "greet");
        assert_eq!(job.payload, b"\"world\"");
        assert_eq!(job.priority, 7);
        assert_eq!(job.time, time);
        assert_eq!(job.freq, Some(TimeDelta::minutes(5)));
        assert_eq!(job.retries, 3);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.pool_id, None);
    }

    #[tokio::test]
    async fn reservation_is_by_priority_then_id() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let low = backend.enqueue(new_job("t", 0, now)).await.unwrap();
        let high = backend.enqueue(new_job("t", 100, now)).await.unwrap();
        let mid = backend.enqueue(new_job("t", 50, now)).await.unwrap();

        let pool = PoolId::random();
        let reserved = backend.reserve_jobs(10, &pool).await.unwrap();
        let ids: Vec<JobId> = reserved.into_iter().map(|job| job.id).collect();
        assert_eq!(ids, vec![high, mid, low]);
    }

    #[tokio::test]
    async fn tied_priorities_reserve_in_ascending_id_order() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(backend.enqueue(new_job("t", 1, now)).await.unwrap());
        }
        ids.sort();

        let reserved = backend.reserve_jobs(10, &PoolId::random()).await.unwrap();
        let got: Vec<JobId> = reserved.into_iter().map(|job| job.id).collect();
        assert_eq!(got, ids);
    }

    #[tokio::test]
    async fn reservation_skips_jobs_scheduled_in_the_future() {
        let backend = InMemoryBackend::new();
        let future = Utc::now() + TimeDelta::hours(1);
        backend.enqueue(new_job("t", 100, future)).await.unwrap();
        let due = backend
            .enqueue(new_job("t", 0, Utc::now()))
            .await
            .unwrap();

        let reserved = backend.reserve_jobs(10, &PoolId::random()).await.unwrap();
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].id, due);
    }

    #[tokio::test]
    async fn reservation_caps_at_batch_size_and_never_hands_out_twice() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        for _ in 0..5 {
            backend.enqueue(new_job("t", 0, now)).await.unwrap();
        }

        let pool_a = PoolId::random();
        let pool_b = PoolId::random();
        let first = backend.reserve_jobs(3, &pool_a).await.unwrap();
        let second = backend.reserve_jobs(10, &pool_b).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);

        let mut all: Vec<JobId> = first.iter().chain(&second).map(|j| j.id.clone()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn reserved_jobs_are_owned_by_the_reserving_pool() {
        let backend = InMemoryBackend::new();
        let id = backend
            .enqueue(new_job("t", 0, Utc::now()))
            .await
            .unwrap();
        let pool = PoolId::random();
        backend.reserve_jobs(1, &pool).await.unwrap();

        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Executing);
        assert_eq!(job.pool_id, Some(pool.clone()));
        assert!(job.started.is_some());
        assert!(owned_ids(&backend, &pool).contains(&id));
    }

    #[tokio::test]
    async fn retry_decrements_budget_and_requeues_without_moving_time() {
        let backend = InMemoryBackend::new();
        let time = Utc::now();
        let mut job = new_job("t", 0, time);
        job.retries = 2;
        let id = backend.enqueue(job).await.unwrap();
        let pool = PoolId::random();
        backend.reserve_jobs(1, &pool).await.unwrap();

        let status = backend.retry_or_fail(&id, "boom").await.unwrap();
        assert_eq!(status, JobStatus::Queued);

        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.retries, 1);
        assert_eq!(job.time, time);
        assert_eq!(job.pool_id, None);
        assert_eq!(job.started, None);
        assert!(owned_ids(&backend, &pool).is_empty());
    }

    #[tokio::test]
    async fn retry_with_exhausted_budget_fails_permanently() {
        let backend = InMemoryBackend::new();
        let id = backend
            .enqueue(new_job("t", 0, Utc::now()))
            .await
            .unwrap();
        backend.reserve_jobs(1, &PoolId::random()).await.unwrap();

        let status = backend.retry_or_fail(&id, "boom").await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.finished.is_some());
        assert_eq!(job.retries, 0);
    }

    #[tokio::test]
    async fn fail_job_ignores_the_remaining_budget() {
        let backend = InMemoryBackend::new();
        let mut job = new_job("t", 0, Utc::now());
        job.retries = 9;
        let id = backend.enqueue(job).await.unwrap();
        backend.reserve_jobs(1, &PoolId::random()).await.unwrap();

        backend.fail_job(&id, "unknown job type: t").await.unwrap();
        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, 9);
    }

    #[tokio::test]
    async fn retry_is_a_no_op_unless_executing() {
        let backend = InMemoryBackend::new();
        let id = backend
            .enqueue(new_job("t", 0, Utc::now()))
            .await
            .unwrap();

        let status = backend.retry_or_fail(&id, "boom").await.unwrap();
        assert_eq!(status, JobStatus::Queued);
        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.error, None);
    }

    #[tokio::test]
    async fn finishing_a_one_off_job_is_terminal() {
        let backend = InMemoryBackend::new();
        let id = backend
            .enqueue(new_job("t", 0, Utc::now()))
            .await
            .unwrap();
        let pool = PoolId::random();
        backend.reserve_jobs(1, &pool).await.unwrap();

        let status = backend.mark_finished(&id).await.unwrap();
        assert_eq!(status, JobStatus::Finished);

        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert!(job.finished.is_some());
        assert_eq!(job.pool_id, None);
        assert!(owned_ids(&backend, &pool).is_empty());
    }

    #[tokio::test]
    async fn finishing_a_recurring_job_requeues_it_past_now() {
        let backend = InMemoryBackend::new();
        let freq = TimeDelta::milliseconds(50);
        let mut job = new_job("t", 0, Utc::now() - TimeDelta::seconds(10));
        job.freq = Some(freq);
        let id = backend.enqueue(job).await.unwrap();
        backend.reserve_jobs(1, &PoolId::random()).await.unwrap();

        let before = Utc::now();
        let status = backend.mark_finished(&id).await.unwrap();
        assert_eq!(status, JobStatus::Queued);

        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        // The old eligible time was long past, so the schedule re-anchors to
        // strictly after the completion instant.
        assert!(job.time > before);
        assert_eq!(job.pool_id, None);
        assert_eq!(job.started, None);
        assert_eq!(job.finished, None);
    }

    #[tokio::test]
    async fn repeated_finish_calls_advance_time_once_each() {
        let backend = InMemoryBackend::new();
        let freq = TimeDelta::hours(1);
        let mut job = new_job("t", 0, Utc::now());
        job.freq = Some(freq);
        let id = backend.enqueue(job).await.unwrap();
        backend.reserve_jobs(1, &PoolId::random()).await.unwrap();

        backend.mark_finished(&id).await.unwrap();
        let first = backend.fetch_job(&id).await.unwrap().unwrap().time;

        // Not executing any more: a second call must not advance again.
        let status = backend.mark_finished(&id).await.unwrap();
        assert_eq!(status, JobStatus::Queued);
        let second = backend.fetch_job(&id).await.unwrap().unwrap().time;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cancel_prevents_future_execution() {
        let backend = InMemoryBackend::new();
        let id = backend
            .enqueue(new_job("t", 0, Utc::now()))
            .await
            .unwrap();
        backend.cancel_job(&id).await.unwrap();

        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(backend
            .reserve_jobs(1, &PoolId::random())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn cancel_of_a_terminal_job_is_refused() {
        let backend = InMemoryBackend::new();
        let id = backend
            .enqueue(new_job("t", 0, Utc::now()))
            .await
            .unwrap();
        backend.reserve_jobs(1, &PoolId::random()).await.unwrap();
        backend.mark_finished(&id).await.unwrap();

        assert_matches!(
            backend.cancel_job(&id).await,
            Err(BackendError::NotCancellable(_, JobStatus::Finished))
        );
    }

    #[tokio::test]
    async fn cancel_while_executing_releases_ownership() {
        let backend = InMemoryBackend::new();
        let id = backend
            .enqueue(new_job("t", 0, Utc::now()))
            .await
            .unwrap();
        let pool = PoolId::random();
        backend.reserve_jobs(1, &pool).await.unwrap();

        backend.cancel_job(&id).await.unwrap();
        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.pool_id, None);
        assert!(owned_ids(&backend, &pool).is_empty());

        // The handler that was running reports completion afterwards; the
        // transition is refused.
        let status = backend.mark_finished(&id).await.unwrap();
        assert_eq!(status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn destroy_removes_the_job_entirely() {
        let backend = InMemoryBackend::new();
        let id = backend
            .enqueue(new_job("t", 0, Utc::now()))
            .await
            .unwrap();
        backend.destroy_job(&id).await.unwrap();

        assert!(backend.fetch_job(&id).await.unwrap().is_none());
        assert_eq!(backend.count_by_type("t").await.unwrap(), 0);
        assert_matches!(
            backend.destroy_job(&id).await,
            Err(BackendError::JobNotFound(_))
        );
    }

    #[tokio::test]
    async fn queries_filter_by_status_and_type() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        backend.enqueue(new_job("a", 0, now)).await.unwrap();
        backend.enqueue(new_job("a", 0, now)).await.unwrap();
        backend.enqueue(new_job("b", 0, now)).await.unwrap();

        assert_eq!(backend.jobs_by_type("a").await.unwrap().len(), 2);
        assert_eq!(backend.count_by_type("b").await.unwrap(), 1);
        assert_eq!(
            backend.count_by_status(JobStatus::Queued).await.unwrap(),
            3
        );
        assert!(backend
            .jobs_by_status(JobStatus::Executing)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn stale_pools_are_detected_and_purged() {
        let backend = InMemoryBackend::new();
        let mut job = new_job("t", 0, Utc::now());
        job.retries = 1;
        let id = backend.enqueue(job).await.unwrap();

        let dead = PoolId::random();
        backend.reserve_jobs(1, &dead).await.unwrap();
        backend.record_heartbeat_at(&dead, Utc::now() - TimeDelta::minutes(5));

        let live = PoolId::random();
        backend.heartbeat(&live).await.unwrap();

        let stale = backend.stale_pools(TimeDelta::seconds(10)).await.unwrap();
        assert_eq!(stale, vec![dead.clone()]);

        backend.purge_stale_pool(&dead).await.unwrap();
        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retries, 0);
        assert_eq!(job.pool_id, None);
        assert!(owned_ids(&backend, &dead).is_empty());
        assert!(backend
            .stale_pools(TimeDelta::seconds(10))
            .await
            .unwrap()
            .is_empty());

        // A second purge of the same pool finds nothing to do.
        backend.purge_stale_pool(&dead).await.unwrap();
        assert_eq!(
            backend.fetch_job(&id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn purging_a_pool_with_an_exhausted_job_fails_it() {
        let backend = InMemoryBackend::new();
        let id = backend
            .enqueue(new_job("t", 0, Utc::now()))
            .await
            .unwrap();
        let dead = PoolId::random();
        backend.reserve_jobs(1, &dead).await.unwrap();

        backend.purge_stale_pool(&dead).await.unwrap();
        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("requeued from stale pool"));
    }
}
