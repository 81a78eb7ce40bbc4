use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinError};
use tracing::instrument;

use crate::{
    backend::{Backend, ReservedJob},
    registry::{TypeRegistry, WorkerError},
};

/// Receives reserved jobs from the dispatcher until the channel closes.
///
/// The receiver lock is held only while waiting for a job, never while
/// executing one, so a slow handler does not starve the other workers.
pub(crate) async fn worker_loop<B: Backend>(
    backend: B,
    registry: Arc<TypeRegistry>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<ReservedJob>>>,
) {
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else { break };
        execute_one(&backend, &registry, job).await;
    }
}

/// Runs one reserved job to its terminal transition.
///
/// The handler itself runs inside a spawned task so that a panic surfaces
/// as a [`JoinError`] instead of taking the worker down. The worker never
/// re-queues a job locally; every transition goes through the store.
#[instrument(skip_all, fields(job_id = %job.id, job_type = %job.type_name))]
pub(crate) async fn execute_one<B: Backend>(
    backend: &B,
    registry: &TypeRegistry,
    job: ReservedJob,
) {
    let outcome = run_handler(registry, &job).await;
    match outcome {
        Ok(()) => {
            match backend.mark_finished(&job.id).await {
                Ok(status) => tracing::debug!(%status, "Job finished"),
                Err(err) => tracing::error!(?err, "Failed to record job completion"),
            }
        }
        Err(worker_error) if worker_error.is_permanent() => {
            tracing::warn!(%worker_error, "Job failed permanently");
            if let Err(err) = backend.fail_job(&job.id, &worker_error.to_string()).await {
                tracing::error!(?err, "Failed to record permanent failure");
            }
        }
        Err(worker_error) => {
            match backend
                .retry_or_fail(&job.id, &worker_error.to_string())
                .await
            {
                Ok(status) => tracing::warn!(%worker_error, %status, "Job failed"),
                Err(err) => tracing::error!(?err, "Failed to record job failure"),
            }
        }
    }
}

async fn run_handler(registry: &TypeRegistry, job: &ReservedJob) -> Result<(), WorkerError> {
    let Some(entry) = registry.lookup(&job.type_name) else {
        return Err(WorkerError::UnknownType(job.type_name.clone()));
    };
    match tokio::spawn(entry.run(job.payload.clone())).await {
        Ok(outcome) => outcome,
        Err(join_error) => Err(join_error.into()),
    }
}

impl From<JoinError> for WorkerError {
    fn from(value: JoinError) -> Self {
        let fallback = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(fallback),
            Err(_) => fallback,
        };
        WorkerError::Panic(message)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, NewJob},
        job::JobStatus,
        job_type::{HandlerError, JobType},
        pool::PoolId,
    };

    struct Panicking;

    #[async_trait]
    impl JobType for Panicking {
        type Data = ();
        const NAME: &'static str = "panicking";
        const RETRIES: u32 = 0;

        async fn perform(&self, _data: ()) -> Result<(), HandlerError> {
            panic!("boom");
        }
    }

    async fn reserve_one(backend: &InMemoryBackend, type_name: &str) -> ReservedJob {
        backend
            .enqueue(NewJob {
                type_name: type_name.to_owned(),
                payload: b"null".to_vec(),
                priority: 0,
                time: Utc::now(),
                freq: None,
                retries: 0,
            })
            .await
            .unwrap();
        backend
            .reserve_jobs(1, &PoolId::random())
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn a_panicking_handler_fails_the_job_with_its_message() {
        let backend = InMemoryBackend::new();
        let registry = TypeRegistry::new();
        registry.insert(Panicking, 0).unwrap();

        let reserved = reserve_one(&backend, "panicking").await;
        let id = reserved.id.clone();
        execute_one(&backend, &registry, reserved).await;

        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn an_unregistered_type_fails_the_job_permanently() {
        let backend = InMemoryBackend::new();
        let registry = TypeRegistry::new();

        let reserved = reserve_one(&backend, "missing").await;
        let id = reserved.id.clone();
        execute_one(&backend, &registry, reserved).await;

        let job = backend.fetch_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("unknown job type"));
    }
}
