use std::marker::PhantomData;

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    backend::{Backend, NewJob},
    client::JobHandle,
    job_type::JobType,
    RequeueError,
};

/// Builder for scheduling a job of type `T`.
///
/// Produced by [`crate::client::TypeHandle::build`]; the plain
/// `schedule`/`schedule_recurring` shorthands on the handle cover the
/// common cases.
pub struct JobBuilder<T, B>
where
    T: JobType,
{
    backend: B,
    priority: i64,
    run_at: DateTime<Utc>,
    every: Option<TimeDelta>,
    retries: u32,
    _job_type: PhantomData<fn(T)>,
}

impl<T, B> JobBuilder<T, B>
where
    T: JobType,
    B: Backend + Clone,
{
    pub(crate) fn new(backend: B, retries: u32) -> Self {
        Self {
            backend,
            priority: 0,
            run_at: Utc::now(),
            every: None,
            retries,
            _job_type: PhantomData,
        }
    }

    /// Larger priorities run earlier. Defaults to 0.
    pub fn with_priority(self, priority: i64) -> Self {
        Self { priority, ..self }
    }

    /// Earliest instant the job may run. Defaults to now.
    pub fn run_at(self, run_at: DateTime<Utc>) -> Self {
        Self { run_at, ..self }
    }

    /// Shorthand for [`JobBuilder::run_at`] relative to now.
    pub fn run_in(self, delay: TimeDelta) -> Self {
        Self {
            run_at: Utc::now() + delay,
            ..self
        }
    }

    /// Makes the job recurring: after each successful completion it is
    /// re-queued with its eligible time advanced past now by `every`.
    pub fn recurring_every(self, every: TimeDelta) -> Self {
        Self {
            every: Some(every),
            ..self
        }
    }

    /// Overrides the retry budget the type was registered with.
    pub fn with_retries(self, retries: u32) -> Self {
        Self { retries, ..self }
    }

    /// Encodes `data` and writes the job to the store as `queued`.
    pub async fn schedule(self, data: T::Data) -> Result<JobHandle<B>, RequeueError> {
        if let Some(every) = self.every {
            if every <= TimeDelta::zero() {
                return Err(RequeueError::InvalidFrequency);
            }
        }
        let payload = T::encode(&data)?;
        let id = self
            .backend
            .enqueue(NewJob {
                type_name: T::NAME.to_owned(),
                payload,
                priority: self.priority,
                time: self.run_at,
                freq: self.every,
                retries: self.retries,
            })
            .await?;
        tracing::debug!(%id, job_type = T::NAME, "Scheduled job");
        Ok(JobHandle::new(id, self.backend))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        backend::MockBackend,
        job::JobId,
        job_type::test::EchoJob,
    };

    #[tokio::test]
    async fn schedule_writes_the_encoded_job() {
        let mut backend = MockBackend::new();
        let run_at = Utc::now() + TimeDelta::minutes(5);
        backend
            .expect_enqueue()
            .withf(move |job: &NewJob| {
                job.type_name == "echo"
                    && job.payload == b"\"hi\"".to_vec()
                    && job.priority == 3
                    && job.time == run_at
                    && job.freq.is_none()
                    && job.retries == 2
            })
            .return_once(|_| Ok(JobId::from("job-1")));

        let handle = JobBuilder::<EchoJob, _>::new(Arc::new(backend), 2)
            .with_priority(3)
            .run_at(run_at)
            .schedule("hi".to_owned())
            .await
            .unwrap();
        assert_eq!(handle.id(), &JobId::from("job-1"));
    }

    #[tokio::test]
    async fn a_non_positive_recurrence_is_rejected() {
        let backend = MockBackend::new();
        let result = JobBuilder::<EchoJob, _>::new(Arc::new(backend), 0)
            .recurring_every(TimeDelta::zero())
            .schedule("hi".to_owned())
            .await;
        assert_matches!(result, Err(RequeueError::InvalidFrequency));
    }
}
