use std::fmt::Display;

use chrono::{DateTime, TimeDelta, Utc};

use crate::pool::PoolId;

pub mod builder;

/// Opaque unique identifier of a persisted job, assigned at creation.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a job currently sits in its lifecycle.
///
/// `Saved` exists only for the duration of the transactional write that
/// creates a job; other actors observe jobs going straight to `Queued`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobStatus {
    Saved,
    Queued,
    Executing,
    Finished,
    Failed,
    Cancelled,
    Destroyed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Saved,
        JobStatus::Queued,
        JobStatus::Executing,
        JobStatus::Finished,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Destroyed,
    ];

    pub fn as_str(&self) -> &'static str {
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

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    /// Terminal statuses cannot be cancelled and, for one-off jobs, end the
    /// lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Destroyed
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A point-in-time snapshot of a persisted job.
///
/// The payload is an opaque byte string; decoding it is the concern of the
/// job type it was scheduled under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub type_name: String,
    pub payload: Vec<u8>,
    /// Larger values run earlier.
    pub priority: i64,
    /// The instant at which the job first becomes eligible to run.
    pub time: DateTime<Utc>,
    /// Recurrence interval; `None` for one-off jobs.
    pub freq: Option<TimeDelta>,
    /// Remaining retry budget.
    pub retries: u32,
    pub status: JobStatus,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// Error captured when the job reached `Failed`.
    pub error: Option<String>,
    /// Identity of the pool currently executing the job.
    pub pool_id: Option<PoolId>,
}

impl Job {
    pub fn is_recurring(&self) -> bool {
        self.freq.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_its_string_form() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Saved.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Executing.is_terminal());
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Destroyed.is_terminal());
    }

    #[test]
    fn job_ids_are_unique_and_opaque() {
        let a = JobId::random();
        let b = JobId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }
}
