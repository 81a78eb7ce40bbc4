use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use futures::future::BoxFuture;
use thiserror::Error;

use crate::job_type::JobType;

/// Failure modes of a worker's attempt to run one reserved job.
///
/// `UnknownType` and `Decode` are permanent: retrying cannot fix them, so
/// the job skips its retry budget and fails outright.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("unknown job type: {0}")]
    UnknownType(String),
    #[error("failed to decode payload: {0}")]
    Decode(String),
    #[error("{0}")]
    Handler(String),
    #[error("handler panicked: {0}")]
    Panic(String),
}

impl WorkerError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, WorkerError::UnknownType(_) | WorkerError::Decode(_))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job type {0:?} is already registered")]
    DuplicateType(&'static str),
}

type RunnerFuture = BoxFuture<'static, Result<(), WorkerError>>;

/// A registered job type, erased down to what a worker needs: the retry
/// budget and a closure that decodes a payload and runs the handler.
pub(crate) struct RegisteredType {
    pub(crate) retries: u32,
    runner: Box<dyn Fn(Vec<u8>) -> RunnerFuture + Send + Sync>,
}

impl RegisteredType {
    pub(crate) fn run(&self, payload: Vec<u8>) -> RunnerFuture {
        (self.runner)(payload)
    }
}

/// Process-local, append-only mapping from a job-type name to its handler.
///
/// Registration normally happens once at startup; lookups are taken out on
/// the hot path by every worker, so entries are shared behind `Arc` and the
/// table is never mutated after the pool starts.
#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<HashMap<&'static str, Arc<RegisteredType>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `T::NAME` with the given retry budget.
    /// Registering the same name twice is an error.
    pub(crate) fn insert<T: JobType>(
        &self,
        handler: T,
        retries: u32,
    ) -> Result<(), RegistryError> {
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        if types.contains_key(T::NAME) {
            return Err(RegistryError::DuplicateType(T::NAME));
        }
        let handler = Arc::new(handler);
        let runner = Box::new(move |payload: Vec<u8>| -> RunnerFuture {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let data =
                    T::decode(&payload).map_err(|err| WorkerError::Decode(err.to_string()))?;
                handler
                    .perform(data)
                    .await
                    .map_err(|err| WorkerError::Handler(err.to_string()))
            })
        });
        types.insert(T::NAME, Arc::new(RegisteredType { retries, runner }));
        Ok(())
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<RegisteredType>> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}
