//! Imports the types needed by most applications.
//!
//! ```
//! # #![allow(unused_imports)]
//! use requeue::prelude::*;
//! ```
pub use crate::backend::{Backend, BackendError, NewJob, ReservedJob};
pub use crate::client::{Client, JobHandle, TypeHandle};
pub use crate::job::{Job, JobId, JobStatus};
pub use crate::job_type::{CodecError, HandlerError, JobType};
pub use crate::pool::{Pool, PoolConfig, PoolError, PoolId};
pub use crate::registry::{RegistryError, TypeRegistry, WorkerError};
pub use crate::RequeueError;
