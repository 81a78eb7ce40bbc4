//! Persistent, distributed background job processing on top of a shared
//! store.
//!
//! Producers register typed job definitions and schedule executions with a
//! priority and an earliest-run time; worker pools, possibly spread across
//! machines, cooperatively consume them so that each ready job is handed to
//! exactly one worker, surviving process restarts and power loss.
//!
//! # Architecture
//!
//! - [`job_type::JobType`]: a named, typed unit of work: payload type,
//!   handler body, codec, default retry budget.
//! - [`client::Client`]: owns a [`backend::Backend`] and the
//!   [`registry::TypeRegistry`]; producers get [`client::TypeHandle`]s from
//!   it, consumers get [`pool::Pool`]s.
//! - [`backend::Backend`]: the store gateway contract. Every multi-step
//!   transition is a single atomic operation on the store side, which is
//!   what makes multi-pool deployments race-free.
//! - [`backend::memory::InMemoryBackend`]: correct but unpersisted
//!   implementation for tests; the `requeue-redis` crate provides the
//!   production one.
//! - [`pool::Pool`]: dispatcher + heartbeat + workers. Reserves ready jobs
//!   in batches, executes handlers with panic capture, re-queues work owned
//!   by pools whose heartbeat went stale.
//!
//! # Quick start
//!
//! ```ignore
//! struct Greet;
//!
//! #[async_trait]
//! impl JobType for Greet {
//!     type Data = String;
//!     const NAME: &'static str = "greet";
//!     const RETRIES: u32 = 3;
//!
//!     async fn perform(&self, name: String) -> Result<(), HandlerError> {
//!         println!("hello, {name}");
//!         Ok(())
//!     }
//! }
//!
//! let client = Client::new(backend);
//! let greet = client.register(Greet)?;
//! greet.schedule(0, Utc::now(), "world".to_owned()).await?;
//!
//! let pool = client.pool(PoolConfig::default());
//! pool.start()?;
//! // ... on shutdown:
//! pool.close();
//! pool.wait().await?;
//! ```

use thiserror::Error;

pub mod backend;
pub mod client;
pub mod job;
pub mod job_type;
pub mod pool;
pub mod prelude;
pub mod registry;

use backend::BackendError;
use job_type::CodecError;
use registry::RegistryError;

#[derive(Debug, Error)]
pub enum RequeueError {
    #[error("error communicating with the backing store")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to encode job payload: {0}")]
    Encode(#[from] CodecError),
    #[error("recurrence interval must be positive")]
    InvalidFrequency,
}
