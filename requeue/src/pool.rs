use std::{
    fmt::Display,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::TimeDelta;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Backend, BackendError, ReservedJob},
    registry::TypeRegistry,
};

pub(crate) mod worker;

/// Identity of a worker pool, shared by all the jobs it is executing.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PoolId(String);

impl PoolId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PoolId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker pool configuration. Zero values fall back to defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolConfig {
    /// Concurrent workers. Default: number of CPU cores.
    pub num_workers: usize,
    /// Jobs reserved per poll. Default: `num_workers`.
    pub batch_size: usize,
    /// Minimum delay between reservation polls. Default: 200 ms.
    pub min_wait: Duration,
    /// Interval between heartbeat writes and stale-pool sweeps.
    /// Default: 2 s.
    pub heartbeat_interval: Duration,
    /// Age past which another pool's heartbeat marks it stale.
    /// Default: 5 × `heartbeat_interval`.
    pub stale_timeout: Duration,
}

impl PoolConfig {
    const DEFAULT_MIN_WAIT: Duration = Duration::from_millis(200);
    const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(2);

    fn resolve(self) -> ResolvedConfig {
        let num_workers = if self.num_workers == 0 {
            std::thread::available_parallelism()
                .map(|cores| cores.get())
                .unwrap_or(1)
        } else {
            self.num_workers
        };
        let batch_size = if self.batch_size == 0 {
            num_workers
        } else {
            self.batch_size
        };
        let min_wait = if self.min_wait.is_zero() {
            Self::DEFAULT_MIN_WAIT
        } else {
            self.min_wait
        };
        let heartbeat_interval = if self.heartbeat_interval.is_zero() {
            Self::DEFAULT_HEARTBEAT
        } else {
            self.heartbeat_interval
        };
        let stale_timeout = if self.stale_timeout.is_zero() {
            heartbeat_interval * 5
        } else {
            self.stale_timeout
        };
        ResolvedConfig {
            num_workers,
            batch_size,
            min_wait,
            heartbeat_interval,
            stale_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ResolvedConfig {
    num_workers: usize,
    batch_size: usize,
    min_wait: Duration,
    heartbeat_interval: Duration,
    stale_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool has already been started or closed")]
    AlreadyStarted,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("pool task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    New,
    Running,
    Draining,
    Closed,
}

/// Records the first store error a pool task observes, for [`Pool::wait`].
#[derive(Clone, Default)]
struct ErrorSlot(Arc<Mutex<Option<BackendError>>>);

impl ErrorSlot {
    fn record(&self, error: BackendError) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn take(&self) -> Option<BackendError> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// A process-local supervisor of workers sharing one store connection and
/// one identity.
///
/// Lifecycle is `new → running → draining → closed`, strictly in that
/// order. [`Pool::start`] spawns one dispatcher, one heartbeat task and
/// `num_workers` workers; [`Pool::close`] stops the dispatcher from
/// reserving more work while buffered and in-flight jobs run to
/// completion; [`Pool::wait`] blocks until everything has exited.
pub struct Pool<B> {
    backend: B,
    registry: Arc<TypeRegistry>,
    config: ResolvedConfig,
    id: PoolId,
    state: Mutex<PoolState>,
    shutdown: CancellationToken,
    heartbeat_stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    first_error: ErrorSlot,
}

impl<B> Pool<B>
where
    B: Backend + Clone + Send + Sync + 'static,
{
    pub fn new(backend: B, registry: Arc<TypeRegistry>, config: PoolConfig) -> Self {
        Self {
            backend,
            registry,
            config: config.resolve(),
            id: PoolId::random(),
            state: Mutex::new(PoolState::New),
            shutdown: CancellationToken::new(),
            heartbeat_stop: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            heartbeat_task: Mutex::new(None),
            first_error: ErrorSlot::default(),
        }
    }

    pub fn id(&self) -> &PoolId {
        &self.id
    }

    /// Spawns the pool's tasks and begins reserving ready jobs.
    pub fn start(&self) -> Result<(), PoolError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != PoolState::New {
                return Err(PoolError::AlreadyStarted);
            }
            *state = PoolState::Running;
        }
        tracing::debug!(pool_id = %self.id, workers = self.config.num_workers, "Starting pool");

        let (sender, receiver) = mpsc::channel::<ReservedJob>(self.config.batch_size);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..self.config.num_workers {
            tasks.push(tokio::spawn(worker::worker_loop(
                self.backend.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&receiver),
            )));
        }
        tasks.push(tokio::spawn(dispatcher_loop(
            self.backend.clone(),
            sender,
            self.id.clone(),
            self.config,
            self.shutdown.clone(),
            self.first_error.clone(),
        )));
        *self
            .heartbeat_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tokio::spawn(heartbeat_loop(
            self.backend.clone(),
            self.id.clone(),
            self.config.heartbeat_interval,
            self.heartbeat_stop.clone(),
        )));
        Ok(())
    }

    /// Signals the dispatcher to stop reserving work. Buffered and
    /// in-flight jobs still run to completion; a running handler is never
    /// interrupted.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            PoolState::Running => *state = PoolState::Draining,
            PoolState::New => *state = PoolState::Closed,
            PoolState::Draining | PoolState::Closed => {}
        }
        self.shutdown.cancel();
    }

    /// Blocks until the dispatcher and all workers have exited, then
    /// returns the first store error observed, if any. Handler errors are
    /// never fatal to the pool.
    pub async fn wait(&self) -> Result<(), PoolError> {
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut join_failure = None;
        for task in tasks {
            if let Err(err) = task.await {
                join_failure.get_or_insert_with(|| PoolError::Join(err.to_string()));
            }
        }

        // Workers are done: the executing set is empty, so purging our own
        // identity just cleans up the heartbeat key.
        self.heartbeat_stop.cancel();
        let heartbeat = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = heartbeat {
            if let Err(err) = task.await {
                join_failure.get_or_insert_with(|| PoolError::Join(err.to_string()));
            }
        }
        if let Err(err) = self.backend.purge_stale_pool(&self.id).await {
            tracing::warn!(?err, pool_id = %self.id, "Failed to clean up pool identity");
        }

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = PoolState::Closed;
        tracing::debug!(pool_id = %self.id, "Pool shut down");

        if let Some(error) = self.first_error.take() {
            return Err(error.into());
        }
        match join_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn heartbeat_loop<B: Backend>(
    backend: B,
    pool_id: PoolId,
    interval: Duration,
    stop: CancellationToken,
) {
    loop {
        if let Err(err) = backend.heartbeat(&pool_id).await {
            tracing::warn!(?err, pool_id = %pool_id, "Failed to write pool heartbeat");
        }
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn dispatcher_loop<B: Backend>(
    backend: B,
    sender: mpsc::Sender<ReservedJob>,
    pool_id: PoolId,
    config: ResolvedConfig,
    shutdown: CancellationToken,
    first_error: ErrorSlot,
) {
    let mut last_sweep = Instant::now();
    loop {
        match backend.reserve_jobs(config.batch_size, &pool_id).await {
            Ok(jobs) => {
                for job in jobs {
                    // Handing off blocks once `batch_size` jobs are
                    // buffered; a send failure means every worker is gone.
                    if sender.send(job).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                if err.is_retriable() {
                    tracing::warn!(?err, pool_id = %pool_id, "Failed to reserve jobs, retrying next poll");
                } else {
                    tracing::error!(?err, pool_id = %pool_id, "Failed to reserve jobs");
                }
                first_error.record(err);
            }
        }

        if last_sweep.elapsed() >= config.heartbeat_interval {
            last_sweep = Instant::now();
            sweep_stale_pools(&backend, &pool_id, config.stale_timeout, &first_error).await;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.min_wait) => {}
        }
    }
    // Dropping the sender lets the workers drain the buffer and exit.
    tracing::debug!(pool_id = %pool_id, "Dispatcher draining");
}

async fn sweep_stale_pools<B: Backend>(
    backend: &B,
    own_id: &PoolId,
    stale_timeout: Duration,
    first_error: &ErrorSlot,
) {
    let stale_after = TimeDelta::from_std(stale_timeout).unwrap_or(TimeDelta::MAX);
    let stale = match backend.stale_pools(stale_after).await {
        Ok(stale) => stale,
        Err(err) => {
            tracing::warn!(?err, "Failed to scan for stale pools");
            first_error.record(err);
            return;
        }
    };
    for pool_id in stale.iter().filter(|pool_id| *pool_id != own_id) {
        tracing::info!(%pool_id, "Purging stale pool");
        if let Err(err) = backend.purge_stale_pool(pool_id).await {
            tracing::warn!(?err, %pool_id, "Failed to purge stale pool");
            first_error.record(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::backend::MockBackend;

    fn quick_config() -> PoolConfig {
        PoolConfig {
            num_workers: 2,
            batch_size: 4,
            min_wait: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn idle_mock() -> MockBackend {
        let mut backend = MockBackend::new();
        backend.expect_reserve_jobs().returning(|_, _| Ok(vec![]));
        backend.expect_heartbeat().returning(|_| Ok(()));
        backend.expect_stale_pools().returning(|_| Ok(vec![]));
        backend.expect_purge_stale_pool().returning(|_| Ok(()));
        backend
    }

    #[test]
    fn zero_config_values_fall_back_to_defaults() {
        let resolved = PoolConfig::default().resolve();
        assert!(resolved.num_workers >= 1);
        assert_eq!(resolved.batch_size, resolved.num_workers);
        assert_eq!(resolved.min_wait, Duration::from_millis(200));
        assert_eq!(resolved.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(resolved.stale_timeout, Duration::from_secs(10));
    }

    #[test]
    fn explicit_config_values_are_kept() {
        let resolved = PoolConfig {
            num_workers: 3,
            batch_size: 7,
            min_wait: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(1),
            stale_timeout: Duration::from_secs(60),
        }
        .resolve();
        assert_eq!(resolved.num_workers, 3);
        assert_eq!(resolved.batch_size, 7);
        assert_eq!(resolved.min_wait, Duration::from_millis(50));
        assert_eq!(resolved.stale_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let pool = Pool::new(Arc::new(idle_mock()), Arc::new(TypeRegistry::new()), quick_config());
        pool.start().unwrap();
        assert_matches!(pool.start(), Err(PoolError::AlreadyStarted));
        pool.close();
        pool.wait().await.unwrap();
    }

    #[tokio::test]
    async fn starting_a_closed_pool_is_an_error() {
        let pool = Pool::new(Arc::new(idle_mock()), Arc::new(TypeRegistry::new()), quick_config());
        pool.close();
        assert_matches!(pool.start(), Err(PoolError::AlreadyStarted));
    }

    #[tokio::test]
    async fn wait_surfaces_the_first_store_error() {
        let mut backend = MockBackend::new();
        backend
            .expect_reserve_jobs()
            .returning(|_, _| Err(BackendError::Transport("connection refused".to_owned())));
        backend.expect_heartbeat().returning(|_| Ok(()));
        backend.expect_stale_pools().returning(|_| Ok(vec![]));
        backend.expect_purge_stale_pool().returning(|_| Ok(()));

        let pool = Pool::new(Arc::new(backend), Arc::new(TypeRegistry::new()), quick_config());
        pool.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.close();
        assert_matches!(
            pool.wait().await,
            Err(PoolError::Backend(BackendError::Transport(_)))
        );
    }

    #[tokio::test]
    async fn dispatcher_sweeps_other_stale_pools() {
        let dead = PoolId::random();
        let mut backend = MockBackend::new();
        backend.expect_reserve_jobs().returning(|_, _| Ok(vec![]));
        backend.expect_heartbeat().returning(|_| Ok(()));
        let stale = dead.clone();
        backend
            .expect_stale_pools()
            .returning(move |_| Ok(vec![stale.clone()]));
        let purged = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&purged);
        backend.expect_purge_stale_pool().returning(move |pool_id| {
            seen.lock().unwrap().push(pool_id.clone());
            Ok(())
        });

        let pool = Pool::new(Arc::new(backend), Arc::new(TypeRegistry::new()), quick_config());
        pool.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.close();
        pool.wait().await.unwrap();

        let purged = purged.lock().unwrap();
        // The sweep purged the dead pool but never our own live id; the
        // only purge of our own id is the cleanup at the very end.
        assert!(purged.iter().any(|pool_id| pool_id == &dead));
        assert_eq!(
            purged.iter().filter(|pool_id| *pool_id == pool.id()).count(),
            1
        );
        assert_eq!(purged.last(), Some(pool.id()));
    }
}
