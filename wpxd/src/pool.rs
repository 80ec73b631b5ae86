use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use wpx_core::fork_options::DaemonForkOptions;
use wpx_core::request::Request;
use wpx_core::stoppable::{CompositeStoppable, Stoppable};
use wpx_core::value::Value;
use wpx_core::WorkerError;

/// A running worker as seen by the pool.
#[async_trait]
pub trait DaemonClient: Stoppable + 'static {
    /// The options the worker was started with.
    fn fork_options(&self) -> &DaemonForkOptions;

    async fn execute(&self, request: Request) -> Result<Value, WorkerError>;

    /// Runs `request` as the worker's last one; the worker exits after answering.
    async fn execute_then_stop(&self, request: Request) -> Result<Value, WorkerError>;
}

#[async_trait]
pub trait DaemonStarter: Send + Sync + 'static {
    type Client: DaemonClient;

    async fn start(
        &self,
        implementation: &str,
        working_dir: &Path,
        fork_options: &DaemonForkOptions,
    ) -> Result<Arc<Self::Client>>;
}

struct PoolState<C> {
    all: Vec<Arc<C>>,
    idle: Vec<Arc<C>>,
}

/// Workers for one implementation. The lock is never held while a worker
/// starts or stops.
pub struct DaemonPool<S: DaemonStarter> {
    implementation: String,
    starter: Arc<S>,
    state: Mutex<PoolState<S::Client>>,
}

impl<S: DaemonStarter> DaemonPool<S> {
    pub fn new(implementation: impl Into<String>, starter: Arc<S>) -> Self {
        Self {
            implementation: implementation.into(),
            starter,
            state: Mutex::new(PoolState {
                all: Vec::new(),
                idle: Vec::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PoolState<S::Client>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    /// Takes the first idle worker whose options cover `fork_options`.
    pub fn reserve_idle_client(&self, fork_options: &DaemonForkOptions) -> Option<Arc<S::Client>> {
        let mut state = self.state();
        let idx = state
            .idle
            .iter()
            .position(|client| client.fork_options().is_compatible_with(fork_options))?;
        let client = state.idle.remove(idx);
        debug!(implementation = %self.implementation, "reusing idle worker");
        Some(client)
    }

    /// Starts a new worker. Several may start concurrently; only registration
    /// takes the lock.
    pub async fn reserve_new_client(
        &self,
        working_dir: &Path,
        fork_options: &DaemonForkOptions,
    ) -> Result<Arc<S::Client>> {
        let client = self
            .starter
            .start(&self.implementation, working_dir, fork_options)
            .await?;
        self.state().all.push(Arc::clone(&client));
        info!(
            implementation = %self.implementation,
            options = %client.fork_options(),
            "started new worker"
        );
        Ok(client)
    }

    /// Returns a worker to the idle set. Liveness is not checked.
    pub fn release(&self, client: Arc<S::Client>) {
        let mut state = self.state();
        if state.idle.iter().any(|idle| Arc::ptr_eq(idle, &client)) {
            return;
        }
        state.idle.push(client);
    }

    pub fn all_clients(&self) -> Vec<Arc<S::Client>> {
        self.state().all.clone()
    }

    pub fn idle_count(&self) -> usize {
        self.state().idle.len()
    }

    /// Stops every worker ever started, idle or not, then forgets them.
    pub async fn stop(&self) -> Result<()> {
        let clients = {
            let mut state = self.state();
            state.idle.clear();
            std::mem::take(&mut state.all)
        };
        if clients.is_empty() {
            return Ok(());
        }
        info!(implementation = %self.implementation, count = clients.len(), "stopping workers");
        let mut composite = CompositeStoppable::new();
        for (idx, client) in clients.into_iter().enumerate() {
            composite.push(format!("{} worker #{}", self.implementation, idx + 1), client);
        }
        composite.stop().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use wpx_core::loader::{ClassLoader, StaticTypeSource, ILLEGAL_STATE_CLASS};
    use wpx_core::value::RemoteError;

    pub(crate) struct FakeClient {
        pub id: usize,
        pub options: DaemonForkOptions,
        pub stopped: AtomicBool,
        pub fail_stop: bool,
    }

    #[async_trait]
    impl Stoppable for FakeClient {
        async fn stop(&self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            if self.fail_stop {
                return Err(anyhow!("worker {} is wedged", self.id));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DaemonClient for FakeClient {
        fn fork_options(&self) -> &DaemonForkOptions {
            &self.options
        }

        /// `fail` raises a user error, `crash` loses the connection and
        /// anything else echoes the first argument.
        async fn execute(&self, request: Request) -> Result<Value, WorkerError> {
            match request.method.as_str() {
                "fail" => {
                    let system = ClassLoader::system(Vec::new(), Arc::new(StaticTypeSource::new()));
                    let err = RemoteError::system(&system, ILLEGAL_STATE_CLASS, "boom")?;
                    Err(WorkerError::Remote(err))
                }
                "crash" => Err(WorkerError::NoResponse),
                _ => Ok(request.args.into_iter().next().unwrap_or(Value::Null)),
            }
        }

        async fn execute_then_stop(&self, request: Request) -> Result<Value, WorkerError> {
            let result = self.execute(request).await;
            self.stopped.store(true, Ordering::SeqCst);
            result
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeStarter {
        pub started: AtomicUsize,
        pub fail_stop_every: Option<usize>,
    }

    #[async_trait]
    impl DaemonStarter for FakeStarter {
        type Client = FakeClient;

        async fn start(
            &self,
            _implementation: &str,
            _working_dir: &Path,
            fork_options: &DaemonForkOptions,
        ) -> Result<Arc<FakeClient>> {
            let id = self.started.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Arc::new(FakeClient {
                id,
                options: fork_options.clone(),
                stopped: AtomicBool::new(false),
                fail_stop: self.fail_stop_every.is_some_and(|n| id % n == 0),
            }))
        }
    }

    fn options(max: &str, classpath: &[&str]) -> DaemonForkOptions {
        DaemonForkOptions::new()
            .with_heap(None, Some(max))
            .unwrap()
            .with_classpath(classpath.iter().copied())
    }

    #[tokio::test]
    async fn incompatible_classpath_starts_second_worker() {
        let pool = DaemonPool::new("compiler", Arc::new(FakeStarter::default()));
        let dir = std::env::temp_dir();
        let a = options("512m", &["x.jar"]);
        let b = options("256m", &["x.jar", "y.jar"]);

        assert!(pool.reserve_idle_client(&a).is_none());
        let first = pool.reserve_new_client(&dir, &a).await.unwrap();
        pool.release(first);

        assert!(pool.reserve_idle_client(&b).is_none());
        let second = pool.reserve_new_client(&dir, &b).await.unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(pool.all_clients().len(), 2);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn compatible_idle_worker_is_reused_once() {
        let pool = DaemonPool::new("compiler", Arc::new(FakeStarter::default()));
        let dir = std::env::temp_dir();
        let big = options("1g", &["x.jar", "y.jar"]);
        let client = pool.reserve_new_client(&dir, &big).await.unwrap();
        pool.release(Arc::clone(&client));
        pool.release(client);
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.reserve_idle_client(&options("256m", &["y.jar"])).unwrap();
        assert_eq!(reused.id, 1);
        assert!(pool.reserve_idle_client(&options("256m", &["y.jar"])).is_none());
    }

    #[tokio::test]
    async fn stop_reaches_every_worker_and_aggregates_failures() {
        let starter = Arc::new(FakeStarter {
            fail_stop_every: Some(2),
            ..FakeStarter::default()
        });
        let pool = DaemonPool::new("compiler", starter);
        let dir = std::env::temp_dir();
        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(pool.reserve_new_client(&dir, &DaemonForkOptions::new()).await.unwrap());
        }
        pool.release(Arc::clone(&clients[0]));

        let err = pool.stop().await.unwrap_err().to_string();
        assert!(err.contains("worker 2 is wedged"));
        assert!(clients.iter().all(|c| c.stopped.load(Ordering::SeqCst)));
        assert!(pool.all_clients().is_empty());
        assert_eq!(pool.idle_count(), 0);
    }
}
