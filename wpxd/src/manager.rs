use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tracing::{info, warn};
use wpx_core::address::ServerAddress;
use wpx_core::connection::SerializerRegistry;
use wpx_core::fork_options::DaemonForkOptions;
use wpx_core::loader::{ClassLoader, DirectoryTypeSource};
use wpx_core::payload::{PayloadClassLoaderRegistry, PayloadSerializer, RegistryOptions};
use wpx_core::protocol::standard_serializers;
use wpx_core::request::{ArgumentSerializerRegistry, Request};
use wpx_core::stoppable::{CompositeStoppable, Stoppable};
use wpx_core::value::Value;
use wpx_core::WorkerError;

use crate::client::WorkerClient;
use crate::config::CoordinatorConfig;
use crate::pool::{DaemonClient, DaemonPool, DaemonStarter};
use crate::process::WorkerProcessBuilder;

/// Starts real `wpxw` processes.
pub struct WorkerDaemonStarter {
    config: CoordinatorConfig,
    system: Arc<ClassLoader>,
    serializers: Arc<SerializerRegistry>,
    next_id: AtomicI64,
}

impl WorkerDaemonStarter {
    pub fn new(config: CoordinatorConfig) -> Self {
        let source = Arc::new(DirectoryTypeSource);
        let system = ClassLoader::system(config.system_classpath.clone(), source.clone());
        let registry = Arc::new(PayloadClassLoaderRegistry::new(
            Arc::clone(&system),
            source,
            RegistryOptions {
                reuse_client_owned_loaders: config.reuse_client_owned_loaders,
            },
        ));
        let serializers = standard_serializers(
            PayloadSerializer::new(registry),
            ArgumentSerializerRegistry::with_scalars(),
        );
        Self {
            config,
            system,
            serializers: Arc::new(serializers),
            next_id: AtomicI64::new(1),
        }
    }

    /// The coordinator's system loader, for building request arguments.
    pub fn system_loader(&self) -> &Arc<ClassLoader> {
        &self.system
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Unix socket paths get a per-worker suffix; TCP listeners are ephemeral.
    fn listen_address(&self, worker_id: i64) -> Result<ServerAddress> {
        let address = self.config.listen_address()?;
        Ok(match address {
            #[cfg(unix)]
            ServerAddress::Unix { path } => {
                let mut name = path.into_os_string();
                name.push(format!(".{worker_id}"));
                ServerAddress::Unix { path: name.into() }
            }
            other => other,
        })
    }
}

#[async_trait]
impl DaemonStarter for WorkerDaemonStarter {
    type Client = WorkerClient;

    async fn start(
        &self,
        implementation: &str,
        working_dir: &Path,
        fork_options: &DaemonForkOptions,
    ) -> Result<Arc<WorkerClient>> {
        let options = self.config.default_fork_options.merge_with(fork_options);
        let worker_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let process = WorkerProcessBuilder::new(&self.config.worker_executable, implementation)
            .working_dir(working_dir)
            .fork_options(options.clone())
            .log_level(self.config.log_level)
            .native_services(self.config.native_services)
            .user_home(self.config.user_home().to_string_lossy())
            .listen(self.listen_address(worker_id)?)
            .worker_id(worker_id)
            .display_name(format!("Worker {worker_id} for {implementation}"))
            .publish_memory_info(self.config.publish_memory_info)
            .connect_timeout(Duration::from_millis(self.config.connect_timeout_ms))
            .start()
            .await?;
        let client = WorkerClient::attach(
            process,
            Arc::clone(&self.serializers),
            options,
            Duration::from_millis(self.config.stop_timeout_ms),
        )?;
        Ok(Arc::new(client))
    }
}

/// Routes work to per-implementation pools, starting workers on demand.
pub struct DaemonManager<S: DaemonStarter = WorkerDaemonStarter> {
    starter: Arc<S>,
    working_dir: PathBuf,
    pools: Mutex<HashMap<String, Arc<DaemonPool<S>>>>,
}

impl<S: DaemonStarter> DaemonManager<S> {
    pub fn new(starter: Arc<S>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            starter,
            working_dir: working_dir.into(),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn starter(&self) -> &Arc<S> {
        &self.starter
    }

    pub fn pool(&self, implementation: &str) -> Arc<DaemonPool<S>> {
        let mut pools = self.pools.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let pool = pools.entry(implementation.to_string()).or_insert_with(|| {
            Arc::new(DaemonPool::new(implementation, Arc::clone(&self.starter)))
        });
        Arc::clone(pool)
    }

    /// Runs `request` on a compatible worker. The worker goes back to the pool
    /// after a result or a failure raised by the invoked code; after an
    /// infrastructure or transport failure it is abandoned until [`Self::stop`].
    pub async fn execute(
        &self,
        implementation: &str,
        fork_options: &DaemonForkOptions,
        request: Request,
    ) -> Result<Value, WorkerError> {
        let pool = self.pool(implementation);
        let client = match pool.reserve_idle_client(fork_options) {
            Some(client) => client,
            None => pool
                .reserve_new_client(&self.working_dir, fork_options)
                .await
                .map_err(|err| WorkerError::Start(format!("{err:#}")))?,
        };

        let result = client.execute(request).await;
        match &result {
            Ok(_) => pool.release(client),
            Err(err) if err.is_user_failure() => pool.release(client),
            Err(err) => {
                warn!(implementation, error = %err, "abandoning worker after failure");
            }
        }
        result
    }

    /// Runs `request` on a fresh worker that is never pooled and exits once
    /// it has answered.
    pub async fn execute_single_use(
        &self,
        implementation: &str,
        fork_options: &DaemonForkOptions,
        request: Request,
    ) -> Result<Value, WorkerError> {
        let client = self
            .starter
            .start(implementation, &self.working_dir, fork_options)
            .await
            .map_err(|err| WorkerError::Start(format!("{err:#}")))?;
        client.execute_then_stop(request).await
    }

    /// Stops every pool, reporting all failures together.
    pub async fn stop(&self) -> Result<()> {
        let pools: Vec<_> = {
            let mut pools = self.pools.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            pools.drain().collect()
        };
        if pools.is_empty() {
            return Ok(());
        }
        info!(pools = pools.len(), "stopping worker pools");
        let mut composite = CompositeStoppable::new();
        for (name, pool) in pools {
            composite.push(name, Arc::new(PoolStopper(pool)));
        }
        composite.stop().await
    }
}

struct PoolStopper<S: DaemonStarter>(Arc<DaemonPool<S>>);

#[async_trait]
impl<S: DaemonStarter + 'static> Stoppable for PoolStopper<S> {
    async fn stop(&self) -> Result<()> {
        self.0.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::FakeStarter;
    use std::sync::atomic::Ordering;
    use wpx_core::request::BuildOperationRef;

    fn request(method: &str) -> Request {
        Request::builder(method)
            .arg("payload")
            .build_operation(BuildOperationRef::new(1))
            .build()
            .unwrap()
    }

    fn manager() -> DaemonManager<FakeStarter> {
        DaemonManager::new(Arc::new(FakeStarter::default()), std::env::temp_dir())
    }

    #[tokio::test]
    async fn released_worker_serves_next_request() {
        let manager = manager();
        let opts = DaemonForkOptions::new();
        let first = manager.execute("echo", &opts, request("run")).await.unwrap();
        assert_eq!(first, Value::Str("payload".into()));
        manager.execute("echo", &opts, request("run")).await.unwrap();
        assert_eq!(manager.starter().started.load(Ordering::SeqCst), 1);
        assert_eq!(manager.pool("echo").idle_count(), 1);
    }

    #[tokio::test]
    async fn user_failure_keeps_worker_and_infrastructure_failure_abandons_it() {
        let manager = manager();
        let opts = DaemonForkOptions::new();

        let err = manager.execute("echo", &opts, request("fail")).await.unwrap_err();
        assert!(err.is_user_failure());
        assert_eq!(manager.pool("echo").idle_count(), 1);

        let err = manager.execute("echo", &opts, request("crash")).await.unwrap_err();
        assert!(!err.is_user_failure());
        assert_eq!(manager.pool("echo").idle_count(), 0);
        assert_eq!(manager.pool("echo").all_clients().len(), 1);

        manager.execute("echo", &opts, request("run")).await.unwrap();
        assert_eq!(manager.starter().started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn single_use_worker_bypasses_the_pool() {
        let manager = manager();
        let opts = DaemonForkOptions::new();
        let value = manager
            .execute_single_use("echo", &opts, request("run"))
            .await
            .unwrap();
        assert_eq!(value, Value::Str("payload".into()));
        assert_eq!(manager.starter().started.load(Ordering::SeqCst), 1);
        assert!(manager.pool("echo").all_clients().is_empty());

        manager.execute("echo", &opts, request("run")).await.unwrap();
        assert_eq!(manager.starter().started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn implementations_get_separate_pools() {
        let manager = manager();
        let opts = DaemonForkOptions::new();
        manager.execute("echo", &opts, request("run")).await.unwrap();
        manager.execute("compiler", &opts, request("run")).await.unwrap();
        assert_eq!(manager.starter().started.load(Ordering::SeqCst), 2);

        let clients: Vec<_> = manager
            .pool("echo")
            .all_clients()
            .into_iter()
            .chain(manager.pool("compiler").all_clients())
            .collect();
        manager.stop().await.unwrap();
        assert!(clients.iter().all(|c| c.stopped.load(Ordering::SeqCst)));
    }
}
