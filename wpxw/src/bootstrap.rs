use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::Notify;
use tracing::{info, warn};
use wpx_core::bootstrap::{read_header, WorkerConfig, NATIVE_SERVICES_ENV};
use wpx_core::connection::{ConnectionError, ObjectConnection};
use wpx_core::loader::{ClassLoader, DirectoryTypeSource};
use wpx_core::payload::{PayloadClassLoaderRegistry, PayloadSerializer, RegistryOptions};
use wpx_core::protocol::{
    standard_serializers, LoggingProtocol, MemoryStatus, MemoryStatusProtocol, ProblemsProtocol,
    RequestProtocol, ResponseProtocol,
};
use wpx_core::request::ArgumentSerializerRegistry;
use wpx_core::stoppable::{CompositeStoppable, Stoppable};

use crate::action::WorkerAction;
use crate::implementation::{ImplementationRegistry, LoaderScope};
use crate::logging::LogForwarder;
use crate::services::{ServiceRegistry, MEMORY_STATUS_INTERVAL};

/// What the command line adds to the header.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub classpath: Vec<String>,
    pub shared_packages: Vec<String>,
    pub process_args: Vec<String>,
}

/// Stage 1: decode the header written by the coordinator.
pub async fn read_config<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WorkerConfig> {
    read_header(reader).await
}

pub async fn read_config_file(path: &Path) -> Result<WorkerConfig> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening worker config {}", path.display()))?;
    read_header(&mut file)
        .await
        .with_context(|| format!("reading worker config {}", path.display()))
}

/// Stage 2: connect back, serve requests until told to stop, then tear down.
pub async fn run_worker(
    config: WorkerConfig,
    options: WorkerOptions,
    implementations: ImplementationRegistry,
    forwarder: Arc<LogForwarder>,
) -> Result<()> {
    let action = config.action_spec()?;
    let native_services = config
        .native_services
        .resolve(std::env::var(NATIVE_SERVICES_ENV).ok().as_deref());
    let services = Arc::new(ServiceRegistry::new(native_services, &config.user_home));

    let stream = services.connect(&config.server_address).await?;
    let connection = Arc::new(ObjectConnection::new(stream, config.display_name.clone()));

    // Workers always append to a cached client-owned loader; the coordinator
    // decides whether a grown classpath keeps its identity.
    let source = Arc::new(DirectoryTypeSource);
    let system = ClassLoader::system(options.classpath.clone(), source.clone());
    let registry = Arc::new(PayloadClassLoaderRegistry::new(
        Arc::clone(&system),
        source,
        RegistryOptions {
            reuse_client_owned_loaders: true,
        },
    ));
    connection.use_parameter_serializers(Arc::new(standard_serializers(
        PayloadSerializer::new(registry),
        ArgumentSerializerRegistry::with_scalars(),
    )));

    let responses = connection.add_outgoing::<ResponseProtocol>()?;
    let logs = connection.add_outgoing::<LoggingProtocol>()?;
    let problems = connection.add_outgoing::<ProblemsProtocol>()?;
    let stop = Arc::new(Notify::new());
    let handler = WorkerAction::new(
        action.implementation.clone(),
        implementations,
        LoaderScope::new(Arc::clone(&system)),
        &system,
        responses,
        Some(problems),
        Arc::clone(&stop),
    )?;
    connection.add_incoming::<RequestProtocol>(Arc::new(handler))?;
    {
        let stop = Arc::clone(&stop);
        connection.add_unrecoverable_error_handler(Arc::new(move |_: &ConnectionError| stop.notify_one()));
    }
    let memory = if config.publish_memory_info {
        Some(connection.add_outgoing::<MemoryStatusProtocol>()?)
    } else {
        None
    };
    connection.connect()?;
    forwarder.attach(logs);

    if let Some(memory) = memory {
        services.memory().listeners().add(Arc::new(move |status: &MemoryStatus| {
            let _ = memory.send(status);
        }));
        services.memory().start(MEMORY_STATUS_INTERVAL);
    }

    info!(
        worker_id = config.worker_id,
        implementation = %action.implementation,
        native_services = native_services.is_enabled(),
        classpath = ?options.classpath,
        shared_packages = ?options.shared_packages,
        process_args = ?options.process_args,
        "worker ready"
    );

    stop.notified().await;
    info!("worker stopping");

    forwarder.detach();
    let teardown = CompositeStoppable::new()
        .add("connection", connection)
        .add("services", services);
    let result = teardown.stop().await;
    if let Err(err) = forwarder.stop().await {
        warn!(error = %err, "could not flush worker log output");
    }
    if let Err(err) = result {
        let log = write_last_resort_log(&std::env::current_dir()?, config.worker_id, &err);
        return Err(match log {
            Ok(path) => err.context(format!("details written to {}", path.display())),
            Err(log_err) => err.context(format!("could not write failure log: {log_err:#}")),
        });
    }
    Ok(())
}

/// Writes `err` to `<dir>/wpx-worker-<id>-<timestamp>.log` when nothing else
/// can carry it.
pub fn write_last_resort_log(dir: &Path, worker_id: i64, err: &anyhow::Error) -> Result<PathBuf> {
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("wpx-worker-{worker_id}-{timestamp}.log"));
    let body = format!("{}\n{err:?}\n", chrono::Local::now().to_rfc3339());
    std::fs::write(&path, body).map_err(|e| anyhow!("writing {}: {}", path.display(), e))?;
    warn!(path = %path.display(), "worker failure written to log file");
    Ok(path)
}
