use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use wpx_core::address::{IpcListener, ServerAddress};
use wpx_core::bootstrap::{write_header, NativeServicesMode, WorkerActionSpec, WorkerConfig};
use wpx_core::connection::ObjectConnection;
use wpx_core::fork_options::DaemonForkOptions;
use wpx_core::protocol::LogLevel;

pub const MIN_HEAP_ENV: &str = "WPX_MIN_HEAP_MB";
pub const MAX_HEAP_ENV: &str = "WPX_MAX_HEAP_MB";

const KILL_WAIT: Duration = Duration::from_secs(5);

pub struct WorkerProcessBuilder {
    executable: PathBuf,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    fork_options: DaemonForkOptions,
    log_level: LogLevel,
    native_services: NativeServicesMode,
    user_home: String,
    listen: ServerAddress,
    worker_id: i64,
    display_name: String,
    implementation: String,
    publish_memory_info: bool,
    connect_timeout: Duration,
}

impl WorkerProcessBuilder {
    pub fn new(executable: impl Into<PathBuf>, implementation: impl Into<String>) -> Self {
        let implementation = implementation.into();
        Self {
            executable: executable.into(),
            working_dir: None,
            env: Vec::new(),
            fork_options: DaemonForkOptions::default(),
            log_level: LogLevel::Info,
            native_services: NativeServicesMode::NotSet,
            user_home: String::new(),
            listen: ServerAddress::Tcp {
                host: "127.0.0.1".into(),
                port: 0,
            },
            worker_id: 0,
            display_name: format!("Worker for {implementation}"),
            implementation,
            publish_memory_info: false,
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn fork_options(mut self, options: DaemonForkOptions) -> Self {
        self.fork_options = options;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn native_services(mut self, mode: NativeServicesMode) -> Self {
        self.native_services = mode;
        self
    }

    pub fn user_home(mut self, home: impl Into<String>) -> Self {
        self.user_home = home.into();
        self
    }

    pub fn listen(mut self, address: ServerAddress) -> Self {
        self.listen = address;
        self
    }

    pub fn worker_id(mut self, id: i64) -> Self {
        self.worker_id = id;
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn publish_memory_info(mut self, publish: bool) -> Self {
        self.publish_memory_info = publish;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        for entry in &self.fork_options.classpath {
            cmd.arg("--classpath").arg(entry);
        }
        for package in &self.fork_options.shared_packages {
            cmd.arg("--shared-package").arg(package);
        }
        if !self.fork_options.process_args.is_empty() {
            cmd.arg("--").args(&self.fork_options.process_args);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(mb) = self.fork_options.min_heap_mb() {
            cmd.env(MIN_HEAP_ENV, mb.to_string());
        }
        if let Some(mb) = self.fork_options.max_heap_mb() {
            cmd.env(MAX_HEAP_ENV, mb.to_string());
        }
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Spawns the worker, hands it the bootstrap header over stdin and waits
    /// for it to connect back. The returned connection is not yet connected.
    pub async fn start(self) -> Result<WorkerProcess> {
        let listener = IpcListener::bind(&self.listen)
            .await
            .with_context(|| format!("binding worker listener on {}", self.listen))?;
        let server_address = listener.local_address()?;

        let header = WorkerConfig {
            log_level: self.log_level,
            native_services: self.native_services,
            user_home: self.user_home.clone(),
            server_address: server_address.clone(),
            worker_id: self.worker_id,
            display_name: self.display_name.clone(),
            worker_action: WorkerConfig::encode_action(&WorkerActionSpec {
                implementation: self.implementation.clone(),
            })?,
            publish_memory_info: self.publish_memory_info,
        };

        let mut child = self
            .command()
            .spawn()
            .with_context(|| format!("failed to spawn worker {}", self.executable.display()))?;
        info!(
            worker = %self.display_name,
            pid = child.id(),
            address = %server_address,
            "started worker process"
        );

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump_output(stdout, self.display_name.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump_output(stderr, self.display_name.clone(), "stderr"));
        }

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("worker stdin unavailable"))?;
        if let Err(e) = write_header(&mut stdin, &header).await {
            kill(&mut child).await;
            return Err(e.context("writing worker bootstrap header"));
        }
        drop(stdin);

        enum Outcome {
            Connected(Result<wpx_core::address::IpcStream>),
            TimedOut,
            Exited(std::io::Result<ExitStatus>),
        }
        let outcome = tokio::select! {
            res = timeout(self.connect_timeout, listener.accept()) => match res {
                Ok(stream) => Outcome::Connected(stream),
                Err(_) => Outcome::TimedOut,
            },
            status = child.wait() => Outcome::Exited(status),
        };
        let stream = match outcome {
            Outcome::Connected(Ok(stream)) => stream,
            Outcome::Connected(Err(e)) => {
                kill(&mut child).await;
                return Err(e.context("accepting worker connection"));
            }
            Outcome::TimedOut => {
                kill(&mut child).await;
                return Err(anyhow!(
                    "timed out after {:?} waiting for {} to connect",
                    self.connect_timeout,
                    self.display_name
                ));
            }
            Outcome::Exited(status) => {
                return Err(anyhow!(
                    "{} exited before connecting: {}",
                    self.display_name,
                    status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string())
                ));
            }
        };
        debug!(worker = %self.display_name, "worker connected");

        let connection = ObjectConnection::new(stream, self.display_name.clone());
        Ok(WorkerProcess {
            child,
            display_name: self.display_name,
            connection: Arc::new(connection),
            pumps,
        })
    }
}

fn pump_output<R>(reader: R, worker: String, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(target: "wpx::worker", worker = %worker, stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!(worker = %worker, stream, error = %e, "worker output closed");
                    break;
                }
            }
        }
    })
}

async fn kill(child: &mut Child) {
    let _ = child.start_kill();
    let _ = timeout(KILL_WAIT, child.wait()).await;
}

pub struct WorkerProcess {
    child: Child,
    display_name: String,
    connection: Arc<ObjectConnection>,
    pumps: Vec<JoinHandle<()>>,
}

impl WorkerProcess {
    pub fn connection(&self) -> &Arc<ObjectConnection> {
        &self.connection
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the worker to exit on its own, killing it after `grace`.
    pub async fn wait_for_stop(&mut self, grace: Duration) -> Result<ExitStatus> {
        let status = match timeout(grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(worker = %self.display_name, "worker did not exit in time; killing");
                self.child.start_kill()?;
                self.child.wait().await?
            }
        };
        for pump in self.pumps.drain(..) {
            let _ = timeout(KILL_WAIT, pump).await;
        }
        if !status.success() {
            warn!(worker = %self.display_name, exit_code = status.code(), "worker exited with error");
        } else {
            debug!(worker = %self.display_name, "worker exited");
        }
        Ok(status)
    }

    /// The exit status, if the worker has already exited.
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    pub async fn kill(&mut self) {
        kill(&mut self.child).await;
    }
}
