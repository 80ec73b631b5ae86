use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info};
use wpx_core::address::{connect, IpcStream, ServerAddress};
use wpx_core::bootstrap::NativeServicesMode;
use wpx_core::protocol::MemoryStatus;
use wpx_core::stoppable::Stoppable;

pub const MEMORY_STATUS_INTERVAL: Duration = Duration::from_secs(5);
pub const OS_MEMORY_ENV: &str = "WPX_OS_MEMORY";
pub const MAX_HEAP_ENV: &str = "WPX_MAX_HEAP_MB";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Free memory as reported by the OS (`MemAvailable`).
#[derive(Debug, Default, Clone, Copy)]
pub struct OsMemoryProber;

impl OsMemoryProber {
    pub fn free_bytes(&self) -> Option<u64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_kb_field(&meminfo, "MemAvailable:")
    }
}

/// This process's resident set size (`VmRSS`).
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemoryProber;

impl ProcessMemoryProber {
    pub fn rss_bytes(&self) -> u64 {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_kb_field(&status, "VmRSS:"))
            .unwrap_or(0)
    }
}

fn parse_kb_field(content: &str, key: &str) -> Option<u64> {
    let line = content.lines().find(|line| line.starts_with(key))?;
    let kb: u64 = line[key.len()..]
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb * 1024)
}

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Fan-out of events to registered listeners.
pub struct ListenerManager<E> {
    listeners: Mutex<Vec<Listener<E>>>,
}

impl<E> Default for ListenerManager<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E> ListenerManager<E> {
    pub fn add(&self, listener: Listener<E>) {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn broadcast(&self, event: &E) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners {
            listener(event);
        }
    }
}

/// Samples memory every [`MEMORY_STATUS_INTERVAL`] once started.
pub struct MemoryManager {
    os: Option<OsMemoryProber>,
    process: ProcessMemoryProber,
    max_heap_bytes: Option<u64>,
    listeners: Arc<ListenerManager<MemoryStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryManager {
    pub fn new(os: Option<OsMemoryProber>, max_heap_bytes: Option<u64>) -> Self {
        Self {
            os,
            process: ProcessMemoryProber,
            max_heap_bytes,
            listeners: Arc::new(ListenerManager::default()),
            task: Mutex::new(None),
        }
    }

    pub fn listeners(&self) -> &Arc<ListenerManager<MemoryStatus>> {
        &self.listeners
    }

    pub fn sample(&self) -> MemoryStatus {
        MemoryStatus {
            rss_bytes: self.process.rss_bytes(),
            max_heap_bytes: self.max_heap_bytes,
            os_free_bytes: self.os.and_then(|os| os.free_bytes()),
        }
    }

    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let status = manager.sample();
                manager.listeners.broadcast(&status);
            }
        }));
        debug!(interval_ms = interval.as_millis() as u64, "memory status publishing started");
    }
}

#[async_trait]
impl Stoppable for MemoryManager {
    async fn stop(&self) -> Result<()> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }
}

pub struct ServiceRegistry {
    native_services: NativeServicesMode,
    user_home: PathBuf,
    connect_timeout: Duration,
    memory: Arc<MemoryManager>,
}

impl ServiceRegistry {
    /// `native_services` must already be resolved. The OS prober is only
    /// used with native services enabled or `WPX_OS_MEMORY=1`.
    pub fn new(native_services: NativeServicesMode, user_home: impl Into<PathBuf>) -> Self {
        let os_enabled = native_services.is_enabled()
            || std::env::var(OS_MEMORY_ENV).is_ok_and(|v| v.trim() == "1");
        let max_heap_bytes = std::env::var(MAX_HEAP_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|mb| mb * 1024 * 1024);
        Self {
            native_services,
            user_home: user_home.into(),
            connect_timeout: CONNECT_TIMEOUT,
            memory: Arc::new(MemoryManager::new(os_enabled.then_some(OsMemoryProber), max_heap_bytes)),
        }
    }

    pub fn native_services(&self) -> NativeServicesMode {
        self.native_services
    }

    pub fn user_home(&self) -> &PathBuf {
        &self.user_home
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub async fn connect(&self, address: &ServerAddress) -> Result<IpcStream> {
        let stream = connect(address, self.connect_timeout)
            .await
            .with_context(|| format!("connecting to coordinator at {address}"))?;
        info!(address = %address, "connected to coordinator");
        Ok(stream)
    }
}

#[async_trait]
impl Stoppable for ServiceRegistry {
    async fn stop(&self) -> Result<()> {
        self.memory.stop().await
    }
}
