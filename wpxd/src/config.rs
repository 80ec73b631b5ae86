use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use wpx_core::address::ServerAddress;
use wpx_core::bootstrap::NativeServicesMode;
use wpx_core::fork_options::DaemonForkOptions;
use wpx_core::protocol::LogLevel;

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Worker executable, resolved through `PATH` when not absolute.
    #[serde(default = "default_worker_executable")]
    pub worker_executable: PathBuf,

    /// Working directory for new workers. Defaults to the coordinator's.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Log level handed to workers in their bootstrap header.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Address workers connect back to: "127.0.0.1:0" (ephemeral TCP) or "unix:///path".
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Allow a non-loopback TCP listen address.
    #[serde(default)]
    pub allow_insecure_tcp: bool,

    /// How long a new worker has to connect back (ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long a stopping worker has to exit before it is killed (ms).
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Ask workers to publish memory status.
    #[serde(default)]
    pub publish_memory_info: bool,

    #[serde(default = "default_native_services")]
    pub native_services: NativeServicesMode,

    /// Let a client-owned classloader grow its classpath across requests
    /// instead of being rebuilt.
    #[serde(default)]
    pub reuse_client_owned_loaders: bool,

    #[serde(default)]
    pub user_home: Option<PathBuf>,

    /// Classpath of the coordinator's own system loader.
    #[serde(default)]
    pub system_classpath: Vec<String>,

    /// Merged into every worker's requested fork options.
    #[serde(default)]
    pub default_fork_options: DaemonForkOptions,
}

fn default_worker_executable() -> PathBuf {
    PathBuf::from("wpxw")
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_listen() -> String {
    "127.0.0.1:0".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

fn default_native_services() -> NativeServicesMode {
    NativeServicesMode::NotSet
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_executable: default_worker_executable(),
            working_dir: None,
            log_level: default_log_level(),
            listen: default_listen(),
            allow_insecure_tcp: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            publish_memory_info: false,
            native_services: default_native_services(),
            reuse_client_owned_loaders: false,
            user_home: None,
            system_classpath: Vec::new(),
            default_fork_options: DaemonForkOptions::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_executable.as_os_str().is_empty() {
            return Err(anyhow!("worker_executable must not be empty"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(anyhow!("connect_timeout_ms must be >= 1"));
        }
        if self.stop_timeout_ms == 0 {
            return Err(anyhow!("stop_timeout_ms must be >= 1"));
        }
        let opts = &self.default_fork_options;
        if let (Some(min), Some(max)) = (opts.min_heap, opts.max_heap) {
            if min > max {
                return Err(anyhow!(
                    "default_fork_options.min_heap ({}) exceeds max_heap ({})",
                    min,
                    max
                ));
            }
        }

        match self.listen_address()? {
            ServerAddress::Tcp { host, .. } => {
                let ip: IpAddr = host
                    .parse()
                    .map_err(|e| anyhow!("invalid listen address '{}': {}", self.listen, e))?;
                if !ip.is_loopback() && !self.allow_insecure_tcp {
                    return Err(anyhow!(
                        "refusing to listen for workers on non-loopback address '{}' without allow_insecure_tcp=true",
                        self.listen
                    ));
                }
            }
            #[cfg(unix)]
            ServerAddress::Unix { .. } => {}
        }
        Ok(())
    }

    pub fn listen_address(&self) -> Result<ServerAddress> {
        ServerAddress::parse(&self.listen)
    }

    pub fn user_home(&self) -> PathBuf {
        self.user_home
            .clone()
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".wpx")))
            .unwrap_or_else(|| PathBuf::from(".wpx"))
    }

    pub fn working_dir(&self) -> Result<PathBuf> {
        match &self.working_dir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().context("resolving working directory"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<CoordinatorConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: CoordinatorConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg: CoordinatorConfig = serde_yaml::from_str("{}").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:0");
        assert_eq!(cfg.log_level, LogLevel::Info);
        assert!(!cfg.reuse_client_owned_loaders);
    }

    #[test]
    fn parses_fork_options_and_levels() {
        let cfg: CoordinatorConfig = serde_yaml::from_str(
            r#"
worker_executable: /opt/wpx/bin/wpxw
log_level: debug
native_services: disabled
reuse_client_owned_loaders: true
default_fork_options:
  max_heap: 512m
  process_args: ["--quiet"]
"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.log_level, LogLevel::Debug);
        assert_eq!(cfg.native_services, NativeServicesMode::Disabled);
        assert_eq!(cfg.default_fork_options.max_heap_mb(), Some(512));
    }

    #[test]
    fn rejects_unknown_fields_and_public_listen() {
        assert!(serde_yaml::from_str::<CoordinatorConfig>("workers: 3").is_err());

        let cfg: CoordinatorConfig = serde_yaml::from_str("listen: 0.0.0.0:4000").unwrap();
        assert!(cfg.validate().is_err());

        let cfg: CoordinatorConfig =
            serde_yaml::from_str("listen: 0.0.0.0:4000\nallow_insecure_tcp: true").unwrap();
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_heap_bounds() {
        let cfg: CoordinatorConfig = serde_yaml::from_str(
            "default_fork_options:\n  min_heap: 1g\n  max_heap: 256m\n",
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }
}
