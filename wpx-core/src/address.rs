use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{timeout, Duration};

/// Where a worker connects back to its coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ServerAddress {
    Tcp {
        host: String,
        port: u16,
    },
    #[cfg(unix)]
    Unix {
        path: PathBuf,
    },
}

impl ServerAddress {
    /// Accepts `unix://path`, `tcp://host:port` or a bare `host:port`.
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(path) = raw.strip_prefix("unix://") {
            #[cfg(unix)]
            {
                return Ok(ServerAddress::Unix {
                    path: PathBuf::from(path),
                });
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(anyhow!("unix worker addresses are not supported"));
            }
        }
        let raw_tcp = raw.strip_prefix("tcp://").unwrap_or(raw);
        let Some((host, port)) = raw_tcp.rsplit_once(':') else {
            return Err(anyhow!(
                "invalid worker address (expected tcp://host:port or unix://path): {}",
                raw
            ));
        };
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow!("invalid port in worker address: {}", raw))?;
        Ok(ServerAddress::Tcp {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddress::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{}]:{}", host, port)
            }
            ServerAddress::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            #[cfg(unix)]
            ServerAddress::Unix { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        ServerAddress::parse(&value)
    }
}

impl From<ServerAddress> for String {
    fn from(value: ServerAddress) -> Self {
        value.to_string()
    }
}

pub enum IpcStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl tokio::io::AsyncRead for IpcStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            Self::Tcp(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for IpcStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::result::Result<usize, std::io::Error>> {
        match &mut *self {
            Self::Tcp(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), std::io::Error>> {
        match &mut *self {
            Self::Tcp(s) => std::pin::Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), std::io::Error>> {
        match &mut *self {
            Self::Tcp(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

pub async fn connect(address: &ServerAddress, timeout_dur: Duration) -> Result<IpcStream> {
    match address {
        ServerAddress::Tcp { host, port } => {
            let addr = (host.as_str(), *port);
            let stream = timeout(timeout_dur, TcpStream::connect(addr))
                .await
                .map_err(|_| anyhow!("worker connect timeout: {}", address))??;
            let _ = stream.set_nodelay(true);
            Ok(IpcStream::Tcp(stream))
        }
        #[cfg(unix)]
        ServerAddress::Unix { path } => {
            let stream = timeout(timeout_dur, UnixStream::connect(path))
                .await
                .map_err(|_| anyhow!("worker unix connect timeout: {}", path.display()))??;
            Ok(IpcStream::Unix(stream))
        }
    }
}

/// The coordinator's side of [`connect`].
pub enum IpcListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl IpcListener {
    /// Binds `address`; a TCP port of 0 picks an ephemeral port.
    pub async fn bind(address: &ServerAddress) -> Result<Self> {
        match address {
            ServerAddress::Tcp { host, port } => {
                Ok(IpcListener::Tcp(TcpListener::bind((host.as_str(), *port)).await?))
            }
            #[cfg(unix)]
            ServerAddress::Unix { path } => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(IpcListener::Unix {
                    listener: UnixListener::bind(path)?,
                    path: path.clone(),
                })
            }
        }
    }

    /// The address a worker should be told to connect to.
    pub fn local_address(&self) -> Result<ServerAddress> {
        match self {
            IpcListener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(ServerAddress::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            #[cfg(unix)]
            IpcListener::Unix { path, .. } => Ok(ServerAddress::Unix { path: path.clone() }),
        }
    }

    pub async fn accept(&self) -> Result<IpcStream> {
        match self {
            IpcListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok(IpcStream::Tcp(stream))
            }
            #[cfg(unix)]
            IpcListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(IpcStream::Unix(stream))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for IpcListener {
    fn drop(&mut self) {
        if let IpcListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
