use anyhow::{anyhow, bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::ServerAddress;
use crate::codec::{Decoder, Encoder};
use crate::protocol::LogLevel;

pub const MAGIC: &[u8; 4] = b"WPXB";
pub const NATIVE_SERVICES_ENV: &str = "WPX_NATIVE_SERVICES";

const MAX_HEADER_BYTES: usize = 1024 * 1024;
const NOT_SET: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeServicesMode {
    Enabled,
    Disabled,
    /// Decided by the worker from [`NATIVE_SERVICES_ENV`].
    NotSet,
}

impl NativeServicesMode {
    fn ordinal(self) -> u8 {
        match self {
            NativeServicesMode::Enabled => 0,
            NativeServicesMode::Disabled => 1,
            NativeServicesMode::NotSet => NOT_SET,
        }
    }

    fn from_ordinal(ordinal: u8) -> Result<Self> {
        match ordinal {
            0 => Ok(NativeServicesMode::Enabled),
            1 => Ok(NativeServicesMode::Disabled),
            NOT_SET => Ok(NativeServicesMode::NotSet),
            other => Err(anyhow!("invalid native services mode {}", other)),
        }
    }

    /// Replaces `NotSet` with the value of `env`; anything but `true`/`1` is disabled.
    pub fn resolve(self, env: Option<&str>) -> Self {
        match self {
            NativeServicesMode::NotSet => match env.map(str::trim) {
                Some(v) if v == "1" || v.eq_ignore_ascii_case("true") => NativeServicesMode::Enabled,
                _ => NativeServicesMode::Disabled,
            },
            other => other,
        }
    }

    pub fn is_enabled(self) -> bool {
        self == NativeServicesMode::Enabled
    }
}

/// Names the worker implementation a worker process serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerActionSpec {
    pub implementation: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub log_level: LogLevel,
    pub native_services: NativeServicesMode,
    pub user_home: String,
    pub server_address: ServerAddress,
    pub worker_id: i64,
    pub display_name: String,
    /// Serialized [`WorkerActionSpec`].
    pub worker_action: Bytes,
    pub publish_memory_info: bool,
}

impl WorkerConfig {
    pub fn action_spec(&self) -> Result<WorkerActionSpec> {
        serde_json::from_slice(&self.worker_action).context("invalid worker action")
    }

    pub fn encode_action(spec: &WorkerActionSpec) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(spec)?))
    }

    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        enc.write_u8(self.log_level.ordinal());
        enc.write_u8(self.native_services.ordinal());
        enc.write_str(&self.user_home);
        enc.write_str(&self.server_address.to_string());
        enc.write_i64(self.worker_id);
        enc.write_str(&self.display_name);
        enc.write_bytes(&self.worker_action);
        enc.write_bool(self.publish_memory_info);
        enc.finish()
    }

    pub fn decode(body: Bytes) -> Result<Self> {
        let mut dec = Decoder::new(body);
        let log_level = dec.read_u8()?;
        let log_level =
            LogLevel::from_ordinal(log_level).ok_or_else(|| anyhow!("invalid log level {}", log_level))?;
        let native_services = NativeServicesMode::from_ordinal(dec.read_u8()?)?;
        let user_home = dec.read_string()?;
        let server_address = ServerAddress::parse(&dec.read_string()?)?;
        let worker_id = dec.read_i64()?;
        let display_name = dec.read_string()?;
        let worker_action = dec.read_bytes()?;
        let publish_memory_info = dec.read_bool()?;
        dec.expect_end()?;
        Ok(Self {
            log_level,
            native_services,
            user_home,
            server_address,
            worker_id,
            display_name,
            worker_action,
            publish_memory_info,
        })
    }
}

pub async fn write_header<W: AsyncWrite + Unpin>(writer: &mut W, config: &WorkerConfig) -> Result<()> {
    let body = config.encode();
    let mut buf = BytesMut::with_capacity(8 + body.len());
    buf.put_slice(MAGIC);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WorkerConfig> {
    let mut header = [0u8; 8];
    reader
        .read_exact(&mut header)
        .await
        .context("reading worker bootstrap header")?;
    if &header[0..4] != MAGIC {
        bail!("invalid worker bootstrap magic");
    }
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_HEADER_BYTES {
        bail!("worker bootstrap header too large");
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    WorkerConfig::decode(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerConfig {
        WorkerConfig {
            log_level: LogLevel::Debug,
            native_services: NativeServicesMode::NotSet,
            user_home: "/home/build/.wpx".into(),
            server_address: ServerAddress::parse("tcp://127.0.0.1:4100").unwrap(),
            worker_id: 3,
            display_name: "Worker 3 for echo".into(),
            worker_action: WorkerConfig::encode_action(&WorkerActionSpec {
                implementation: "echo".into(),
            })
            .unwrap(),
            publish_memory_info: true,
        }
    }

    #[tokio::test]
    async fn header_survives_stdin_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_header(&mut a, &config()).await.unwrap();
        let decoded = read_header(&mut b).await.unwrap();
        assert_eq!(decoded, config());
        assert_eq!(decoded.action_spec().unwrap().implementation, "echo");
    }

    #[test]
    fn native_services_resolution() {
        assert!(NativeServicesMode::NotSet.resolve(Some("true")).is_enabled());
        assert!(!NativeServicesMode::NotSet.resolve(None).is_enabled());
        assert!(NativeServicesMode::Enabled.resolve(Some("0")).is_enabled());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut body = config().encode().to_vec();
        body.push(0);
        assert!(WorkerConfig::decode(Bytes::from(body)).is_err());
    }
}
