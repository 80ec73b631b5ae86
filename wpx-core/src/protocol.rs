use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::connection::{JsonCodec, Protocol, SerializerRegistry};
use crate::payload::PayloadSerializer;
use crate::request::{ArgumentSerializerRegistry, BuildOperationRef, Request, RequestSerializer, ResponseSerializer};
use crate::value::{RemoteError, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum RequestMessage {
    Run(Request),
    /// Run one request, respond, then stop the worker.
    RunThenStop(Request),
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMessage {
    Completed(Value),
    /// The invoked code failed.
    Failed(RemoteError),
    /// The worker could not run the code at all.
    InfrastructureFailed(RemoteError),
}

pub struct RequestProtocol;

impl Protocol for RequestProtocol {
    const NAME: &'static str = "request";
    type Message = RequestMessage;
}

pub struct ResponseProtocol;

impl Protocol for ResponseProtocol {
    const NAME: &'static str = "response";
    type Message = ResponseMessage;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn ordinal(self) -> u8 {
        match self {
            LogLevel::Trace => 0,
            LogLevel::Debug => 1,
            LogLevel::Info => 2,
            LogLevel::Warn => 3,
            LogLevel::Error => 4,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Some(match ordinal {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub build_operation: Option<BuildOperationRef>,
}

pub struct LoggingProtocol;

impl Protocol for LoggingProtocol {
    const NAME: &'static str = "logging";
    type Message = LogEvent;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Advice,
    Warning,
    Error,
}

/// A diagnostic reported by the invoked code, e.g. a compiler error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemEvent {
    pub severity: Severity,
    pub label: String,
    #[serde(default)]
    pub details: Option<String>,
    pub build_operation: BuildOperationRef,
}

pub struct ProblemsProtocol;

impl Protocol for ProblemsProtocol {
    const NAME: &'static str = "problems";
    type Message = ProblemEvent;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStatus {
    pub rss_bytes: u64,
    #[serde(default)]
    pub max_heap_bytes: Option<u64>,
    #[serde(default)]
    pub os_free_bytes: Option<u64>,
}

pub struct MemoryStatusProtocol;

impl Protocol for MemoryStatusProtocol {
    const NAME: &'static str = "memory-status";
    type Message = MemoryStatus;
}

/// Codecs for every protocol above, sharing one payload serializer.
pub fn standard_serializers(
    payload: PayloadSerializer,
    arguments: ArgumentSerializerRegistry,
) -> SerializerRegistry {
    let mut registry = SerializerRegistry::new();
    registry
        .register::<RequestProtocol>(Arc::new(RequestSerializer::new(arguments, payload.clone())))
        .register::<ResponseProtocol>(Arc::new(ResponseSerializer::new(payload)))
        .register::<LoggingProtocol>(Arc::new(JsonCodec))
        .register::<ProblemsProtocol>(Arc::new(JsonCodec))
        .register::<MemoryStatusProtocol>(Arc::new(JsonCodec));
    registry
}
