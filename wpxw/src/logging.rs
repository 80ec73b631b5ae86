use anyhow::Result;
use async_trait::async_trait;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;
use wpx_core::connection::Outgoing;
use wpx_core::protocol::{LogEvent, LogLevel, LoggingProtocol};
use wpx_core::request::BuildOperationRef;
use wpx_core::stoppable::Stoppable;

/// Events emitted before the connection exists are kept, up to this many.
pub const MAX_BUFFERED_EVENTS: usize = 1024;

/// Connection plumbing logs about itself; forwarding those would feed back
/// into the connection being logged about.
const SUPPRESSED_TARGETS: &[&str] = &["wpx_core::connection", "wpx_core::frame"];

enum ForwarderState {
    Buffering(Vec<LogEvent>),
    Attached(Outgoing<LoggingProtocol>),
    Detached,
    Closed,
}

pub struct LogForwarder {
    state: Mutex<ForwarderState>,
}

impl Default for LogForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl LogForwarder {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ForwarderState::Buffering(Vec::new())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ForwarderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flushes buffered events to `outgoing` and forwards from now on.
    pub fn attach(&self, outgoing: Outgoing<LoggingProtocol>) {
        let mut state = self.state();
        if matches!(*state, ForwarderState::Closed) {
            return;
        }
        if let ForwarderState::Buffering(buffered) = &mut *state {
            for event in buffered.drain(..) {
                let _ = outgoing.send(&event);
            }
        }
        *state = ForwarderState::Attached(outgoing);
    }

    /// Stops forwarding. Later events only reach the local subscriber.
    pub fn detach(&self) {
        let mut state = self.state();
        if !matches!(*state, ForwarderState::Closed) {
            *state = ForwarderState::Detached;
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state(), ForwarderState::Closed)
    }

    pub fn forward(&self, event: LogEvent) {
        match &mut *self.state() {
            ForwarderState::Buffering(buffered) => {
                if buffered.len() < MAX_BUFFERED_EVENTS {
                    buffered.push(event);
                }
            }
            ForwarderState::Attached(outgoing) => {
                let _ = outgoing.send(&event);
            }
            ForwarderState::Detached | ForwarderState::Closed => {}
        }
    }

    pub fn buffered(&self) -> usize {
        match &*self.state() {
            ForwarderState::Buffering(buffered) => buffered.len(),
            _ => 0,
        }
    }
}

/// Last step of worker teardown: nothing is forwarded afterwards and the
/// local stderr output is flushed.
#[async_trait]
impl Stoppable for LogForwarder {
    async fn stop(&self) -> Result<()> {
        *self.state() = ForwarderState::Closed;
        std::io::stderr().flush()?;
        Ok(())
    }
}

#[derive(Default)]
struct ForwardedFields {
    message: Option<String>,
    op: Option<u64>,
    extra: Vec<String>,
}

impl Visit for ForwardedFields {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "op" {
            self.op = Some(value);
        } else {
            self.extra.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "op" && value >= 0 {
            self.op = Some(value as u64);
        } else {
            self.extra.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.extra.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.extra.push(format!("{}={:?}", field.name(), value));
        }
    }
}

/// `tracing` layer feeding a [`LogForwarder`]. An `op` field attributes the
/// event to that build operation.
pub struct ForwardingLayer {
    forwarder: Arc<LogForwarder>,
}

impl ForwardingLayer {
    pub fn new(forwarder: Arc<LogForwarder>) -> Self {
        Self { forwarder }
    }
}

impl<S: Subscriber> Layer<S> for ForwardingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if SUPPRESSED_TARGETS
            .iter()
            .any(|target| metadata.target().starts_with(target))
        {
            return;
        }
        let mut fields = ForwardedFields::default();
        event.record(&mut fields);
        let mut message = fields.message.unwrap_or_default();
        if !fields.extra.is_empty() {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(&fields.extra.join(" "));
        }
        self.forwarder.forward(LogEvent {
            level: LogLevel::from(metadata.level()),
            target: metadata.target().to_string(),
            message,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            build_operation: fields.op.map(BuildOperationRef::new),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn events_are_buffered_with_operation_and_fields() {
        let forwarder = Arc::new(LogForwarder::new());
        let subscriber =
            tracing_subscriber::registry().with(ForwardingLayer::new(Arc::clone(&forwarder)));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(op = 9u64, file = "a.rs", "compiled");
            tracing::debug!(target: "wpx_core::connection", "suppressed");
        });
        assert_eq!(forwarder.buffered(), 1);

        let state = forwarder.state();
        let ForwarderState::Buffering(events) = &*state else {
            panic!("expected buffering state");
        };
        assert_eq!(events[0].level, LogLevel::Info);
        assert_eq!(events[0].message, "compiled file=a.rs");
        assert_eq!(events[0].build_operation, Some(BuildOperationRef::new(9)));
    }

    #[test]
    fn detached_forwarder_drops_events() {
        let forwarder = LogForwarder::new();
        forwarder.detach();
        forwarder.forward(LogEvent {
            level: LogLevel::Warn,
            target: "test".into(),
            message: "late".into(),
            timestamp_ms: 0,
            build_operation: None,
        });
        assert_eq!(forwarder.buffered(), 0);
    }

    #[tokio::test]
    async fn stopped_forwarder_stays_closed() {
        let forwarder = LogForwarder::new();
        forwarder.detach();
        forwarder.stop().await.unwrap();
        assert!(forwarder.is_closed());
        forwarder.detach();
        assert!(forwarder.is_closed());
    }
}
