use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

use crate::connection::{CodecError, ConnectionError, IncomingHandler};
use crate::error::WorkerError;
use crate::protocol::ResponseMessage;
use crate::value::Value;

pub const RECEIVER_CAPACITY: usize = 10;

#[derive(Debug)]
enum Item {
    Value(Value),
    /// The call completed and returned nothing.
    Null,
    Failure(WorkerError),
    EndOfStream,
}

/// Bounded queue of results for one client. Every terminal outcome, stream
/// failure and transport failure flows through it to the waiting caller.
pub struct Receiver {
    tx: mpsc::Sender<Item>,
    rx: AsyncMutex<mpsc::Receiver<Item>>,
    pending: Mutex<Option<Item>>,
    interrupt: Arc<Notify>,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(RECEIVER_CAPACITY);
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            pending: Mutex::new(None),
            interrupt: Arc::new(Notify::new()),
        }
    }

    /// Handler to register for the response protocol.
    pub fn handler(&self) -> Arc<ResponseHandler> {
        Arc::new(ResponseHandler {
            tx: self.tx.clone(),
        })
    }

    /// Callback for the connection's unrecoverable error handlers.
    pub fn failure_sink(&self) -> impl Fn(&ConnectionError) + Send + Sync + 'static {
        let tx = self.tx.clone();
        move |err: &ConnectionError| {
            let failure = Item::Failure(WorkerError::Connection(err.to_string()));
            if tx.try_send(failure).is_err() {
                warn!(error = %err, "result queue full; dropping transport failure");
            }
        }
    }

    /// Wakes the current (or next) waiter with [`WorkerError::Interrupted`].
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            notify: Arc::clone(&self.interrupt),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Option<Item>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits until an item is available without consuming it.
    pub async fn await_next_result(&self) -> Result<(), WorkerError> {
        if self.pending().is_some() {
            return Ok(());
        }
        let mut rx = self.rx.lock().await;
        if self.pending().is_some() {
            return Ok(());
        }
        let item = tokio::select! {
            item = rx.recv() => item.unwrap_or(Item::EndOfStream),
            _ = self.interrupt.notified() => return Err(WorkerError::Interrupted),
        };
        *self.pending() = Some(item);
        Ok(())
    }

    /// Consumes one item: the value, `Value::Null` for an empty completion,
    /// or the failure. End of stream with nothing queued is
    /// [`WorkerError::NoResponse`], and stays so for later calls.
    pub async fn get_next_result(&self) -> Result<Value, WorkerError> {
        self.await_next_result().await?;
        let item = {
            let mut pending = self.pending();
            match pending.take() {
                Some(Item::EndOfStream) => {
                    *pending = Some(Item::EndOfStream);
                    return Err(WorkerError::NoResponse);
                }
                Some(item) => item,
                None => return Err(WorkerError::NoResponse),
            }
        };
        match item {
            Item::Value(value) => Ok(value),
            Item::Null => Ok(Value::Null),
            Item::Failure(err) => Err(err),
            Item::EndOfStream => Err(WorkerError::NoResponse),
        }
    }
}

#[derive(Clone)]
pub struct Interrupter {
    notify: Arc<Notify>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.notify.notify_one();
    }
}

pub struct ResponseHandler {
    tx: mpsc::Sender<Item>,
}

impl ResponseHandler {
    async fn push(&self, item: Item) {
        if self.tx.send(item).await.is_err() {
            debug!("receiver dropped; discarding result");
        }
    }
}

#[async_trait]
impl IncomingHandler<ResponseMessage> for ResponseHandler {
    async fn handle(&self, message: ResponseMessage) {
        let item = match message {
            ResponseMessage::Completed(Value::Null) => Item::Null,
            ResponseMessage::Completed(value) => Item::Value(value),
            ResponseMessage::Failed(err) => Item::Failure(WorkerError::Remote(err)),
            ResponseMessage::InfrastructureFailed(err) => Item::Failure(WorkerError::Remote(err)),
        };
        self.push(item).await;
    }

    fn handle_stream_failure(&self, failure: ConnectionError) -> Result<(), ConnectionError> {
        let err = match failure {
            ConnectionError::Codec {
                source: CodecError::Payload(err),
                ..
            } => WorkerError::Payload(err),
            other => WorkerError::Connection(other.to_string()),
        };
        if let Err(mpsc::error::TrySendError::Full(item)) = self.tx.try_send(Item::Failure(err)) {
            warn!(?item, "result queue full; dropping undecodable response");
        }
        Ok(())
    }

    async fn end_of_stream(&self) {
        self.push(Item::EndOfStream).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PayloadError;
    use std::time::Duration;

    #[tokio::test]
    async fn value_is_delivered_once() {
        let receiver = Receiver::new();
        let handler = receiver.handler();
        handler.handle(ResponseMessage::Completed(Value::Int(42))).await;

        assert_eq!(receiver.get_next_result().await.unwrap(), Value::Int(42));
        let second = tokio::time::timeout(Duration::from_millis(50), receiver.get_next_result()).await;
        assert!(second.is_err(), "second call must block");
    }

    #[tokio::test]
    async fn null_sentinel_is_distinct_from_nothing() {
        let receiver = Receiver::new();
        receiver
            .handler()
            .handle(ResponseMessage::Completed(Value::Null))
            .await;
        assert_eq!(receiver.get_next_result().await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn end_of_stream_without_response_is_an_error() {
        let receiver = Receiver::new();
        receiver.handler().end_of_stream().await;
        let err = receiver.get_next_result().await.unwrap_err();
        assert!(matches!(err, WorkerError::NoResponse));
        assert_eq!(err.to_string(), "No response received from worker");
        assert!(matches!(
            receiver.get_next_result().await,
            Err(WorkerError::NoResponse)
        ));
    }

    #[tokio::test]
    async fn interrupt_wakes_waiter() {
        let receiver = Arc::new(Receiver::new());
        let interrupter = receiver.interrupter();
        let waiting = {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move { receiver.get_next_result().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        interrupter.interrupt();
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(WorkerError::Interrupted)));
    }

    #[tokio::test]
    async fn stream_failures_become_failures() {
        let receiver = Receiver::new();
        let handler = receiver.handler();
        let failure = ConnectionError::Codec {
            protocol: "response".into(),
            source: CodecError::Payload(PayloadError::UnknownLoaderId(3)),
        };
        assert!(handler.handle_stream_failure(failure).is_ok());
        assert!(matches!(
            receiver.get_next_result().await,
            Err(WorkerError::Payload(PayloadError::UnknownLoaderId(3)))
        ));

        (receiver.failure_sink())(&ConnectionError::Closed);
        assert!(matches!(
            receiver.get_next_result().await,
            Err(WorkerError::Connection(_))
        ));
    }
}
