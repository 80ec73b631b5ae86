//! A bidirectional, multiplexed message channel over one byte stream.
//!
//! Each [`Protocol`] is a named message type. Outgoing messages from every
//! protocol share one writer queue, so they reach the peer in send order.
//! Incoming messages from every protocol are handled one at a time in the
//! order they were read, so a handler sees everything the peer sent before it.

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};

use crate::error::PayloadError;
use crate::frame::{read_frame, write_frame, Frame};

const READER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid frame magic")]
    BadMagic,

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u8),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("no handler registered for protocol '{0}'")]
    UnknownProtocol(String),

    #[error("no serializer registered for protocol '{0}'")]
    NoSerializer(&'static str),

    #[error("protocol '{0}' is already registered on this connection")]
    DuplicateProtocol(&'static str),

    #[error("connection is already connected")]
    AlreadyConnected,

    #[error("failed to decode '{protocol}' message: {source}")]
    Codec {
        protocol: String,
        #[source]
        source: CodecError,
    },

    #[error("connection is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("{0}")]
    Malformed(String),
}

/// A named message type carried by an [`ObjectConnection`].
pub trait Protocol: Send + Sync + 'static {
    const NAME: &'static str;
    type Message: Send + 'static;
}

pub trait MessageCodec<M>: Send + Sync {
    fn encode(&self, message: &M) -> Result<Bytes, CodecError>;
    fn decode(&self, body: Bytes) -> Result<M, CodecError>;
}

/// Plain serde_json encoding, for messages that carry no classloader-bound values.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<M> MessageCodec<M> for JsonCodec
where
    M: Serialize + DeserializeOwned,
{
    fn encode(&self, message: &M) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    fn decode(&self, body: Bytes) -> Result<M, CodecError> {
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Codecs per protocol. Must be installed on a connection before any
/// incoming or outgoing registration.
#[derive(Default)]
pub struct SerializerRegistry {
    codecs: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Protocol>(&mut self, codec: Arc<dyn MessageCodec<P::Message>>) -> &mut Self {
        self.codecs.insert(TypeId::of::<P>(), Box::new(codec));
        self
    }

    pub fn get<P: Protocol>(&self) -> Option<Arc<dyn MessageCodec<P::Message>>> {
        self.codecs
            .get(&TypeId::of::<P>())
            .and_then(|codec| codec.downcast_ref::<Arc<dyn MessageCodec<P::Message>>>())
            .cloned()
    }
}

/// Receives decoded messages for one protocol, in arrival order.
#[async_trait]
pub trait IncomingHandler<M>: Send + Sync {
    async fn handle(&self, message: M);

    /// Called when one message of this protocol could not be decoded.
    /// Returning the error escalates it to the connection's unrecoverable
    /// error handlers.
    fn handle_stream_failure(&self, failure: ConnectionError) -> Result<(), ConnectionError> {
        Err(failure)
    }

    /// Called once after the last message, whether the stream ended cleanly or not.
    async fn end_of_stream(&self);
}

pub type UnrecoverableErrorHandler = Arc<dyn Fn(&ConnectionError) + Send + Sync>;

/// Typed sender for one protocol. Transport failures are reported to the
/// connection's unrecoverable error handlers, never to the sender.
pub struct Outgoing<P: Protocol> {
    codec: Arc<dyn MessageCodec<P::Message>>,
    queue: mpsc::UnboundedSender<Frame>,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: Protocol> Clone for Outgoing<P> {
    fn clone(&self) -> Self {
        Self {
            codec: Arc::clone(&self.codec),
            queue: self.queue.clone(),
            _protocol: PhantomData,
        }
    }
}

impl<P: Protocol> Outgoing<P> {
    /// Encodes and enqueues `message`. Only encoding failures are returned.
    pub fn send(&self, message: &P::Message) -> Result<(), ConnectionError> {
        let body = self
            .codec
            .encode(message)
            .map_err(|source| ConnectionError::Codec {
                protocol: P::NAME.to_string(),
                source,
            })?;
        let frame = Frame::Message {
            protocol: P::NAME.to_string(),
            body,
        };
        if self.queue.send(frame).is_err() {
            trace!(protocol = P::NAME, "dropping message sent after connection stopped");
        }
        Ok(())
    }
}


/// Decodes and hands one protocol's frames to its handler.
#[async_trait]
trait Route: Send + Sync {
    async fn deliver(&self, body: Bytes) -> Result<(), ConnectionError>;
    async fn end_of_stream(&self);
}

struct TypedRoute<P: Protocol> {
    codec: Arc<dyn MessageCodec<P::Message>>,
    handler: Arc<dyn IncomingHandler<P::Message>>,
}

#[async_trait]
impl<P: Protocol> Route for TypedRoute<P> {
    async fn deliver(&self, body: Bytes) -> Result<(), ConnectionError> {
        match self.codec.decode(body) {
            Ok(message) => {
                self.handler.handle(message).await;
                Ok(())
            }
            Err(source) => self.handler.handle_stream_failure(ConnectionError::Codec {
                protocol: P::NAME.to_string(),
                source,
            }),
        }
    }

    async fn end_of_stream(&self) {
        self.handler.end_of_stream().await;
    }
}

type Routes = Vec<(&'static str, Arc<dyn Route>)>;

enum Delivery {
    Message(Arc<dyn Route>, Bytes),
    EndOfStream,
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

struct Shared {
    peer: String,
    failed: AtomicBool,
    stopping: AtomicBool,
    error_handlers: Mutex<Vec<UnrecoverableErrorHandler>>,
}

impl Shared {
    fn fail(&self, err: ConnectionError) {
        if self.stopping.load(Ordering::Acquire) {
            debug!(peer = %self.peer, error = %err, "connection error while stopping");
            return;
        }
        if self.failed.swap(true, Ordering::AcqRel) {
            debug!(peer = %self.peer, error = %err, "further connection error after failure");
            return;
        }
        warn!(peer = %self.peer, error = %err, "unrecoverable connection error");
        let handlers = self
            .error_handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for handler in handlers {
            handler(&err);
        }
    }
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

pub struct ObjectConnection {
    shared: Arc<Shared>,
    serializers: Mutex<Option<Arc<SerializerRegistry>>>,
    incoming: Mutex<Routes>,
    halves: Mutex<Option<(BoxedRead, BoxedWrite)>>,
    queue_tx: mpsc::UnboundedSender<Frame>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    connected: AtomicBool,
    tasks: Mutex<Tasks>,
}

impl ObjectConnection {
    pub fn new<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                peer: peer.into(),
                failed: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                error_handlers: Mutex::new(Vec::new()),
            }),
            serializers: Mutex::new(None),
            incoming: Mutex::new(Vec::new()),
            halves: Mutex::new(Some((Box::new(read), Box::new(write)))),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            connected: AtomicBool::new(false),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn use_parameter_serializers(&self, registry: Arc<SerializerRegistry>) {
        *lock(&self.serializers) = Some(registry);
    }

    fn codec<P: Protocol>(&self) -> Result<Arc<dyn MessageCodec<P::Message>>, ConnectionError> {
        lock(&self.serializers)
            .as_ref()
            .and_then(|registry| registry.get::<P>())
            .ok_or(ConnectionError::NoSerializer(P::NAME))
    }

    pub fn add_outgoing<P: Protocol>(&self) -> Result<Outgoing<P>, ConnectionError> {
        Ok(Outgoing {
            codec: self.codec::<P>()?,
            queue: self.queue_tx.clone(),
            _protocol: PhantomData,
        })
    }

    /// Registers the handler for protocol `P`. Must happen before [`Self::connect`].
    pub fn add_incoming<P: Protocol>(
        &self,
        handler: Arc<dyn IncomingHandler<P::Message>>,
    ) -> Result<(), ConnectionError> {
        if self.connected.load(Ordering::Acquire) {
            return Err(ConnectionError::AlreadyConnected);
        }
        let codec = self.codec::<P>()?;
        let mut incoming = lock(&self.incoming);
        if incoming.iter().any(|(name, _)| *name == P::NAME) {
            return Err(ConnectionError::DuplicateProtocol(P::NAME));
        }
        incoming.push((P::NAME, Arc::new(TypedRoute::<P> { codec, handler })));
        Ok(())
    }

    pub fn add_unrecoverable_error_handler(&self, handler: UnrecoverableErrorHandler) {
        lock(&self.shared.error_handlers).push(handler);
    }

    /// Starts reading and writing. Messages queued before this call are sent first.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(ConnectionError::AlreadyConnected);
        }
        let (read, write) = lock(&self.halves).take().ok_or(ConnectionError::Closed)?;
        let queue = lock(&self.queue_rx).take().ok_or(ConnectionError::Closed)?;
        let routes = lock(&self.incoming).clone();
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();

        let dispatcher = tokio::spawn(dispatch_loop(
            deliveries_rx,
            routes.clone(),
            Arc::clone(&self.shared),
        ));
        let reader = tokio::spawn(read_loop(read, routes, deliveries_tx, Arc::clone(&self.shared)));
        let writer = tokio::spawn(write_loop(write, queue, Arc::clone(&self.shared)));
        let mut tasks = lock(&self.tasks);
        tasks.reader = Some(reader);
        tasks.writer = Some(writer);
        tasks.dispatcher = Some(dispatcher);
        debug!(peer = %self.shared.peer, "object connection started");
        Ok(())
    }

    /// Sends the end-of-stream marker, flushes pending writes and waits for
    /// the peer to finish its side. Errors seen while stopping are not
    /// reported to the unrecoverable error handlers.
    pub async fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.queue_tx.send(Frame::Stop);
        let (reader, writer, dispatcher) = {
            let mut tasks = lock(&self.tasks);
            (tasks.reader.take(), tasks.writer.take(), tasks.dispatcher.take())
        };

        if let Some(writer) = writer {
            let _ = writer.await;
        }
        if let Some(mut reader) = reader {
            if timeout(READER_STOP_TIMEOUT, &mut reader).await.is_err() {
                warn!(peer = %self.shared.peer, "peer did not close its stream; aborting reader");
                // Dropping the reader's sender ends the dispatcher.
                reader.abort();
            }
        }
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
        debug!(peer = %self.shared.peer, "object connection stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_loop(
    mut read: BoxedRead,
    routes: Routes,
    deliveries: mpsc::UnboundedSender<Delivery>,
    shared: Arc<Shared>,
) {
    loop {
        match read_frame(&mut read).await {
            Ok(Some(Frame::Message { protocol, body })) => {
                match routes.iter().find(|(name, _)| *name == protocol) {
                    Some((_, route)) => {
                        let _ = deliveries.send(Delivery::Message(Arc::clone(route), body));
                    }
                    None => {
                        shared.fail(ConnectionError::UnknownProtocol(protocol));
                        break;
                    }
                }
            }
            Ok(Some(Frame::Stop)) => {
                debug!(peer = %shared.peer, "peer stopped");
                break;
            }
            Ok(None) => {
                debug!(peer = %shared.peer, "peer closed stream without stop marker");
                break;
            }
            Err(err) => {
                shared.fail(err);
                break;
            }
        }
    }
    let _ = deliveries.send(Delivery::EndOfStream);
}

async fn write_loop(
    mut write: BoxedWrite,
    mut queue: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
) {
    while let Some(frame) = queue.recv().await {
        let stop = matches!(frame, Frame::Stop);
        if let Err(err) = write_frame(&mut write, &frame).await {
            shared.fail(err);
            return;
        }
        if stop {
            let _ = write.shutdown().await;
            return;
        }
    }
}

/// Runs handlers one frame at a time, across all protocols, in read order.
async fn dispatch_loop(
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    routes: Routes,
    shared: Arc<Shared>,
) {
    while let Some(Delivery::Message(route, body)) = deliveries.recv().await {
        if let Err(err) = route.deliver(body).await {
            shared.fail(err);
        }
    }
    for (_, route) in &routes {
        route.end_of_stream().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping(u32);

    struct PingProtocol;
    impl Protocol for PingProtocol {
        const NAME: &'static str = "ping";
        type Message = Ping;
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note(String);

    struct NoteProtocol;
    impl Protocol for NoteProtocol {
        const NAME: &'static str = "note";
        type Message = Note;
    }

    #[derive(Default)]
    struct Recorder {
        seen: AsyncMutex<Vec<String>>,
        ended: AtomicBool,
        note_delay: Duration,
    }

    #[async_trait]
    impl IncomingHandler<Ping> for Recorder {
        async fn handle(&self, message: Ping) {
            self.seen.lock().await.push(format!("ping {}", message.0));
        }

        async fn end_of_stream(&self) {
            self.ended.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl IncomingHandler<Note> for Recorder {
        async fn handle(&self, message: Note) {
            tokio::time::sleep(self.note_delay).await;
            self.seen.lock().await.push(format!("note {}", message.0));
        }

        async fn end_of_stream(&self) {}
    }

    fn serializers() -> Arc<SerializerRegistry> {
        let mut registry = SerializerRegistry::new();
        registry
            .register::<PingProtocol>(Arc::new(JsonCodec))
            .register::<NoteProtocol>(Arc::new(JsonCodec));
        Arc::new(registry)
    }

    #[tokio::test]
    async fn messages_arrive_in_order_per_protocol() {
        let (a, b) = tokio::io::duplex(4096);
        let left = ObjectConnection::new(a, "left");
        let right = ObjectConnection::new(b, "right");
        left.use_parameter_serializers(serializers());
        right.use_parameter_serializers(serializers());

        let recorder = Arc::new(Recorder::default());
        right
            .add_incoming::<PingProtocol>(recorder.clone())
            .unwrap();
        right
            .add_incoming::<NoteProtocol>(recorder.clone())
            .unwrap();
        let pings = left.add_outgoing::<PingProtocol>().unwrap();
        let notes = left.add_outgoing::<NoteProtocol>().unwrap();

        right.connect().unwrap();
        left.connect().unwrap();
        for i in 0..5 {
            pings.send(&Ping(i)).unwrap();
        }
        notes.send(&Note("done".into())).unwrap();

        tokio::join!(left.stop(), right.stop());

        let seen = recorder.seen.lock().await.clone();
        let ping_order: Vec<_> = seen.iter().filter(|s| s.starts_with("ping")).cloned().collect();
        assert_eq!(ping_order, (0..5).map(|i| format!("ping {i}")).collect::<Vec<_>>());
        assert!(seen.contains(&"note done".to_string()));
        assert!(recorder.ended.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn slow_handler_does_not_let_later_protocols_overtake() {
        let (a, b) = tokio::io::duplex(4096);
        let worker = ObjectConnection::new(a, "worker");
        let coordinator = ObjectConnection::new(b, "coordinator");
        worker.use_parameter_serializers(serializers());
        coordinator.use_parameter_serializers(serializers());

        let recorder = Arc::new(Recorder {
            note_delay: Duration::from_millis(30),
            ..Recorder::default()
        });
        coordinator.add_incoming::<NoteProtocol>(recorder.clone()).unwrap();
        coordinator.add_incoming::<PingProtocol>(recorder.clone()).unwrap();
        let notes = worker.add_outgoing::<NoteProtocol>().unwrap();
        let pings = worker.add_outgoing::<PingProtocol>().unwrap();
        coordinator.connect().unwrap();
        worker.connect().unwrap();

        notes.send(&Note("compiling".into())).unwrap();
        pings.send(&Ping(42)).unwrap();
        tokio::join!(worker.stop(), coordinator.stop());

        assert_eq!(
            *recorder.seen.lock().await,
            vec!["note compiling".to_string(), "ping 42".to_string()]
        );
    }

    #[tokio::test]
    async fn registration_requires_serializer_and_precedes_connect() {
        let (a, _b) = tokio::io::duplex(64);
        let conn = ObjectConnection::new(a, "left");
        assert!(matches!(
            conn.add_outgoing::<PingProtocol>(),
            Err(ConnectionError::NoSerializer("ping"))
        ));

        conn.use_parameter_serializers(serializers());
        conn.connect().unwrap();
        let late = conn.add_incoming::<PingProtocol>(Arc::new(Recorder::default()));
        assert!(matches!(late, Err(ConnectionError::AlreadyConnected)));
        assert!(matches!(conn.connect(), Err(ConnectionError::AlreadyConnected)));
    }

    #[tokio::test]
    async fn broken_stream_runs_failure_handlers_once() {
        let (a, mut b) = tokio::io::duplex(64);
        let conn = ObjectConnection::new(a, "left");
        conn.use_parameter_serializers(serializers());
        let recorder = Arc::new(Recorder::default());
        conn.add_incoming::<PingProtocol>(recorder.clone()).unwrap();

        let failures = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        conn.add_unrecoverable_error_handler(Arc::new(move |_: &ConnectionError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        conn.connect().unwrap();

        b.write_all(b"garbage-garbage-garbage").await.unwrap();
        drop(b);
        for _ in 0..100 {
            if recorder.ended.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(recorder.ended.load(Ordering::SeqCst));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }
}
