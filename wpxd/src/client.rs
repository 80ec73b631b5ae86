use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Duration;
use tracing::{debug, error, info, trace, warn};
use wpx_core::connection::{
    CodecError, ConnectionError, IncomingHandler, ObjectConnection, Outgoing, SerializerRegistry,
};
use wpx_core::fork_options::DaemonForkOptions;
use wpx_core::protocol::{
    LogEvent, LogLevel, LoggingProtocol, MemoryStatus, MemoryStatusProtocol, ProblemEvent,
    ProblemsProtocol, RequestMessage, RequestProtocol, ResponseProtocol, Severity,
};
use wpx_core::receiver::{Interrupter, Receiver};
use wpx_core::request::Request;
use wpx_core::stoppable::Stoppable;
use wpx_core::value::Value;
use wpx_core::WorkerError;

use crate::pool::DaemonClient;
use crate::process::WorkerProcess;

pub type LogListener = Arc<dyn Fn(&LogEvent) + Send + Sync>;

/// What a worker has reported besides responses.
#[derive(Default)]
struct WorkerReports {
    problems: Mutex<Vec<ProblemEvent>>,
    memory: Mutex<Option<MemoryStatus>>,
    log_listeners: Mutex<Vec<LogListener>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct WorkerClient {
    display_name: String,
    process: AsyncMutex<WorkerProcess>,
    connection: Arc<ObjectConnection>,
    requests: Outgoing<RequestProtocol>,
    receiver: Receiver,
    in_flight: AsyncMutex<()>,
    fork_options: DaemonForkOptions,
    reports: Arc<WorkerReports>,
    stop_timeout: Duration,
}

impl WorkerClient {
    /// Wires every protocol onto the worker's connection and starts it.
    pub fn attach(
        process: WorkerProcess,
        serializers: Arc<SerializerRegistry>,
        fork_options: DaemonForkOptions,
        stop_timeout: Duration,
    ) -> Result<Self> {
        let display_name = process.display_name().to_string();
        let connection = Arc::clone(process.connection());
        connection.use_parameter_serializers(serializers);

        let receiver = Receiver::new();
        let reports = Arc::new(WorkerReports::default());
        connection.add_incoming::<ResponseProtocol>(receiver.handler())?;
        connection.add_incoming::<LoggingProtocol>(Arc::new(LogForwardHandler {
            worker: display_name.clone(),
            reports: Arc::clone(&reports),
        }))?;
        connection.add_incoming::<ProblemsProtocol>(Arc::new(ProblemsHandler {
            worker: display_name.clone(),
            reports: Arc::clone(&reports),
        }))?;
        connection.add_incoming::<MemoryStatusProtocol>(Arc::new(MemoryStatusHandler {
            reports: Arc::clone(&reports),
        }))?;
        connection.add_unrecoverable_error_handler(Arc::new(receiver.failure_sink()));
        let requests = connection.add_outgoing::<RequestProtocol>()?;
        connection.connect()?;

        Ok(Self {
            display_name,
            process: AsyncMutex::new(process),
            connection,
            requests,
            receiver,
            in_flight: AsyncMutex::new(()),
            fork_options,
            reports,
            stop_timeout,
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Sends `request` and waits for its single outcome. One request at a
    /// time per worker; concurrent callers queue here.
    pub async fn execute(&self, request: Request) -> Result<Value, WorkerError> {
        let _in_flight = self.in_flight.lock().await;
        debug!(worker = %self.display_name, method = %request.method, "dispatching request");
        self.requests
            .send(&RequestMessage::Run(request))
            .map_err(send_failure)?;
        self.receiver.get_next_result().await
    }

    /// Sends `request` as the worker's last. The worker answers, then shuts
    /// itself down; this waits for the process to exit before returning.
    pub async fn execute_then_stop(&self, request: Request) -> Result<Value, WorkerError> {
        let _in_flight = self.in_flight.lock().await;
        debug!(worker = %self.display_name, method = %request.method, "dispatching final request");
        self.requests
            .send(&RequestMessage::RunThenStop(request))
            .map_err(send_failure)?;
        let result = self.receiver.get_next_result().await;
        self.connection.stop().await;
        if let Err(err) = self.process.lock().await.wait_for_stop(self.stop_timeout).await {
            warn!(worker = %self.display_name, error = %err, "single-use worker did not stop cleanly");
        }
        result
    }

    /// True once the worker process has exited.
    pub async fn has_exited(&self) -> bool {
        matches!(self.process.lock().await.try_exit_status(), Ok(Some(_)))
    }

    /// Wakes a caller blocked in [`Self::execute`].
    pub fn interrupter(&self) -> Interrupter {
        self.receiver.interrupter()
    }

    /// Called for every log event the worker forwards, before the response
    /// of the request that produced it is returned.
    pub fn add_log_listener(&self, listener: LogListener) {
        lock(&self.reports.log_listeners).push(listener);
    }

    /// Drains the problems reported so far.
    pub fn take_problems(&self) -> Vec<ProblemEvent> {
        std::mem::take(&mut *lock(&self.reports.problems))
    }

    /// Most recent memory status, if the worker publishes it.
    pub fn memory_status(&self) -> Option<MemoryStatus> {
        *lock(&self.reports.memory)
    }
}

fn send_failure(err: ConnectionError) -> WorkerError {
    match err {
        ConnectionError::Codec {
            source: CodecError::Payload(err),
            ..
        } => WorkerError::Payload(err),
        other => WorkerError::Connection(other.to_string()),
    }
}

#[async_trait]
impl Stoppable for WorkerClient {
    /// Asks the worker to stop, closes the connection and waits for the
    /// process to exit, killing it after the stop timeout.
    async fn stop(&self) -> Result<()> {
        if let Err(err) = self.requests.send(&RequestMessage::Stop) {
            debug!(worker = %self.display_name, error = %err, "could not send stop request");
        }
        self.connection.stop().await;
        let mut process = self.process.lock().await;
        process.wait_for_stop(self.stop_timeout).await?;
        info!(worker = %self.display_name, "worker stopped");
        Ok(())
    }
}

#[async_trait]
impl DaemonClient for WorkerClient {
    fn fork_options(&self) -> &DaemonForkOptions {
        &self.fork_options
    }

    async fn execute(&self, request: Request) -> Result<Value, WorkerError> {
        WorkerClient::execute(self, request).await
    }

    async fn execute_then_stop(&self, request: Request) -> Result<Value, WorkerError> {
        WorkerClient::execute_then_stop(self, request).await
    }
}

/// Re-emits forwarded worker log events on the coordinator's subscriber.
struct LogForwardHandler {
    worker: String,
    reports: Arc<WorkerReports>,
}

#[async_trait]
impl IncomingHandler<LogEvent> for LogForwardHandler {
    async fn handle(&self, event: LogEvent) {
        let op = event.build_operation.map(|op| op.id);
        let worker = self.worker.as_str();
        let source = event.target.as_str();
        let message = event.message.as_str();
        match event.level {
            LogLevel::Error => error!(target: "wpx::worker", worker, source, op, "{}", message),
            LogLevel::Warn => warn!(target: "wpx::worker", worker, source, op, "{}", message),
            LogLevel::Info => info!(target: "wpx::worker", worker, source, op, "{}", message),
            LogLevel::Debug => debug!(target: "wpx::worker", worker, source, op, "{}", message),
            LogLevel::Trace => trace!(target: "wpx::worker", worker, source, op, "{}", message),
        }
        let listeners = lock(&self.reports.log_listeners).clone();
        for listener in listeners {
            listener(&event);
        }
    }

    async fn end_of_stream(&self) {}
}

struct ProblemsHandler {
    worker: String,
    reports: Arc<WorkerReports>,
}

#[async_trait]
impl IncomingHandler<ProblemEvent> for ProblemsHandler {
    async fn handle(&self, problem: ProblemEvent) {
        match problem.severity {
            Severity::Error => warn!(worker = %self.worker, label = %problem.label, "worker reported error"),
            Severity::Warning | Severity::Advice => {
                debug!(worker = %self.worker, label = %problem.label, "worker reported problem")
            }
        }
        lock(&self.reports.problems).push(problem);
    }

    async fn end_of_stream(&self) {}
}

struct MemoryStatusHandler {
    reports: Arc<WorkerReports>,
}

#[async_trait]
impl IncomingHandler<MemoryStatus> for MemoryStatusHandler {
    async fn handle(&self, status: MemoryStatus) {
        *lock(&self.reports.memory) = Some(status);
    }

    async fn end_of_stream(&self) {}
}
