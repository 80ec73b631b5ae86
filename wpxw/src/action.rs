use anyhow::Result;
use async_trait::async_trait;
use std::any::Any;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use wpx_core::connection::{ConnectionError, IncomingHandler, Outgoing};
use wpx_core::error::PayloadError;
use wpx_core::loader::{
    Class, ClassLoader, ILLEGAL_ARGUMENT_CLASS, INFRASTRUCTURE_ERROR_CLASS, PANIC_CLASS,
    RUNTIME_ERROR_CLASS, STREAM_FAILURE_CLASS,
};
use wpx_core::protocol::{ProblemsProtocol, RequestMessage, ResponseMessage, ResponseProtocol};
use wpx_core::request::Request;
use wpx_core::value::{RemoteError, Value};

use crate::implementation::{
    ImplementationRegistry, InvocationError, LoaderScope, WorkContext, WorkerImplementation,
};

/// Error classes a worker raises itself, resolved once from the system loader.
#[derive(Clone)]
struct ErrorClasses {
    infrastructure: Class,
    illegal_argument: Class,
    runtime: Class,
    panic: Class,
    stream_failure: Class,
}

impl ErrorClasses {
    fn resolve(system: &Arc<ClassLoader>) -> Result<Self, PayloadError> {
        Ok(Self {
            infrastructure: system.load_class(INFRASTRUCTURE_ERROR_CLASS)?,
            illegal_argument: system.load_class(ILLEGAL_ARGUMENT_CLASS)?,
            runtime: system.load_class(RUNTIME_ERROR_CLASS)?,
            panic: system.load_class(PANIC_CLASS)?,
            stream_failure: system.load_class(STREAM_FAILURE_CLASS)?,
        })
    }

    fn infrastructure(&self, message: impl Into<String>, cause: RemoteError) -> RemoteError {
        RemoteError::new(self.infrastructure.clone(), message).with_cause(cause)
    }
}

/// Runs one invocation on its own task so a panic surfaces as an error, and
/// scopes the loader of the request's first object argument around it.
pub struct ActionExecutionWorker {
    scope: LoaderScope,
}

impl ActionExecutionWorker {
    pub fn new(scope: LoaderScope) -> Self {
        Self { scope }
    }

    pub async fn execute(
        &self,
        implementation: Arc<dyn WorkerImplementation>,
        request: Request,
        problems: Option<Outgoing<ProblemsProtocol>>,
    ) -> Result<Value, InvocationError> {
        let loader = request.args.iter().find_map(|arg| match arg {
            Value::Object(obj) => Some(Arc::clone(obj.class.loader())),
            _ => None,
        });
        let _scope = self.scope.enter(loader);
        let ctx = WorkContext::new(request.build_operation, problems, self.scope.clone());
        let task = tokio::spawn(async move {
            implementation
                .invoke(&request.method, &request.param_types, request.args, &ctx)
                .await
        });
        match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(InvocationError::Panicked(panic_message(err.into_panic()))),
            Err(err) => Err(InvocationError::Panicked(err.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Serves one named implementation over the request protocol.
pub struct WorkerAction {
    implementation_name: String,
    implementations: ImplementationRegistry,
    instance: Mutex<Option<Arc<dyn WorkerImplementation>>>,
    executor: ActionExecutionWorker,
    errors: ErrorClasses,
    responses: Outgoing<ResponseProtocol>,
    problems: Option<Outgoing<ProblemsProtocol>>,
    stop: Arc<Notify>,
}

impl WorkerAction {
    pub fn new(
        implementation_name: impl Into<String>,
        implementations: ImplementationRegistry,
        scope: LoaderScope,
        system: &Arc<ClassLoader>,
        responses: Outgoing<ResponseProtocol>,
        problems: Option<Outgoing<ProblemsProtocol>>,
        stop: Arc<Notify>,
    ) -> Result<Self> {
        Ok(Self {
            implementation_name: implementation_name.into(),
            implementations,
            instance: Mutex::new(None),
            executor: ActionExecutionWorker::new(scope),
            errors: ErrorClasses::resolve(system)?,
            responses,
            problems,
            stop,
        })
    }

    fn instance(&self) -> Result<Arc<dyn WorkerImplementation>, RemoteError> {
        let mut slot = self.instance.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(instance) = slot.as_ref() {
            return Ok(Arc::clone(instance));
        }
        let message = format!("Failed to create worker implementation '{}'", self.implementation_name);
        match self.implementations.create(&self.implementation_name) {
            Ok(Some(instance)) => {
                debug!(implementation = %self.implementation_name, "worker implementation created");
                *slot = Some(Arc::clone(&instance));
                Ok(instance)
            }
            Ok(None) => {
                let cause = RemoteError::new(
                    self.errors.illegal_argument.clone(),
                    format!("no worker implementation named '{}'", self.implementation_name),
                );
                Err(self.errors.infrastructure(message, cause))
            }
            Err(err) => {
                let cause = RemoteError::new(self.errors.runtime.clone(), format!("{err:#}"));
                Err(self.errors.infrastructure(message, cause))
            }
        }
    }

    async fn run(&self, request: Request) -> ResponseMessage {
        let implementation = match self.instance() {
            Ok(instance) => instance,
            Err(err) => return ResponseMessage::InfrastructureFailed(err),
        };
        let method = request.method.clone();
        let op = request.build_operation.id;
        debug!(method = %method, op, "running request");
        match self.executor.execute(implementation, request, self.problems.clone()).await {
            Ok(value) => ResponseMessage::Completed(value),
            Err(InvocationError::Failed(err)) => ResponseMessage::Failed(err),
            Err(InvocationError::Panicked(message)) => {
                ResponseMessage::Failed(RemoteError::new(self.errors.panic.clone(), message))
            }
            Err(err @ (InvocationError::NoSuchMethod { .. } | InvocationError::MissingDefinition(_))) => {
                let cause = RemoteError::new(self.errors.runtime.clone(), err.to_string());
                ResponseMessage::InfrastructureFailed(self.errors.infrastructure(
                    format!("Failed to run {}.{}", self.implementation_name, method),
                    cause,
                ))
            }
        }
    }

    fn respond(&self, response: ResponseMessage) {
        let Err(err) = self.responses.send(&response) else {
            return;
        };
        warn!(error = %err, "could not send response");
        let fallback = RemoteError::new(
            self.errors.runtime.clone(),
            format!("failed to send worker result: {err}"),
        );
        if let Err(err) = self.responses.send(&ResponseMessage::Failed(fallback)) {
            warn!(error = %err, "could not send failure response");
        }
    }
}

#[async_trait]
impl IncomingHandler<RequestMessage> for WorkerAction {
    async fn handle(&self, message: RequestMessage) {
        match message {
            RequestMessage::Run(request) => {
                let response = self.run(request).await;
                self.respond(response);
            }
            RequestMessage::RunThenStop(request) => {
                let response = self.run(request).await;
                self.respond(response);
                self.stop.notify_one();
            }
            RequestMessage::Stop => {
                info!("stop requested");
                self.stop.notify_one();
            }
        }
    }

    /// An undecodable request still gets a response, so the caller never waits forever.
    fn handle_stream_failure(&self, failure: ConnectionError) -> Result<(), ConnectionError> {
        warn!(error = %failure, "could not decode request");
        let err = RemoteError::new(self.errors.stream_failure.clone(), failure.to_string());
        self.respond(ResponseMessage::Failed(err));
        Ok(())
    }

    async fn end_of_stream(&self) {
        self.stop.notify_one();
    }
}
