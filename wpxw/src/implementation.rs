use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;
use wpx_core::connection::Outgoing;
use wpx_core::error::PayloadError;
use wpx_core::loader::{Class, ClassLoader};
use wpx_core::protocol::{ProblemEvent, ProblemsProtocol, Severity};
use wpx_core::request::BuildOperationRef;
use wpx_core::value::{RemoteError, Value};

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("worker implementation '{implementation}' has no method '{method}'")]
    NoSuchMethod {
        implementation: String,
        method: String,
    },

    /// A type the invoked code needs is not visible to the worker.
    #[error("missing definition: {0}")]
    MissingDefinition(String),

    #[error("{0}")]
    Failed(RemoteError),

    #[error("worker action panicked: {0}")]
    Panicked(String),
}

impl From<PayloadError> for InvocationError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::ClassNotFound { class_name, loader } => {
                InvocationError::MissingDefinition(format!("class '{class_name}' in {loader}"))
            }
            other => InvocationError::MissingDefinition(other.to_string()),
        }
    }
}

/// One worker implementation, instantiated once per worker process on its
/// first request.
#[async_trait]
pub trait WorkerImplementation: Send + Sync {
    async fn invoke(
        &self,
        method: &str,
        param_types: &[String],
        args: Vec<Value>,
        ctx: &WorkContext,
    ) -> Result<Value, InvocationError>;
}

pub type ImplementationFactory = Arc<dyn Fn() -> Result<Arc<dyn WorkerImplementation>> + Send + Sync>;

/// Named factories for every implementation a worker binary can serve.
#[derive(Clone, Default)]
pub struct ImplementationRegistry {
    factories: BTreeMap<String, ImplementationFactory>,
}

impl ImplementationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ImplementationFactory) -> &mut Self {
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// `Ok(None)` when nothing is registered under `name`.
    pub fn create(&self, name: &str) -> Result<Option<Arc<dyn WorkerImplementation>>> {
        match self.factories.get(name) {
            Some(factory) => factory().map(Some),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for ImplementationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

/// The loader that resolves types for the work currently running. Outside of
/// a request it is the system loader.
#[derive(Clone)]
pub struct LoaderScope {
    system: Arc<ClassLoader>,
    current: Arc<Mutex<Option<Arc<ClassLoader>>>>,
}

impl LoaderScope {
    pub fn new(system: Arc<ClassLoader>) -> Self {
        Self {
            system,
            current: Arc::new(Mutex::new(None)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<ClassLoader>>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current(&self) -> Arc<ClassLoader> {
        self.slot().clone().unwrap_or_else(|| Arc::clone(&self.system))
    }

    /// Makes `loader` current until the guard drops, then restores whatever
    /// was current before.
    pub fn enter(&self, loader: Option<Arc<ClassLoader>>) -> ScopeGuard {
        let previous = std::mem::replace(&mut *self.slot(), loader);
        ScopeGuard {
            scope: self.clone(),
            previous,
        }
    }
}

pub struct ScopeGuard {
    scope: LoaderScope,
    previous: Option<Arc<ClassLoader>>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        *self.scope.slot() = self.previous.take();
    }
}

/// What a running implementation can reach: its build operation, the
/// problems channel and the current loader scope.
pub struct WorkContext {
    build_operation: BuildOperationRef,
    problems: Option<Outgoing<ProblemsProtocol>>,
    scope: LoaderScope,
}

impl WorkContext {
    pub fn new(
        build_operation: BuildOperationRef,
        problems: Option<Outgoing<ProblemsProtocol>>,
        scope: LoaderScope,
    ) -> Self {
        Self {
            build_operation,
            problems,
            scope,
        }
    }

    pub fn build_operation(&self) -> BuildOperationRef {
        self.build_operation
    }

    pub fn loader(&self) -> Arc<ClassLoader> {
        self.scope.current()
    }

    pub fn load_class(&self, name: &str) -> Result<Class, InvocationError> {
        Ok(self.loader().load_class(name)?)
    }

    /// An error of class `class_name`, resolved through the current scope.
    pub fn error(&self, class_name: &str, message: impl Into<String>) -> InvocationError {
        match RemoteError::system(&self.loader(), class_name, message) {
            Ok(err) => InvocationError::Failed(err),
            Err(err) => err.into(),
        }
    }

    pub fn report_problem(&self, severity: Severity, label: impl Into<String>, details: Option<String>) {
        let event = ProblemEvent {
            severity,
            label: label.into(),
            details,
            build_operation: self.build_operation,
        };
        match &self.problems {
            Some(problems) => {
                if let Err(err) = problems.send(&event) {
                    debug!(error = %err, "could not report problem");
                }
            }
            None => debug!(label = %event.label, "no problems channel; dropping problem"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wpx_core::loader::{StaticTypeSource, ILLEGAL_STATE_CLASS};

    #[test]
    fn scope_resets_when_guard_drops() {
        let source = Arc::new(StaticTypeSource::new().with_types("lib", ["org.Widget"]));
        let system = ClassLoader::system(Vec::new(), source.clone());
        let client = ClassLoader::client_owned(["lib".to_string()], vec![Arc::clone(&system)], source);
        let scope = LoaderScope::new(Arc::clone(&system));
        {
            let _guard = scope.enter(Some(Arc::clone(&client)));
            assert!(Arc::ptr_eq(&scope.current(), &client));
            assert!(scope.current().load_class("org.Widget").is_ok());
        }
        assert!(scope.current().is_system());
    }

    #[test]
    fn nested_scope_restores_outer_loader() {
        let source = Arc::new(StaticTypeSource::new().with_types("lib", ["org.Widget"]));
        let system = ClassLoader::system(Vec::new(), source.clone());
        let outer = ClassLoader::client_owned(["lib".to_string()], vec![Arc::clone(&system)], source);
        let scope = LoaderScope::new(system);
        let _outer = scope.enter(Some(Arc::clone(&outer)));
        {
            let _inner = scope.enter(None);
            assert!(scope.current().is_system());
        }
        assert!(Arc::ptr_eq(&scope.current(), &outer));
    }

    #[test]
    fn errors_resolve_through_scope() {
        let system = ClassLoader::system(Vec::new(), Arc::new(StaticTypeSource::new()));
        let ctx = WorkContext::new(BuildOperationRef::new(7), None, LoaderScope::new(system));
        match ctx.error(ILLEGAL_STATE_CLASS, "boom") {
            InvocationError::Failed(err) => assert_eq!(err.class_name(), ILLEGAL_STATE_CLASS),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            ctx.load_class("org.Missing"),
            Err(InvocationError::MissingDefinition(_))
        ));
    }

    #[test]
    fn unknown_implementation_is_none() {
        let registry = ImplementationRegistry::new();
        assert!(registry.create("nope").unwrap().is_none());
    }
}
