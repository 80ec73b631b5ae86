use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};
use wpx_core::loader::{ILLEGAL_ARGUMENT_CLASS, ILLEGAL_STATE_CLASS, RUNTIME_ERROR_CLASS};
use wpx_core::protocol::Severity;
use wpx_core::value::{Object, Value};

use crate::implementation::{ImplementationRegistry, InvocationError, WorkContext, WorkerImplementation};

pub const COMPILE_SPEC_CLASS: &str = "wpx.compile.CompileSpec";
pub const WORK_RESULT_CLASS: &str = "wpx.compile.WorkResult";

pub fn builtin_implementations() -> ImplementationRegistry {
    let mut registry = ImplementationRegistry::new();
    registry
        .register("echo", Arc::new(|| Ok(Arc::new(Echo) as Arc<dyn WorkerImplementation>)))
        .register("fail", Arc::new(|| Ok(Arc::new(Fail) as Arc<dyn WorkerImplementation>)))
        .register(
            "command-compiler",
            Arc::new(|| Ok(Arc::new(CommandCompiler) as Arc<dyn WorkerImplementation>)),
        );
    registry
}

fn no_such_method(implementation: &str, method: &str) -> InvocationError {
    InvocationError::NoSuchMethod {
        implementation: implementation.to_string(),
        method: method.to_string(),
    }
}

/// Returns what it is given.
///
/// * `echo(x)` returns `x`.
/// * `classpath(obj)` returns the classpath of the loader that defined `obj`'s class.
struct Echo;

#[async_trait]
impl WorkerImplementation for Echo {
    async fn invoke(
        &self,
        method: &str,
        _param_types: &[String],
        args: Vec<Value>,
        ctx: &WorkContext,
    ) -> Result<Value, InvocationError> {
        match method {
            "echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
            "classpath" => match args.first() {
                Some(Value::Object(obj)) => Ok(Value::List(
                    obj.class.loader().classpath().into_iter().map(Value::Str).collect(),
                )),
                _ => Err(ctx.error(ILLEGAL_ARGUMENT_CLASS, "classpath expects an object argument")),
            },
            other => Err(no_such_method("echo", other)),
        }
    }
}

/// Always fails with an `IllegalStateException` carrying the first argument.
struct Fail;

#[async_trait]
impl WorkerImplementation for Fail {
    async fn invoke(
        &self,
        method: &str,
        _param_types: &[String],
        args: Vec<Value>,
        ctx: &WorkContext,
    ) -> Result<Value, InvocationError> {
        if method != "fail" {
            return Err(no_such_method("fail", method));
        }
        let message = args.first().and_then(Value::as_str).unwrap_or("boom");
        Err(ctx.error(ILLEGAL_STATE_CLASS, message))
    }
}

#[derive(Debug, Deserialize)]
struct CompileSpec {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    working_dir: Option<String>,
}

#[derive(Debug, Default, PartialEq)]
struct OutputSummary {
    errors: i64,
    warnings: i64,
}

/// Runs an external compiler. Output lines starting with `error:` or
/// `warning:` become problems; everything else is logged.
struct CommandCompiler;

#[async_trait]
impl WorkerImplementation for CommandCompiler {
    async fn invoke(
        &self,
        method: &str,
        _param_types: &[String],
        args: Vec<Value>,
        ctx: &WorkContext,
    ) -> Result<Value, InvocationError> {
        if method != "compile" {
            return Err(no_such_method("command-compiler", method));
        }
        let spec = match args.first() {
            Some(Value::Object(obj)) if obj.class.name() == COMPILE_SPEC_CLASS => obj
                .to_serde::<CompileSpec>()
                .map_err(|err| ctx.error(ILLEGAL_ARGUMENT_CLASS, format!("invalid compile spec: {err}")))?,
            _ => {
                return Err(ctx.error(
                    ILLEGAL_ARGUMENT_CLASS,
                    format!("compile expects a {COMPILE_SPEC_CLASS} argument"),
                ))
            }
        };
        let result_class = ctx.load_class(WORK_RESULT_CLASS)?;
        let op = ctx.build_operation().id;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|err| {
            ctx.error(RUNTIME_ERROR_CLASS, format!("failed to start '{}': {err}", spec.program))
        })?;
        info!(op, program = %spec.program, "compiler started");

        let (tx, mut rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut summary = OutputSummary::default();
        while let Some(line) = rx.recv().await {
            classify_line(&line, ctx, &mut summary);
        }
        let status = child.wait().await.map_err(|err| {
            ctx.error(RUNTIME_ERROR_CLASS, format!("failed to wait for '{}': {err}", spec.program))
        })?;
        let exit_code = status.code().map_or(-1, i64::from);
        debug!(op, exit_code, errors = summary.errors, "compiler finished");

        if !status.success() {
            return Err(ctx.error(
                RUNTIME_ERROR_CLASS,
                format!(
                    "compilation failed with exit code {exit_code}; {} error(s)",
                    summary.errors
                ),
            ));
        }
        Ok(Value::Object(
            Object::new(result_class)
                .with_field("did_work", true)
                .with_field("exit_code", exit_code)
                .with_field("errors", summary.errors)
                .with_field("warnings", summary.warnings),
        ))
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

fn classify_line(line: &str, ctx: &WorkContext, summary: &mut OutputSummary) {
    let trimmed = line.trim_start();
    if let Some(label) = trimmed.strip_prefix("error:") {
        summary.errors += 1;
        ctx.report_problem(Severity::Error, label.trim(), None);
    } else if let Some(label) = trimmed.strip_prefix("warning:") {
        summary.warnings += 1;
        ctx.report_problem(Severity::Warning, label.trim(), None);
    } else if !trimmed.is_empty() {
        info!(op = ctx.build_operation().id, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::implementation::LoaderScope;
    use wpx_core::loader::{ClassLoader, StaticTypeSource};
    use wpx_core::request::BuildOperationRef;

    fn ctx() -> WorkContext {
        let system = ClassLoader::system(Vec::new(), Arc::new(StaticTypeSource::new()));
        WorkContext::new(BuildOperationRef::new(3), None, LoaderScope::new(system))
    }

    #[test]
    fn output_lines_are_classified() {
        let ctx = ctx();
        let mut summary = OutputSummary::default();
        for line in ["error: missing semicolon", "  warning: unused import", "compiling a.rs", ""] {
            classify_line(line, &ctx, &mut summary);
        }
        assert_eq!(summary, OutputSummary { errors: 1, warnings: 1 });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn compiler_runs_command_and_returns_work_result() {
        let ctx = ctx();
        let spec_class = ctx.load_class(COMPILE_SPEC_CLASS).unwrap();
        let spec = Object::new(spec_class)
            .with_field("program", "sh")
            .with_field(
                "args",
                Value::List(vec!["-c".into(), "echo 'warning: deprecated'; echo built".into()]),
            );
        let result = CommandCompiler
            .invoke("compile", &[], vec![Value::Object(spec)], &ctx)
            .await
            .unwrap();
        let result = result.as_object().unwrap();
        assert_eq!(result.class.name(), WORK_RESULT_CLASS);
        assert_eq!(result.field("warnings"), Some(&Value::Int(1)));
        assert_eq!(result.field("exit_code"), Some(&Value::Int(0)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_compiler_is_a_user_failure() {
        let ctx = ctx();
        let spec = Object::new(ctx.load_class(COMPILE_SPEC_CLASS).unwrap())
            .with_field("program", "sh")
            .with_field("args", Value::List(vec!["-c".into(), "echo 'error: bad'; exit 2".into()]));
        match CommandCompiler.invoke("compile", &[], vec![Value::Object(spec)], &ctx).await {
            Err(InvocationError::Failed(err)) => {
                assert_eq!(err.class_name(), RUNTIME_ERROR_CLASS);
                assert!(err.message.contains("exit code 2; 1 error(s)"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
