use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use wpx_core::fork_options::DaemonForkOptions;
use wpx_core::request::{BuildOperationRef, Request};
use wpx_core::value::Value;
use wpxd::config::{load_config, CoordinatorConfig};
use wpxd::manager::{DaemonManager, WorkerDaemonStarter};

#[derive(Parser)]
#[command(name = "wpxd", about = "wpx worker coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one request on a worker and print the result as JSON.
    Run {
        /// Path to configuration file. Defaults are used when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Worker implementation to run.
        #[arg(short, long)]
        implementation: String,

        #[arg(short, long)]
        method: String,

        /// Argument, parsed as JSON when possible, else taken as a string.
        #[arg(short, long = "arg")]
        args: Vec<String>,

        /// Classpath entry required by the work.
        #[arg(long)]
        classpath: Vec<String>,

        #[arg(long)]
        min_heap: Option<String>,

        #[arg(long)]
        max_heap: Option<String>,
    },

    /// Validate a configuration file.
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw)
        .map(Value::from_json)
        .unwrap_or_else(|_| Value::Str(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Check { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()
                .with_context(|| format!("invalid config {}", config.display()))?;
            println!("{}: ok", config.display());
            Ok(())
        }
        Command::Run {
            config,
            implementation,
            method,
            args,
            classpath,
            min_heap,
            max_heap,
        } => {
            let cfg = match config {
                Some(path) => load_config(&path)?,
                None => CoordinatorConfig::default(),
            };
            cfg.validate()?;
            init_tracing(cfg.log_level.as_str());

            let fork_options = DaemonForkOptions::new()
                .with_heap(min_heap.as_deref(), max_heap.as_deref())?
                .with_classpath(classpath);
            let mut builder = Request::builder(method).build_operation(BuildOperationRef::new(1));
            for arg in &args {
                builder = builder.arg(parse_arg(arg));
            }
            let request = builder.build()?;

            let working_dir = cfg.working_dir()?;
            let manager = DaemonManager::new(Arc::new(WorkerDaemonStarter::new(cfg)), working_dir);
            info!(implementation = %implementation, "dispatching request");
            let result = manager.execute(&implementation, &fork_options, request).await;
            let stopped = manager.stop().await;

            let value = result?;
            stopped?;
            println!("{}", serde_json::to_string_pretty(&value.to_json())?);
            Ok(())
        }
    }
}
