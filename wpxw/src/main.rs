use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use wpx_core::protocol::LogLevel;
use wpxw::bootstrap::{read_config, read_config_file, run_worker, WorkerOptions};
use wpxw::builtin::builtin_implementations;
use wpxw::logging::{ForwardingLayer, LogForwarder};

#[derive(Parser)]
#[command(name = "wpxw", about = "wpx worker process")]
struct Cli {
    /// Read the bootstrap header from this file instead of stdin.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Classpath entry for the worker's system loader (repeatable).
    #[arg(long)]
    classpath: Vec<String>,

    /// Package shared with the coordinator (repeatable).
    #[arg(long = "shared-package")]
    shared_packages: Vec<String>,

    /// Extra arguments passed through from the fork options.
    #[arg(last = true)]
    process_args: Vec<String>,
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config_file {
        Some(path) => read_config_file(path).await?,
        None => read_config(&mut tokio::io::stdin()).await?,
    };

    // stderr is captured by the coordinator; forwarded events carry the rest.
    let forwarder = Arc::new(LogForwarder::new());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
                ),
        )
        .with(ForwardingLayer::new(Arc::clone(&forwarder)).with_filter(level_filter(config.log_level)))
        .init();

    let options = WorkerOptions {
        classpath: cli.classpath,
        shared_packages: cli.shared_packages,
        process_args: cli.process_args,
    };
    run_worker(config, options, builtin_implementations(), forwarder).await
}
