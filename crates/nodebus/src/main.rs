#![warn(missing_docs)]

//! `nodebus` node binary.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use nodebus::logship::RemoteLogSink;
use nodebus::{Bus, NodeConfig, PluginRegistry};
use nodebus_transport::tcp::TcpTransportConfig;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const REMOTE_LOG_QUEUE: usize = 4096;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "nodebus", version, about = "NodeBus coordination bus node")]
struct Args {
    /// Path to the node configuration (.toml or .json)
    #[arg(short, long, env = "NODEBUS_CONFIG")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat, remote_log: Option<&str>) -> Option<JoinHandle<()>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (text, json) = match format {
        LogFormat::Text => (Some(fmt::layer()), None),
        LogFormat::Json => (None, Some(fmt::layer().json())),
    };
    let (remote, shipper) = match remote_log {
        Some(addr) => {
            let (sink, task) =
                RemoteLogSink::spawn(addr.to_string(), REMOTE_LOG_QUEUE, TcpTransportConfig::default());
            (Some(fmt::layer().with_ansi(false).with_writer(sink)), Some(task))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .with(remote)
        .init();
    shipper
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = NodeConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config
        .validate()
        .with_context(|| format!("validating {}", args.config.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.bus.io_threads)
        .thread_name("nodebus-io")
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run(args.log_format, config))
}

async fn run(log_format: LogFormat, config: NodeConfig) -> Result<()> {
    let shipper = init_tracing(log_format, config.remote_log.as_deref());

    tracing::info!(
        node = config.node_id,
        io_threads = config.bus.io_threads,
        "NodeBus node starting..."
    );

    let registry = PluginRegistry::with_builtins();
    let bus = Bus::start(config, &registry)
        .await
        .context("starting node")?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    bus.shutdown().await;

    if let Some(shipper) = shipper {
        shipper.abort();
    }
    Ok(())
}
