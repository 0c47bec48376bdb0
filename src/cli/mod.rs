use std::{collections::HashMap, io, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser};
use ethers::{providers::Middleware, utils::to_checksum};
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod prometheus_exporter;

use crate::{
    builder::{BundleSender, BundlerControl, BundlerTask, KeyPool, Settings},
    common::{
        config::{self, GundlerConfig, Mode},
        eth,
        handle::{spawn_tasks_with_shutdown, Task},
        simulation::GasEstimateSimulator,
    },
    op_pool::UoPool,
    rpc::{self, ApiNamespace, RpcTask},
};

/// Main entry point for the CLI
///
/// Parses the CLI arguments, loads the configuration, wires the mempools,
/// bundle senders and RPC server together and runs them until a ctrl-c
/// signal arrives.
pub async fn run() -> anyhow::Result<()> {
    let opt = Cli::parse();

    let (appender, _guard) = if let Some(log_file) = &opt.logs.file {
        tracing_appender::non_blocking(tracing_appender::rolling::never(".", log_file))
    } else {
        tracing_appender::non_blocking(io::stdout())
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(opt.logs.level.parse::<Level>()?)
        .with_writer(appender)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = GundlerConfig::load(&opt.config)?;
    info!("Loaded configuration: {config:#?}");

    let metrics_addr = format!("{}:{}", opt.metrics.host, opt.metrics.port)
        .parse()
        .context("should parse metrics listen address")?;
    prometheus_exporter::initialize(metrics_addr)?;

    let private_keys = config::private_keys_from_env()?;

    let provider = eth::new_provider(&config.ethereum_rpc)?;
    let chain_id = provider
        .get_chainid()
        .await
        .context("should fetch chain id from node")?
        .as_u64();
    info!("Connected to chain {chain_id}");

    let key_pool = Arc::new(KeyPool::new(&private_keys, provider.clone(), chain_id)?);

    let mut mempools = HashMap::new();
    let mut entry_points = Vec::new();
    let mut bundlers: Vec<Arc<dyn BundlerControl>> = Vec::new();
    let mut tasks: Vec<Box<dyn Task>> = Vec::new();
    for version in &config.entry_points {
        let mempool = Arc::new(UoPool::new(*version, chain_id));
        let simulator = GasEstimateSimulator::new(provider.clone(), config.beneficiary);
        let sender = Arc::new(BundleSender::new(
            config.beneficiary,
            mempool.clone(),
            key_pool.clone(),
            simulator,
            Settings {
                interval: Duration::from_secs(1),
                max_bundle_size: config.max_bundle_size,
            },
        ));
        bundlers.push(sender.clone());
        tasks.push(Box::new(BundlerTask::new(sender)));
        entry_points.push(mempool.entry_point());
        mempools.insert(mempool.entry_point(), mempool);
        info!(
            "Initialized mempool and bundle sender for entry point {}",
            to_checksum(&version.address(), None)
        );
    }

    let api_namespaces = match config.mode {
        Mode::Debug => vec![ApiNamespace::Eth, ApiNamespace::Debug],
        Mode::Dev | Mode::Prod => vec![ApiNamespace::Eth],
    };
    if config.mode == Mode::Debug {
        info!("Debug RPC methods enabled: debug_mempools, debug_pause, debug_clear");
    }

    tasks.push(
        RpcTask::new(
            rpc::Args {
                host: "127.0.0.1".to_owned(),
                port: config.port,
                chain_id,
                entry_points,
                api_namespaces,
                rpc_timeout: Duration::from_secs(20),
                max_connections: 100,
            },
            Arc::new(mempools),
            bundlers,
        )
        .boxed(),
    );

    info!("Gundler startup complete");
    spawn_tasks_with_shutdown(tasks, signal::ctrl_c()).await;
    info!("All components shut down, goodbye");

    Ok(())
}

/// CLI options
#[derive(Debug, Parser)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(
        long = "config",
        name = "config",
        env = "GUNDLER_CONFIG",
        default_value = "./config.json"
    )]
    config: PathBuf,

    #[clap(flatten)]
    metrics: Metrics,

    #[clap(flatten)]
    logs: Logs,
}

/// CLI options for the metrics server
#[derive(Debug, ClapArgs)]
#[command(next_help_heading = "Metrics")]
struct Metrics {
    /// Port to listen on for metrics requests
    #[arg(
        long = "metrics.port",
        name = "metrics.port",
        env = "METRICS_PORT",
        default_value = "8080"
    )]
    port: u16,

    /// Host to listen on for metrics requests
    #[arg(
        long = "metrics.host",
        name = "metrics.host",
        env = "METRICS_HOST",
        default_value = "0.0.0.0"
    )]
    host: String,
}

/// CLI options for logging
#[derive(Debug, ClapArgs)]
#[command(next_help_heading = "Logging")]
struct Logs {
    /// Log level
    ///
    /// Valid values are: trace, debug, info, warn, error
    #[arg(
        long = "log.level",
        name = "log.level",
        env = "LOG_LEVEL",
        default_value = "info"
    )]
    level: String,

    /// Log file
    ///
    /// If not provided, logs will be written to stdout
    #[arg(
        long = "log.file",
        name = "log.file",
        env = "LOG_FILE",
        default_value = None
    )]
    file: Option<String>,
}
