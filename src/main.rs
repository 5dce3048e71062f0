//! EdgeMQ - publish matching and fan-out core
//!
//! Usage:
//!   edgemq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>         Configuration file path
//!   -s, --scenario <FILE>       Replay a scenario file and print the result
//!   --metrics-bind <ADDR>       Serve Prometheus metrics on this address
//!   -l, --log-level             Log level (error, warn, info, debug, trace)
//!   -h, --help                  Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use edgemq::broker::{Broker, BrokerConfig, DispatchContext};
use edgemq::config::Config;
use edgemq::hooks::LoggingSink;
use edgemq::persistence::MemoryRetainedStore;
use edgemq::scenario::{Scenario, ScenarioRunner};
use edgemq::session::LocalSessionRegistry;
use edgemq::{Metrics, MetricsServer};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }

    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// EdgeMQ - publish matching and fan-out core
#[derive(Parser, Debug)]
#[command(name = "edgemq")]
#[command(author = "EdgeMQ Contributors")]
#[command(version)]
#[command(about = "Publish matching and fan-out core for MQTT brokers")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scenario file to replay (TOML format)
    #[arg(short, long)]
    scenario: Option<PathBuf>,

    /// Serve Prometheus metrics on this address (enables metrics)
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (warn)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let metrics_bind = args
        .metrics_bind
        .or(config.metrics.enabled.then_some(config.metrics.bind));
    let metrics = metrics_bind.map(|_| Arc::new(Metrics::new()));

    let sessions = Arc::new(LocalSessionRegistry::new(config.limits.max_queued_messages));
    let sink = match &metrics {
        Some(m) => LoggingSink::with_metrics(m.clone()),
        None => LoggingSink::new(),
    };
    let mut broker = Broker::new(
        BrokerConfig::from(&config),
        sessions.clone(),
        Arc::new(MemoryRetainedStore::new()),
        Arc::new(sink),
    );

    info!("Starting EdgeMQ");
    info!("  Shared strategy: {:?}", broker.config().shared_strategy);
    info!("  Delivery timeout: {:?}", broker.config().delivery_timeout);
    info!("  Retain: {}", broker.config().retain_available);

    let mut metrics_task = None;
    if let (Some(addr), Some(metrics)) = (metrics_bind, &metrics) {
        broker = broker.with_metrics(metrics.clone());
        let server = MetricsServer::bind(metrics.clone(), addr).await?;
        info!("  Metrics: enabled (http://{}/metrics)", server.local_addr()?);
        metrics_task = Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }));
    } else {
        info!("  Metrics: disabled");
    }

    let broker = Arc::new(broker);
    let ctx = DispatchContext::current().with_source("scenario");

    match (&args.scenario, metrics_task) {
        (Some(path), _) => {
            let scenario = Scenario::load(path)?;
            let runner = ScenarioRunner::new(
                broker,
                sessions,
                config.limits.outbound_channel_capacity,
            );
            let report = runner.run(&scenario, &ctx).await?;
            print!("{}", report);
        }
        (None, Some(task)) => {
            info!("No scenario given, serving metrics until Ctrl+C");
            tokio::signal::ctrl_c().await?;
            task.abort();
        }
        (None, None) => {
            eprintln!("Nothing to do: pass --scenario or enable metrics");
            std::process::exit(2);
        }
    }

    Ok(())
}
