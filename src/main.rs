//! PCForward - filtering people-counter event forwarder
//!
//! Usage:
//!   pcforward [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path
//!   --srcsrv <ADDR>          Source node server
//!   --dstsrv <ADDR>          Destination node server
//!   --counter <RE>           Device filter for counter events
//!   --fillLevel <RE>         Device filter for fillLevel events
//!   --dwellTime <RE>         Device filter for dwellTime events
//!   --local <ADDR>           Source data server override
//!   -l, --log-level          Log level (error, warn, info, debug, trace)
//!   -h, --help               Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use futures_util::future::join_all;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use pcforward::client::{MqttConnector, MqttNodeRegistry};
use pcforward::config::Config;
use pcforward::forward::{Forwarder, ForwarderParts, SharedLink};
use pcforward::remote::{NodeRegistry, RemoteConnector};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
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

/// PCForward - filtering people-counter event forwarder
#[derive(Parser, Debug)]
#[command(name = "pcforward")]
#[command(author = "PCForward Contributors")]
#[command(version)]
#[command(about = "Forward filtered people-counter events between two MQTT brokers")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source node server address
    #[arg(long)]
    srcsrv: Option<String>,

    /// Destination node server address
    #[arg(long)]
    dstsrv: Option<String>,

    /// Device filter for counter events
    #[arg(long)]
    counter: Option<String>,

    /// Device filter for fillLevel events
    #[arg(long = "fillLevel")]
    fill_level: Option<String>,

    /// Device filter for dwellTime events
    #[arg(long = "dwellTime")]
    dwell_time: Option<String>,

    /// Source data server to use instead of the registered one
    #[arg(long)]
    local: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI args override file config
    fn apply(&self, config: &mut Config) {
        if let Some(server) = &self.srcsrv {
            config.source.server = server.clone();
        }
        if let Some(server) = &self.dstsrv {
            config.destination.server = server.clone();
        }
        if let Some(pattern) = &self.counter {
            config.filter.counter = Some(pattern.clone());
        }
        if let Some(pattern) = &self.fill_level {
            config.filter.fill_level = Some(pattern.clone());
        }
        if let Some(pattern) = &self.dwell_time {
            config.filter.dwell_time = Some(pattern.clone());
        }
        if let Some(local) = &self.local {
            config.forward.local = Some(local.clone());
        }
    }
}

fn fatal(msg: impl std::fmt::Display) -> ! {
    error!("{}", msg);
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus environment
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    args.apply(&mut config);

    // Checked before any registration attempt
    if let Err(e) = config.validate() {
        fatal(e);
    }
    let filters = match config.filter.compile() {
        Ok(filters) => Arc::new(filters),
        Err(e) => fatal(e),
    };

    info!("Starting PCForward {}", env!("CARGO_PKG_VERSION"));
    info!(
        "  Source: {} as '{}' (topic {}, qos {})",
        config.source.server,
        config.source.node_name,
        config.source.topic,
        config.source.qos()
    );
    info!(
        "  Destination: {} as '{}' (topic {}, qos {})",
        config.destination.server,
        config.destination.node_name,
        config.destination.topic,
        config.destination.qos()
    );
    let mut any_filter = false;
    for (category, pattern) in filters.enabled() {
        info!("  Filter {}: {}", category, pattern);
        any_filter = true;
    }
    if !any_filter {
        warn!("  No category filter configured, every record will be forwarded empty");
    }

    // Register on both sides
    let source_registry = Arc::new(MqttNodeRegistry::new(config.source_registry()));
    let source_address = match source_registry.register().await {
        Ok(address) => address,
        Err(e) => fatal(e),
    };
    let destination_registry = Arc::new(MqttNodeRegistry::new(config.destination_registry()));
    let destination_address = match destination_registry.register().await {
        Ok(address) => address,
        Err(e) => fatal(e),
    };

    // Data links
    let source_connector = Arc::new(MqttConnector::new(
        config.source.client_options("sub"),
        config.source.topic.clone(),
        config.source.qos(),
    ));
    let source = match source_connector.connect(&source_address).await {
        Ok(link) => {
            info!("Connected to source data server {}", source_address);
            SharedLink::new(link)
        }
        Err(e) => {
            // The subscription loop keeps retrying
            warn!("Source data server {} unavailable: {}", source_address, e);
            SharedLink::empty()
        }
    };

    let destination_connector = Arc::new(MqttConnector::new(
        config.destination.client_options("pub"),
        config.destination.topic.clone(),
        config.destination.qos(),
    ));
    let destination = match destination_connector.connect(&destination_address).await {
        Ok(link) => {
            info!("Connected to destination data server {}", destination_address);
            link
        }
        Err(e) => fatal(format!(
            "can't connect to destination data server {}: {}",
            destination_address, e
        )),
    };

    let forwarder = Forwarder::start(
        ForwarderParts {
            source: source.clone(),
            source_address,
            source_connector,
            destination,
            destination_address,
            destination_connector,
            filters,
            source_registry: source_registry.clone(),
            destination_registry: destination_registry.clone(),
        },
        config.forward.settings(),
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    let destination = forwarder.destination().clone();
    forwarder.shutdown().await;

    // Cleanup list
    let registries: [Arc<dyn NodeRegistry>; 2] = [source_registry, destination_registry];
    let results = join_all(registries.iter().map(|r| r.unregister())).await;
    for (registry, result) in registries.iter().zip(results) {
        if let Err(e) = result {
            warn!("Failed to unregister '{}': {}", registry.node_name(), e);
        }
    }
    if let Some(link) = source.take().await {
        link.close().await;
    }
    if let Some(link) = destination.take().await {
        link.close().await;
    }

    Ok(())
}
