// ABOUTME: CLI entry point for data-router
// ABOUTME: Parses commands and runs routing passes, the routing daemon and inspection commands

use anyhow::{bail, Context, Result};
use change_log::{ChangeLog, GapStore, Node, NodeStore};
use clap::{Parser, Subcommand};
use data_router::config::RoutingConfig;
use data_router::routers::{LoggingConfigurationListener, RouterRegistry};
use data_router::routing::{DaemonConfig, LocalChannelLock, RoutingDaemon, RoutingService};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const STARTER_CONFIG: &str = r#"[identity]
node_id = "000"
node_group_id = "corp"

[settings]
max_gaps_in_query = 100
max_gap_size = 50000000
max_rows_per_pass = 100000
stale_gap_timeout_secs = 1200
poll_interval_secs = 10

[[channel]]
channel_id = "default"
batch_algorithm = "default"
max_batch_size = 1000

[[group_link]]
source_node_group_id = "corp"
target_node_group_id = "store"
"#;

#[derive(Debug, Parser)]
#[command(name = "data-router")]
#[command(about = "Routes captured database changes to target nodes as outgoing batches", long_about = None)]
#[command(version)]
struct Cli {
    /// Routing database holding the change log, gaps, batches and node registry.
    #[arg(long = "db", value_name = "PATH", env = "DATA_ROUTER_DB", global = true)]
    db_path: Option<PathBuf>,

    /// Routing configuration (defaults to ~/.data-router/routing.toml).
    #[arg(long = "config", value_name = "PATH", env = "DATA_ROUTER_CONFIG", global = true)]
    config_path: Option<PathBuf>,

    /// Tracing filter (info,warn,debug,trace). Can also be provided via DATA_ROUTER_LOG.
    #[arg(
        long = "log-level",
        value_name = "FILTER",
        default_value = "info",
        env = "DATA_ROUTER_LOG",
        global = true
    )]
    log_filter: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a starter configuration and create the routing database
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },
    /// Run one routing pass over every channel, or only the given one
    Route {
        #[arg(long)]
        channel: Option<String>,
    },
    /// Route continuously until Ctrl+C
    Daemon {
        /// Channels to route (comma-separated, default: every enabled channel)
        #[arg(long, value_delimiter = ',')]
        channels: Vec<String>,
        /// Override the configured poll interval
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Show the data gaps still waiting to be routed
    Gaps {
        #[arg(long)]
        channel: Option<String>,
    },
    /// Add or update a node in the node registry
    RegisterNode {
        #[arg(long)]
        node_id: String,
        #[arg(long)]
        group: String,
        #[arg(long)]
        external_id: Option<String>,
        /// Node that registered this one
        #[arg(long)]
        created_at: Option<String>,
        #[arg(long, default_value_t = 2)]
        protocol_version: u32,
        #[arg(long)]
        disabled: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_filter)?;

    let config_path = match cli.config_path.clone() {
        Some(path) => path,
        None => RoutingConfig::default_path()?,
    };
    let db_path = match cli.db_path.clone() {
        Some(path) => path,
        None => RoutingConfig::default_db_path()?,
    };

    match cli.command {
        Commands::Init { force } => init(&config_path, &db_path, force),
        Commands::Route { channel } => route(&config_path, &db_path, channel.as_deref()),
        Commands::Daemon {
            channels,
            interval_secs,
        } => daemon(&config_path, &db_path, channels, interval_secs).await,
        Commands::Gaps { channel } => gaps(&config_path, &db_path, channel.as_deref()),
        Commands::RegisterNode {
            node_id,
            group,
            external_id,
            created_at,
            protocol_version,
            disabled,
        } => {
            let mut node = Node::new(&node_id, &group).with_protocol_version(protocol_version);
            if let Some(external_id) = external_id {
                node = node.with_external_id(&external_id);
            }
            if let Some(created_at) = created_at {
                node = node.created_at(&created_at);
            }
            if disabled {
                node = node.disabled();
            }
            let log = ChangeLog::open(&db_path)?;
            NodeStore::new(log.connection()).upsert(&node)?;
            println!("Registered node {} in group {}", node.node_id, node.node_group_id);
            Ok(())
        }
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(filter).or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))
}

fn load_service(config_path: &Path) -> Result<RoutingService> {
    let config = RoutingConfig::load(config_path)?;
    tracing::info!(
        node = %config.identity.node_id,
        fingerprint = %config.fingerprint(),
        "Loaded routing config from {:?}",
        config_path
    );
    let registry = RouterRegistry::with_builtin(Arc::new(LoggingConfigurationListener));
    RoutingService::new(Arc::new(config), Arc::new(registry))
}

fn init(config_path: &Path, db_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "Config file {:?} already exists. Use --force to overwrite it.",
            config_path
        );
    }
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory {:?}", parent))?;
    }
    std::fs::write(config_path, STARTER_CONFIG)
        .with_context(|| format!("Failed to write config to {:?}", config_path))?;

    let config = RoutingConfig::from_toml_str(STARTER_CONFIG)?;
    let log = ChangeLog::open(db_path)?;
    NodeStore::new(log.connection()).upsert(&Node::new(
        &config.identity.node_id,
        &config.identity.node_group_id,
    ))?;

    println!("Wrote starter config to {}", config_path.display());
    println!("Routing database ready at {}", log.path().display());
    Ok(())
}

fn route(config_path: &Path, db_path: &Path, channel: Option<&str>) -> Result<()> {
    let service = load_service(config_path)?;
    let mut log = ChangeLog::open(db_path)?;
    let cancel = AtomicBool::new(false);

    let stats = match channel {
        Some(channel_id) => data_router::routing::RoutingStats {
            channels: vec![service.route_channel(&mut log, channel_id, &cancel)?],
            ..Default::default()
        },
        None => service.route_all(&mut log, &cancel),
    };

    println!();
    println!("========================================");
    println!("Routing pass complete");
    println!("========================================");
    for channel in &stats.channels {
        println!(
            "  {}: {} rows ({} unrouted), {} batches",
            channel.channel_id,
            channel.rows_read,
            channel.rows_unrouted,
            channel.batch_ids.len()
        );
    }
    if !stats.is_success() {
        println!("  Errors: {}", stats.errors.len());
        for err in &stats.errors {
            println!("    - {}", err);
        }
        bail!("{} channel(s) failed to route", stats.errors.len());
    }
    Ok(())
}

async fn daemon(
    config_path: &Path,
    db_path: &Path,
    channels: Vec<String>,
    interval_secs: Option<u64>,
) -> Result<()> {
    let service = load_service(config_path)?;
    let config = DaemonConfig {
        poll_interval: interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| service.config().settings.poll_interval()),
        db_path: db_path.to_path_buf(),
        channels,
    };
    // Create the schema before passes open their own connections.
    ChangeLog::open(db_path)?;

    let daemon = RoutingDaemon::new(Arc::new(service), Arc::new(LocalChannelLock::default()), config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    tracing::info!("Press Ctrl+C to stop");
    daemon.run(shutdown_rx).await
}

fn gaps(config_path: &Path, db_path: &Path, channel: Option<&str>) -> Result<()> {
    let config = RoutingConfig::load(config_path)?;
    let log = ChangeLog::open(db_path)?;
    let store = GapStore::new(log.connection());

    let channels: Vec<&str> = match channel {
        Some(channel_id) => vec![channel_id],
        None => config
            .channels
            .iter()
            .map(|c| c.channel_id.as_str())
            .collect(),
    };
    for channel_id in channels {
        let gaps = store.list(channel_id)?;
        println!("{} ({} gaps)", channel_id, gaps.len());
        for gap in gaps {
            let pending = log
                .fetch_range(gap.start_id, gap.end_id)?
                .iter()
                .filter(|row| row.channel_id == channel_id)
                .count();
            println!(
                "  {:>12} - {:<12} since {}  {} pending",
                gap.start_id,
                gap.end_id,
                gap.create_time.format("%Y-%m-%d %H:%M:%S"),
                pending
            );
        }
    }
    Ok(())
}
