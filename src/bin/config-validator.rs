//! # Tasker RPC Configuration Validator
//!
//! Command-line tool for validating coordinator configuration across environments,
//! and optionally probing the configured broker before a deployment.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tasker_rpc::broker::{BrokerConnection, ConnectionState, ReconnectPolicy, Topology};
use tasker_rpc::config::{mask_url_credentials, ConfigManager, CoordinatorConfig, ReplyConfig};
use tasker_rpc::messaging::RabbitMqConnector;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate Tasker RPC coordinator configuration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format (table, json)
    #[arg(long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate every configuration section
    All,

    /// Validate one section (broker, reconnect, calls, io_loop, health, destinations)
    Component { name: String },

    /// List environments that have an override file
    Environments,

    /// Connect to the configured broker and declare the queue topology
    Probe,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) | None => validate_all_config(&cli),
        Some(Commands::Component { name }) => validate_component(&cli, name),
        Some(Commands::Environments) => list_environments(&cli),
        Some(Commands::Probe) => probe_broker(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {:#}", e);
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> anyhow::Result<Arc<ConfigManager>> {
    ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), &cli.environment)
        .with_context(|| format!("loading configuration for environment '{}'", cli.environment))
}

fn validate_all_config(cli: &Cli) -> anyhow::Result<()> {
    let manager = load(cli)?;

    if cli.format == "json" {
        println!("{}", serde_json::to_string_pretty(&manager.debug_config())?);
        return Ok(());
    }

    println!("🔧 Validating Tasker RPC Configuration");
    println!("Environment: {}", manager.environment());
    println!("Config Directory: {}", manager.config_directory().display());
    println!();

    let config = manager.config();
    for section in ["broker", "reconnect", "calls", "io_loop", "health", "destinations"] {
        print_section(config, section)?;
    }

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn validate_component(cli: &Cli, name: &str) -> anyhow::Result<()> {
    let manager = load(cli)?;
    print_section(manager.config(), &name.to_lowercase().replace('-', "_"))?;
    println!("✅ Component '{name}' validation passed!");
    Ok(())
}

fn print_section(config: &CoordinatorConfig, section: &str) -> anyhow::Result<()> {
    match section {
        "broker" => {
            println!("🐇 Broker");
            println!("   ✅ URL: {}", mask_url_credentials(&config.broker.url));
            println!("   ✅ Connection name: {}", config.broker.connection_name);
            println!(
                "   ✅ Heartbeat: {}s, prefetch: {}, connect timeout: {}s",
                config.broker.heartbeat_seconds,
                config.broker.prefetch_count,
                config.broker.connection_timeout_seconds
            );
        }
        "reconnect" => {
            println!("🔄 Reconnect");
            println!(
                "   ✅ {} attempts, {:?} backoff from {}ms (max {}ms), IO error pause {}ms",
                config.reconnect.max_attempts,
                config.reconnect.strategy,
                config.reconnect.base_delay_ms,
                config.reconnect.max_delay_ms,
                config.reconnect.io_error_pause_ms
            );
        }
        "calls" => {
            println!("📞 Calls");
            println!(
                "   ✅ Default timeout {}s, max {}s, fail fast when disconnected: {}",
                config.calls.default_timeout_seconds,
                config.calls.max_timeout_seconds,
                config.calls.fail_fast_when_disconnected
            );
        }
        "io_loop" => {
            println!("🔁 IO loop");
            println!(
                "   ✅ Inbound slice {}ms, idle sleep {}ms, {} deliveries/tick, job queue {}",
                config.io_loop.inbound_slice_ms,
                config.io_loop.idle_sleep_ms,
                config.io_loop.max_deliveries_per_tick,
                config.io_loop.job_queue_capacity
            );
        }
        "health" => {
            println!("💓 Health");
            println!(
                "   ✅ Every {}s, stale after {}s, pending grace {}s",
                config.health.interval_seconds,
                config.health.stale_after_seconds,
                config.health.pending_grace_seconds
            );
        }
        "destinations" => {
            println!("📬 Destinations");
            let mut names: Vec<_> = config.destinations.keys().collect();
            names.sort();
            for name in names {
                let Some(destination) = config.destination(name) else {
                    continue;
                };
                let reply = match &destination.reply {
                    ReplyConfig::SharedQueue { queue } => format!("shared queue '{queue}'"),
                    ReplyConfig::CallbackQueue { expires_ms } => match expires_ms {
                        Some(ms) => format!("callback queue (expires {ms}ms)"),
                        None => "callback queue".to_string(),
                    },
                };
                println!(
                    "   ✅ {name}: '{}' -> {reply}, timeout {}",
                    destination.request_queue,
                    destination
                        .default_timeout_seconds
                        .map(|s| format!("{s}s"))
                        .unwrap_or_else(|| "default".to_string())
                );
            }
        }
        other => bail!("Unknown component: {other}"),
    }
    Ok(())
}

fn list_environments(cli: &Cli) -> anyhow::Result<()> {
    let dir = cli.config_dir.clone().unwrap_or_else(|| PathBuf::from("config"));
    println!("📋 Environments with overrides in {}:", dir.display());

    if !dir.exists() {
        println!("   ❌ Configuration directory not found");
        return Ok(());
    }

    let mut environments: Vec<String> = std::fs::read_dir(&dir)?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.strip_prefix("coordinator.")
                .and_then(|rest| rest.strip_suffix(".toml"))
                .map(str::to_string)
        })
        .collect();
    environments.sort();

    if environments.is_empty() {
        println!("   (none; only base configuration)");
    }
    for environment in environments {
        println!("  • {environment}");
    }
    Ok(())
}

fn probe_broker(cli: &Cli) -> anyhow::Result<()> {
    let manager = load(cli)?;
    let config = manager.config().clone();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(async move {
        println!("🐇 Probing {}", mask_url_credentials(&config.broker.url));
        let mut connection = BrokerConnection::new(
            Arc::new(RabbitMqConnector::new(config.broker.clone())),
            Arc::new(Topology::from_config(&config)),
            ReconnectPolicy::from(&config.reconnect),
            Arc::new(ConnectionState::new()),
        );
        connection.connect().await.context("connecting to broker")?;
        println!("   ✅ Connected; topology declared");
        if let Some(queue) = connection.callback_queue() {
            println!("   ✅ Callback queue: {queue}");
        }
        connection.close().await;
        Ok(())
    })
}
