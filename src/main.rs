//! snmptun - shared SNMP-over-SSH tunnel service
//!
//! Runs the lease manager behind an HTTP API and offers a few helpers for
//! inspecting and changing the tunnel port configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use snmptun_api::{ApiServer, ApiServerConfig};
use snmptun_config::{ConfigStore, SnmptunConfig};
use snmptun_lease::{
    MemoryProxyController, PortPool, ProxyController, Target, TunnelManager, TunnelService,
};
use snmptun_proxy::ProcessProxyController;

/// Keeps a `hold` lease from lapsing right before it is released
const HOLD_TTL_SLACK: Duration = Duration::from_secs(30);

/// snmptun - lease a shared SNMP-over-SSH tunnel
#[derive(Parser, Debug)]
#[command(name = "snmptun")]
#[command(about = "Lease a shared SNMP-over-SSH tunnel to network devices")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Config file (default: ~/.snmptun/config.json)
    #[arg(long, global = true, env = "SNMPTUN_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the lease manager and its HTTP API
    Serve {
        /// Address for the HTTP API
        #[arg(long, env = "SNMPTUN_API_ADDR", default_value = "127.0.0.1:8080")]
        api_addr: SocketAddr,

        /// Bind plain UDP sockets instead of launching the forwarder
        #[arg(long)]
        dry_run: bool,

        /// Disable CORS for local web frontends
        #[arg(long)]
        no_cors: bool,
    },

    /// Inspect or change the tunnel port list
    Ports {
        #[command(subcommand)]
        command: PortsCommands,
    },

    /// Hold the tunnel for one device and print its local address
    Hold {
        /// Device IP address
        #[arg(long)]
        device_ip: String,

        /// SSH username on the device
        #[arg(long)]
        username: String,

        /// SSH password on the device
        #[arg(long, env = "SNMPTUN_DEVICE_PASSWORD", hide_env_values = true)]
        password: String,

        /// How long to hold the tunnel, in seconds
        #[arg(long, default_value = "60")]
        duration: u64,

        /// Owner id for the lease
        #[arg(long, default_value = "hold")]
        owner: String,

        /// Bind plain UDP sockets instead of launching the forwarder
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PortsCommands {
    /// Show the effective port list and which ports are free
    Show,

    /// Persist a new port list (comma-separated)
    Set {
        /// Ports, e.g. "1161,21161,31161"
        ports: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn config_store(path: Option<PathBuf>) -> Result<ConfigStore> {
    match path {
        Some(path) => Ok(ConfigStore::new(path)),
        None => ConfigStore::from_env().context("Failed to locate config file"),
    }
}

fn build_controller(config: &SnmptunConfig, dry_run: bool) -> Arc<dyn ProxyController> {
    if dry_run {
        warn!("Dry run: binding plain UDP sockets instead of launching the forwarder");
        Arc::new(MemoryProxyController::new())
    } else {
        Arc::new(ProcessProxyController::new(config.forwarder.clone()))
    }
}

fn build_manager(store: &ConfigStore, dry_run: bool) -> Result<TunnelManager> {
    let config = store
        .load()
        .context(format!("Failed to load config: {:?}", store.path()))?;
    let manager_config = store
        .tunnel_manager_config(&config)
        .context("Invalid tunnel manager configuration")?;

    let controller = build_controller(&config, dry_run);
    TunnelManager::new(controller, manager_config).context("Failed to create tunnel manager")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn serve(store: ConfigStore, api_addr: SocketAddr, dry_run: bool, cors: bool) -> Result<()> {
    let manager = build_manager(&store, dry_run)?;
    let service = Arc::new(TunnelService::new(manager.clone()));

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: api_addr,
            enable_cors: cors,
        },
        service,
    );

    let result = server.start(shutdown_signal()).await;

    manager.shutdown().await;
    result.context("API server failed")
}

fn show_ports(store: &ConfigStore) -> Result<()> {
    let config = store
        .load()
        .context(format!("Failed to load config: {:?}", store.path()))?;
    let host = config.listen_host()?;
    let ports = store.tunnel_ports()?;

    println!("Config: {}", store.path().display());
    println!("Listen host: {}", host);
    for port in ports {
        let state = if PortPool::is_port_available(host, port) {
            "free"
        } else {
            "in use"
        };
        println!("  {:>5}  {}", port, state);
    }
    Ok(())
}

async fn hold(
    store: ConfigStore,
    target: Target,
    owner: String,
    duration: Duration,
    dry_run: bool,
) -> Result<()> {
    let manager = build_manager(&store, dry_run)?;
    let description = target.describe();

    let result = manager
        .with_lease(
            &owner,
            "utility",
            target,
            Some(duration + HOLD_TTL_SLACK),
            |lease| async move {
                println!("{}", lease.addr());
                info!("Holding tunnel to {} for {:?}", description, duration);

                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = shutdown_signal() => {}
                }
                Ok::<_, anyhow::Error>(())
            },
        )
        .await;

    manager.shutdown().await;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let store = config_store(cli.config)?;

    match cli.command {
        Commands::Serve {
            api_addr,
            dry_run,
            no_cors,
        } => serve(store, api_addr, dry_run, !no_cors).await,
        Commands::Ports { command } => match command {
            PortsCommands::Show => show_ports(&store),
            PortsCommands::Set { ports } => {
                let ports = store
                    .set_tunnel_ports(&ports)
                    .context("Failed to update tunnel ports")?;
                println!("Tunnel ports set to {:?}", ports);
                Ok(())
            }
        },
        Commands::Hold {
            device_ip,
            username,
            password,
            duration,
            owner,
            dry_run,
        } => {
            let target = Target::new(device_ip, username, password);
            hold(store, target, owner, Duration::from_secs(duration), dry_run).await
        }
    }
}
