//! Homepool daemon
//!
//! Wires the device prober, pool backend, config store, and lifecycle
//! manager together and serves the REST API. `--standalone` swaps the
//! real hardware adapters for in-memory simulations, which is how the
//! daemon is developed and demoed off-appliance.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use homepool::domain::ports::{DeviceProberRef, PoolBackendRef};
use homepool::hardware::{LsblkProber, StaticProber};
use homepool::pool::{MemoryBackend, ZfsBackend};
use homepool::{
    ApiServer, ApiServerConfig, ConfigStore, Error, ManagerConfig, RaidManager, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Homepool - storage lifecycle daemon for the home server appliance
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "127.0.0.1:8090")]
    api_addr: String,

    /// Directory for daemon state (lifecycle markers)
    #[arg(long, env = "DATA_DIR", default_value = "/var/lib/homepool")]
    data_dir: PathBuf,

    /// Path to the persisted configuration file
    #[arg(long, env = "CONFIG_FILE", default_value = "/var/lib/homepool/homepool.yaml")]
    config_file: PathBuf,

    /// File the boot tooling leaves behind when the data pool failed to
    /// mount
    #[arg(
        long,
        env = "MOUNT_FAILURE_LOG",
        default_value = "/run/homepool/data-mount-error.log"
    )]
    mount_failure_log: PathBuf,

    /// Background poll interval in seconds
    #[arg(long, env = "POLL_INTERVAL", default_value = "5")]
    poll_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run with simulated hardware (no lsblk, no pool tooling)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting homepool daemon");
    info!("  Version: {}", homepool::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Data dir: {}", args.data_dir.display());
    info!("  Standalone mode: {}", args.standalone);

    let config = Arc::new(ConfigStore::open(&args.config_file)?);

    let (prober, backend): (DeviceProberRef, PoolBackendRef) = if args.standalone {
        let prober = StaticProber::new();
        // A couple of simulated drives so the API is explorable
        prober.upsert_device("nvme-Sim_SSD_2TB-SIM0001", Some(1), 2_000_398_934_016);
        prober.upsert_device("nvme-Sim_SSD_2TB-SIM0002", Some(2), 2_000_398_934_016);
        (Arc::new(prober), Arc::new(MemoryBackend::new()))
    } else {
        (Arc::new(LsblkProber::new()), Arc::new(ZfsBackend::new()))
    };

    let manager = RaidManager::new(
        config,
        prober,
        backend,
        ManagerConfig {
            poll_interval: std::time::Duration::from_secs(args.poll_interval_secs),
            data_dir: args.data_dir.clone(),
            mount_failure_log: args.mount_failure_log.clone(),
        },
    )?;
    // Picks up any setup or transition interrupted by a restart
    manager.start();

    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Internal(format!("invalid REST API address: {e}")))?,
    };
    let api_server = ApiServer::new(api_config, manager.clone());

    api_server.run().await?;

    manager.stop();
    info!("Daemon shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("tower=warn".parse().unwrap())
        .add_directive("axum=info".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
