//! awg-control: AmneziaWG gateway control service
//!
//! This is the main entry point for the standalone control daemon: it
//! converges the daemon's on-disk config with the peer store at startup and
//! runs the grace-period sweep until shutdown. Embedders that want the full
//! control surface (enroll/revoke/rotate) use the library crate from their
//! API service instead.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./awg-control
//!
//! # Run with custom configuration
//! ./awg-control -c /path/to/config.json
//!
//! # Run with environment overrides
//! AWG_CONTROL_LOG_LEVEL=debug ./awg-control
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use awg_control::config::{create_default_config, load_config_with_env, Config};
use awg_control::keys::{generate_keypair, SecretBox};
use awg_control::lock::LocalLeaseLock;
use awg_control::peers::{MemoryPeerStore, PeerLifecycleManager};
use awg_control::sync::{ConfigSynchronizer, SyncconfReloader};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/awg-control/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("awg-control v{}", awg_control::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"awg-control v{}

Configuration orchestration for an AmneziaWG gateway.

USAGE:
    awg-control [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/awg-control/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    AWG_CONTROL_ENDPOINT     Override the public endpoint
    AWG_CONTROL_LOG_LEVEL    Override log level (trace, debug, info, warn, error)
    AWG_CONTROL_SUBNET       Override the tunnel subnet
    AWG_CONTROL_CONFIG_DIR   Override the shared config directory

REQUIREMENTS:
    - The AmneziaWG container running with the shared config directory
      bind-mounted (default: /opt/amnezia/awg)
    - docker available for the reload command
"#,
        awg_control::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("awg-control v{}", awg_control::VERSION);
    info!("configuration loaded from {:?}", args.config_path);

    // Resolve the gateway identity. A generated key is ephemeral: peers
    // enrolled against it will not survive a restart without a configured key.
    let private_key = match &config.server.private_key {
        Some(key) => key.clone(),
        None => {
            let pair = generate_keypair()?;
            warn!(
                public_key = %pair.public_key,
                "no server.private_key configured; generated an ephemeral gateway keypair"
            );
            pair.private_key
        }
    };

    let secret_box = match &config.server.master_secret {
        Some(secret) => Some(SecretBox::new(secret)?),
        None => None,
    };

    let reloader = Arc::new(SyncconfReloader::new(
        &config.server.container_name,
        &config.server.interface_name,
        config.server.config_path().display().to_string(),
        Duration::from_secs(config.sync.reload_timeout_secs),
    ));
    let synchronizer = Arc::new(ConfigSynchronizer::new(
        config.server.config_path(),
        reloader,
        config.sync.reload_retries,
    ));

    let manager = PeerLifecycleManager::new(
        config.server_context(private_key),
        Arc::new(MemoryPeerStore::new()),
        Arc::new(LocalLeaseLock::new()),
        Arc::clone(&synchronizer),
        secret_box,
        config.lifecycle_options(),
    )
    .await?;

    info!(
        gateway = %manager.server_public_key(),
        config_path = %config.server.config_path().display(),
        "initial synchronization"
    );
    manager.synchronize().await?;

    let sweep_handle = manager.spawn_sweep_task(config.allocator.sweep_interval());

    info!(
        "startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM, shutting down");
        }
    }

    sweep_handle.abort();

    let status = manager.server_status().await?;
    info!(
        active_peers = status.active_peers,
        live_revision = status.live_revision.unwrap_or(0),
        pool_free = status.pool.free,
        "final status"
    );
    info!("shutdown complete");

    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await
}
