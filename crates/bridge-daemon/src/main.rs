//! CLI entry point (spec §6 "Environment", SPEC_FULL §4.10 C10/§4.11 C11).
//!
//! Wires every other crate together: parses arguments, installs the tracing
//! subscriber, opens the serial bus, loads the `default` on-disk
//! configuration if one exists, runs an initial discovery sweep, spawns the
//! per-motor coalescer workers and the DMX listener, and serves the HTTP
//! control surface until SIGINT/SIGTERM.

use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bridge_config::NamedConfiguration;
use bridge_http::{AppState, ScanConfig};
use clap::Parser;
use mcp_commands::MotionCommands;
use mcp_transport::{BusTransport, DEFAULT_TIMEOUT};
use motor_coalescer::Coalescer;
use motor_registry::{Registry, RegistryDefaults};
use tokio::net::UdpSocket;
use tokio_serial::SerialStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Maximum address a scan may cover; 0 is the broadcast address and 255 is
/// reserved (spec §6).
const MAX_SCAN_ADDR: u8 = 254;

#[derive(Debug, Parser)]
#[command(name = "dmx-motion-bridge", about = "Bridges Art-Net/DMX to a serial motion-control bus")]
struct Args {
    /// Serial device path for the motion-control bus (e.g. /dev/ttyUSB0).
    #[arg(long, env = "BRIDGE_SERIAL_PORT")]
    serial_port: String,

    /// Serial baud rate.
    #[arg(long, env = "BRIDGE_BAUD", default_value_t = 115_200)]
    baud: u32,

    /// IP address the Art-Net UDP listener binds to.
    #[arg(long, env = "BRIDGE_ARTNET_IP", default_value = "0.0.0.0")]
    artnet_ip: IpAddr,

    /// UDP port the Art-Net listener binds to.
    #[arg(long, env = "BRIDGE_ARTNET_PORT", default_value_t = 6454)]
    artnet_port: u16,

    /// DMX universe to accept frames for, absent a loaded configuration.
    #[arg(long, env = "BRIDGE_ARTNET_UNIVERSE", default_value_t = 0)]
    artnet_universe: u16,

    /// IP address the HTTP control surface binds to.
    #[arg(long, env = "BRIDGE_HTTP_IP", default_value = "0.0.0.0")]
    http_ip: IpAddr,

    /// TCP port the HTTP control surface binds to.
    #[arg(long, env = "BRIDGE_HTTP_PORT", default_value_t = 8080)]
    http_port: u16,

    /// Default per-motor maximum speed seeded by discovery.
    #[arg(long, env = "BRIDGE_DEFAULT_MAX_SPEED", default_value_t = 1000)]
    default_max_speed: i32,

    /// Default per-motor minimum speed seeded by discovery.
    #[arg(long, env = "BRIDGE_DEFAULT_MIN_SPEED", default_value_t = 1)]
    default_min_speed: i32,

    /// Default per-motor acceleration seeded by discovery.
    #[arg(long, env = "BRIDGE_DEFAULT_ACCEL", default_value_t = 1000)]
    default_accel: i32,

    /// Default per-motor maximum position seeded by discovery.
    #[arg(long, env = "BRIDGE_DEFAULT_MAX_POS", default_value_t = 5000)]
    default_max_pos: i32,

    /// Highest address the startup scan probes (clamped to 254; 0 and 255
    /// are never probed).
    #[arg(long, env = "BRIDGE_SCAN_RANGE", default_value_t = MAX_SCAN_ADDR)]
    scan_range: u8,

    /// Safety ceiling applied to every user-supplied speed/acceleration
    /// value before it reaches the wire.
    #[arg(long, env = "BRIDGE_SPEED_CEILING", default_value_t = 1000)]
    speed_ceiling: i32,

    /// Directory named configurations are read from and written to.
    #[arg(long, env = "BRIDGE_CONFIG_DIR", default_value = "./config")]
    config_dir: PathBuf,

    /// Per-exchange reply timeout in milliseconds.
    #[arg(long, env = "BRIDGE_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// `-v`/`-vv` raise the default log level; overridden by `RUST_LOG`.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn install_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    install_tracing(args.verbose);

    let scan_range: RangeInclusive<u8> = 1..=args.scan_range.min(MAX_SCAN_ADDR);
    let timeout = Duration::from_millis(args.timeout_ms);

    info!(port = %args.serial_port, baud = args.baud, "opening serial bus");
    let transport = Arc::new(
        BusTransport::<SerialStream>::open(&args.serial_port, args.baud)
            .with_context(|| format!("failed to open serial port {}", args.serial_port))?,
    );

    let commands = Arc::new(
        MotionCommands::new(transport)
            .with_timeout(timeout)
            .with_speed_ceiling(args.speed_ceiling),
    );

    let registry = Arc::new(Registry::new());
    let coalescer = Arc::new(Coalescer::new(commands.clone()));

    let mut defaults = RegistryDefaults {
        max_speed: args.default_max_speed,
        min_speed: args.default_min_speed,
        accel: args.default_accel,
        max_pos: args.default_max_pos,
    };
    let mut universe = args.artnet_universe;

    match bridge_config::load_named(&args.config_dir, "default").await {
        Ok(NamedConfiguration { motors, artnet }) => {
            info!(count = motors.len(), "loaded default configuration");
            universe = artnet.universe;
            // A loaded configuration's first motor's parameters become the
            // defaults newly discovered motors are seeded with (spec §4.8:
            // "its StoredMotorConfig entries seed the registry defaults used
            // by discovery"); discovery below still owns the final registry
            // contents, since a rescan always replaces it wholesale (spec
            // §4.4).
            if let Some(first) = motors.first() {
                defaults = RegistryDefaults {
                    max_speed: first.max_speed,
                    min_speed: first.min_speed,
                    accel: first.accel,
                    max_pos: first.max_pos,
                };
            }
        }
        Err(bridge_config::ConfigError::NotFound(_)) => {
            info!("no default configuration on disk; starting with an empty registry");
        }
        Err(err) => {
            warn!(%err, "failed to load default configuration; starting with an empty registry");
        }
    }

    let ingest = Arc::new(dmx_ingest::DmxIngest::new(universe));

    let settle = timeout;
    info!(range = ?scan_range, "running initial bus discovery");
    let found = mcp_discovery::scan(&commands, scan_range.clone(), defaults, settle).await;
    info!(count = found.len(), "discovery complete");
    let addrs: Vec<u8> = found.iter().map(|m| m.addr).collect();
    registry.replace(found).await;
    coalescer.reconcile(&addrs).await;

    let artnet_addr = SocketAddr::new(args.artnet_ip, args.artnet_port);
    let udp_socket = UdpSocket::bind(artnet_addr)
        .await
        .with_context(|| format!("failed to bind Art-Net UDP socket on {artnet_addr}"))?;
    info!(addr = %artnet_addr, "listening for Art-Net/DMX");
    let dmx_task = tokio::spawn(dmx_ingest::run(udp_socket, ingest.clone(), registry.clone(), coalescer.clone()));

    let state = Arc::new(AppState {
        commands: commands.clone(),
        registry: registry.clone(),
        coalescer: coalescer.clone(),
        ingest: ingest.clone(),
        config_dir: args.config_dir.clone(),
        scan: ScanConfig { range: scan_range, settle, defaults },
    });
    let app = bridge_http::router(state);

    let http_addr = SocketAddr::new(args.http_ip, args.http_port);
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP control surface on {http_addr}"))?;
    info!(addr = %http_addr, "serving HTTP control surface");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                warn!(%err, "http server exited");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    info!("shutting down: disabling dmx ingest and draining motor workers");
    ingest.disable();
    dmx_task.abort();
    coalescer.shutdown().await;

    Ok(())
}

/// Resolves once SIGINT or, on unix, SIGTERM is received (spec §6b C10:
/// "wait for SIGINT/SIGTERM").
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
