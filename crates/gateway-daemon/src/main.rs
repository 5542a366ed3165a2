//! Gateway daemon entry point.
//!
//! Wires the bus master, device manager, polling worker, alert engine,
//! MQTT bridge, retention sweeper, and web server into a running process
//! with signal handling and ordered shutdown.

mod retention;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use gateway_alert::{spawn_alert_engine, AlertEngineConfig};
use gateway_common::config::GatewayConfig;
use gateway_common::events::EventBus;
use gateway_device::manager::DeviceManagerConfig;
use gateway_device::poller::PollerConfig;
use gateway_device::{spawn_poller, DeviceManager, DeviceRegistry};
use gateway_modbus::sim::{SimLink, SimSlave};
use gateway_modbus::{spawn_master, MasterConfig, SerialLink};
use gateway_mqtt::spawn_bridge;
use gateway_store::Store;
use gateway_web::{AppContext, GatewayMetrics, WebConfig, WebServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Gateway daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "gateway-daemon",
    about = "RS-485 sensor gateway - Modbus RTU master with storage, WebSocket push, and MQTT bridging",
    version,
    long_about = None
)]
struct Args {
    /// Path to a gateway configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Serial device path (overrides config file and environment).
    #[arg(long, short = 'p', value_name = "DEVICE")]
    port: Option<String>,

    /// Run against a simulated bus with two demo slaves (no hardware).
    #[arg(long, short = 's')]
    simulated: bool,

    /// Skip the discovery scan and automatic polling start at boot.
    #[arg(long)]
    no_autostart: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l')]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args)?;
    config
        .apply_env()
        .context("environment configuration rejected")?;
    if let Some(port) = &args.port {
        config.serial.port = port.clone();
    }

    init_logging(args.log_level.as_deref().unwrap_or(&config.log_level.0));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = %config.serial.port,
        baud = config.serial.baudrate,
        "starting gateway daemon"
    );

    run(config, &args).await
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "gateway_daemon={level},gateway_modbus={level},gateway_device={level},\
         gateway_store={level},gateway_alert={level},gateway_mqtt={level},\
         gateway_web={level},gateway_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .init();
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<GatewayConfig> {
    if let Some(config_path) = &args.config {
        GatewayConfig::from_file(config_path)
            .with_context(|| format!("failed to load config from {config_path:?}"))
    } else {
        let default_path = PathBuf::from("config/gateway.toml");
        if default_path.exists() {
            GatewayConfig::from_file(&default_path)
                .with_context(|| format!("failed to load default config from {default_path:?}"))
        } else {
            Ok(GatewayConfig::default())
        }
    }
}

/// Build the demo slave bank for `--simulated` runs.
fn build_sim_link(baud: u32) -> SimLink {
    use gateway_common::types::Capabilities;
    use gateway_modbus::registers::input;

    let link = SimLink::new(baud);

    let mut tilt_sensor = SimSlave::new(
        2,
        Capabilities::RS485 | Capabilities::MPU6050 | Capabilities::IDENTIFY,
    );
    tilt_sensor.set_input(input::ANGLE_X, 120); // 1.20 deg
    tilt_sensor.set_input(input::ANGLE_Y, (-45i16) as u16);
    tilt_sensor.set_input(input::TEMPERATURE, 2150); // 21.50 degC
    tilt_sensor.set_input(input::ACCEL_Z, 1000); // 1 g
    link.add_slave(tilt_sensor);

    let mut mast_head = SimSlave::new(
        16,
        Capabilities::RS485
            | Capabilities::MPU6050
            | Capabilities::IDENTIFY
            | Capabilities::WIND
            | Capabilities::LOAD,
    );
    mast_head.set_input(input::TEMPERATURE, 1830);
    mast_head.set_input(input::ACCEL_Z, 998);
    mast_head.set_input(input::LOAD, 12_050); // 120.50 kg
    mast_head.set_input(input::WIND_SPEED, 525); // 5.25 m/s
    mast_head.set_input(input::WIND_DIRECTION, 280);
    link.add_slave(mast_head);

    link
}

async fn run(config: GatewayConfig, args: &Args) -> Result<()> {
    let (shutdown_tx, shutdown) = watch::channel(false);
    signals::spawn_signal_listener(shutdown_tx);

    // Storage first: everything else hangs off it.
    let store = Store::open(&config.storage.db_path)
        .with_context(|| format!("failed to open database {:?}", config.storage.db_path))?;

    // The bus master owns the line; everyone else goes through its queue.
    let (bus, bus_join) = if args.simulated {
        info!("using simulated bus with demo slaves 2 and 16");
        spawn_master(
            build_sim_link(config.serial.baudrate),
            MasterConfig::default(),
        )
    } else {
        let link = SerialLink::open(&config.serial.port, config.serial.baudrate)
            .with_context(|| format!("failed to open serial port {}", config.serial.port))?;
        spawn_master(link, MasterConfig::default())
    };

    // Device cache, seeded from persistence.
    let registry = Arc::new(DeviceRegistry::new());
    match store.get_devices() {
        Ok(devices) => {
            info!(count = devices.len(), "device cache seeded from storage");
            registry.load(devices);
        }
        Err(e) => warn!(error = %e, "device cache seed failed, starting empty"),
    }

    let events = EventBus::default();
    let manager = DeviceManager::new(
        bus.clone(),
        Arc::clone(&registry),
        store.clone(),
        events.clone(),
        DeviceManagerConfig {
            request_timeout: config.serial.timeout,
            probe_timeout: config.discovery.probe_timeout,
            probe_retries: config.discovery.probe_retries,
        },
    );

    // Workers.
    let (alert_tx, alert_rx) = mpsc::channel(64);
    let (poller, poller_join) = spawn_poller(
        manager.clone(),
        store.clone(),
        events.clone(),
        alert_tx,
        PollerConfig {
            interval: config.polling.interval,
            inter_frame_delay: config.polling.inter_frame_delay,
            request_timeout: config.serial.timeout,
        },
        shutdown.clone(),
    );
    let alert_join = spawn_alert_engine(
        store.clone(),
        Arc::clone(&registry),
        events.clone(),
        alert_rx,
        AlertEngineConfig::default(),
        shutdown.clone(),
    );
    let mqtt_join = spawn_bridge(
        config.mqtt.clone(),
        store.clone(),
        Arc::clone(&registry),
        events.clone(),
        shutdown.clone(),
    );
    let retention_join = retention::spawn_retention_sweeper(
        store.clone(),
        config.storage.retention_days,
        shutdown.clone(),
    );

    // Web surface.
    let bind_addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port)
        .parse()
        .context("invalid HTTP bind address")?;
    let context = Arc::new(AppContext {
        manager: manager.clone(),
        poller: poller.clone(),
        store: store.clone(),
        events: events.clone(),
        metrics: Arc::new(GatewayMetrics::new()),
    });
    let web = WebServer::new(
        WebConfig {
            bind_addr,
            enable_cors: true,
        },
        context,
    );
    let web_join = tokio::spawn(web.start(shutdown.clone()));

    // Boot sequence: scan the configured range, then start polling
    // whatever answered.
    if !args.no_autostart {
        let range = config.discovery.unit_id_min..=config.discovery.unit_id_max;
        match manager.discover(range).await {
            Ok(found) => info!(count = found.len(), "boot discovery finished"),
            Err(e) => warn!(error = %e, "boot discovery failed"),
        }
        if let Err(e) = poller.start(Vec::new(), None).await {
            warn!(error = %e, "polling autostart failed");
        }
    }

    // Wait for the shutdown signal.
    let mut shutdown_watch = shutdown.clone();
    while !*shutdown_watch.borrow() {
        if shutdown_watch.changed().await.is_err() {
            break;
        }
    }

    // Ordered teardown: the HTTP surface goes first and the bus master
    // last, so the physical port is released after every producer is
    // quiet. The in-flight poll transaction completes within its timeout.
    info!("shutting down");
    match web_join.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "web server failed"),
        Err(e) => error!(error = %e, "web server task panicked"),
    }
    let _ = poller_join.await;
    let _ = alert_join.await;
    let _ = mqtt_join.await;
    let _ = retention_join.await;

    drop(poller);
    drop(manager);
    drop(bus);
    let _ = bus_join.await;

    info!("gateway daemon stopped");
    Ok(())
}
