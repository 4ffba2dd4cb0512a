// src/main.rs
//
// Entry point: parse CLI flags, load the persisted Settings snapshot,
// bind transports, and run the Orchestrator's tick loop forever. The
// daemon has no interactive CLI surface per spec.md §6 ("CLI / exit
// codes: None"); these flags are ambient operator ergonomics for pointing
// the process at a serial device vs. TCP-only operation, not a protocol
// feature.

use std::path::PathBuf;

use canbridge_lib::can::NUM_BUSES;
use canbridge_lib::dispatch::{CanBus, NullCanBus};
use canbridge_lib::orchestrator::{advertise_mdns, Orchestrator};
use canbridge_lib::settings::{Settings, SETTINGS_NAMESPACE};
use canbridge_lib::socketcan::SocketCanBus;
use canbridge_lib::transport::serial::SerialTransport;
use canbridge_lib::transport::tcp::TcpServerTransport;
use canbridge_lib::transport::Transport;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "canbridge", about = "CAN bus bridge exposing GVRET and ELM327 endpoints")]
struct Cli {
    /// Path to the settings TOML file.
    #[arg(long, default_value = "ESP32RET.toml")]
    config: PathBuf,

    /// GVRET TCP port (telnet-style binary protocol).
    #[arg(long, default_value_t = 23)]
    gvret_port: u16,

    /// ELM327 TCP port (OBD-II text protocol).
    #[arg(long, default_value_t = 1000)]
    elm_port: u16,

    /// Serial device for the GVRET channel instead of TCP, e.g. /dev/ttyUSB0.
    #[arg(long)]
    serial: Option<String>,

    /// Serial baud rate, used only with --serial.
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Linux SocketCAN interface names (e.g. can0,can1), one per bus in
    /// index order. Buses without a listed interface stay a `NullCanBus`.
    #[arg(long, value_delimiter = ',')]
    can_interfaces: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(&cli.config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to load settings from {}: {}", cli.config.display(), e);
            std::process::exit(1);
        }
    };
    canbridge_lib::logging::set_level(settings.log_level);
    canbridge_lib::logging::tlog_info!("[main] loaded settings namespace '{}' from {}", SETTINGS_NAMESPACE, cli.config.display());

    let gvret_transport: Box<dyn Transport> = if let Some(port_path) = &cli.serial {
        match SerialTransport::open(port_path, cli.baud) {
            Ok(t) => Box::new(t),
            Err(e) => {
                eprintln!("failed to open serial port {}: {}", port_path, e);
                std::process::exit(1);
            }
        }
    } else {
        let addr = format!("0.0.0.0:{}", cli.gvret_port);
        match TcpServerTransport::bind(&addr, "gvret").await {
            Ok(t) => Box::new(t),
            Err(e) => {
                eprintln!("failed to bind GVRET TCP port {}: {}", cli.gvret_port, e);
                std::process::exit(1);
            }
        }
    };

    let elm_addr = format!("0.0.0.0:{}", cli.elm_port);
    let elm_transport: Box<dyn Transport> = match TcpServerTransport::bind(&elm_addr, "elm").await {
        Ok(t) => Box::new(t),
        Err(e) => {
            eprintln!("failed to bind ELM TCP port {}: {}", cli.elm_port, e);
            std::process::exit(1);
        }
    };

    let buses: Vec<Box<dyn CanBus>> = (0..NUM_BUSES)
        .map(|idx| match cli.can_interfaces.get(idx) {
            Some(iface) => Box::new(SocketCanBus::new(iface.clone())) as Box<dyn CanBus>,
            None => Box::new(NullCanBus) as Box<dyn CanBus>,
        })
        .collect();

    let heartbeat_socket = match Orchestrator::bind_heartbeat().await {
        Ok(s) => Some(s),
        Err(e) => {
            canbridge_lib::logging::tlog_warn!("[main] heartbeat socket unavailable: {}", e);
            None
        }
    };

    if let Ok(daemon) = mdns_sd::ServiceDaemon::new() {
        advertise_mdns(&daemon, std::net::Ipv4Addr::UNSPECIFIED, "canbridge");
    } else {
        canbridge_lib::logging::tlog_warn!("[main] mDNS daemon unavailable, skipping service advertisement");
    }

    let orchestrator = Orchestrator::new(settings, gvret_transport, elm_transport, buses, heartbeat_socket);
    orchestrator.run().await;
}
