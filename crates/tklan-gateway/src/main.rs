//! TKLan gateway binary.
//!
//! # Usage
//!
//! ```bash
//! # Default ports, Raspberry Pi serial device
//! tklan-gateway --serial-port /dev/ttyAMA0
//!
//! # Custom sockets and a streaming schedule
//! tklan-gateway --serial-port /dev/ttyUSB0 --baudrate 9600 \
//!     --commands 0.0.0.0:5555 --publisher 0.0.0.0:5556 \
//!     --schedule schedule.json
//! ```
//!
//! The schedule file is a JSON array of command objects
//! (`{"sender":0,"destination":1,"function":1,"data":"0005"}`), pumped in
//! order whenever no client request is pending.

use std::{sync::Arc, time::Duration};

use clap::Parser;
use tklan_gateway::{Gateway, GatewayConfig};
use tklan_link::{LinkConfig, SerialLink, SystemPortFactory};
use tklan_proto::wire::CommandRequest;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// TKLan serial bus gateway
#[derive(Parser, Debug)]
#[command(name = "tklan-gateway")]
#[command(about = "JSON socket gateway for the TKLan fieldbus")]
#[command(version)]
struct Args {
    /// Serial device to drive
    #[arg(short, long, default_value = "/dev/ttyAMA0")]
    serial_port: String,

    /// Line speed in bits per second
    #[arg(short, long, default_value = "2400")]
    baudrate: u32,

    /// Bind address of the commands (request/reply) socket
    #[arg(long, default_value = "0.0.0.0:5555")]
    commands: String,

    /// Bind address of the publisher (fan-out) socket
    #[arg(long, default_value = "0.0.0.0:5556")]
    publisher: String,

    /// Worker poll period in milliseconds
    #[arg(long, default_value = "50")]
    poll_period_ms: u64,

    /// Path to a JSON streaming schedule
    #[arg(long)]
    schedule: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let streaming: Vec<CommandRequest> = match &args.schedule {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Vec::new(),
    };

    let link_config = LinkConfig {
        serial_port: args.serial_port.clone(),
        baudrate: args.baudrate,
        ..LinkConfig::default()
    };
    let link = Arc::new(SerialLink::new(link_config, SystemPortFactory));
    link.start()?;
    tracing::info!(port = %args.serial_port, master = link.is_master(), "serial link up");

    let config = GatewayConfig {
        commands_addr: args.commands,
        publisher_addr: args.publisher,
        poll_period: Duration::from_millis(args.poll_period_ms),
        streaming,
    };
    let gateway = Gateway::bind(Arc::clone(&link), config).await?;

    tokio::select! {
        result = gateway.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }

    link.stop();
    Ok(())
}
