//! TKLan gateway: the serial link behind two JSON sockets.
//!
//! Out-of-process clients reach the bus through two TCP endpoints:
//!
//! - **Commands** (request/reply): one JSON object per line describing a
//!   frame to transact; the gateway answers with the response frame or
//!   with the request echoed back plus an `error` field.
//! - **Publisher** (one-way fan-out): every successfully transacted
//!   request and reply, plus `{"exception": …}` on non-recoverable
//!   failures.
//!
//! A single worker thread owns all bus access, so transactions stay
//! totally ordered. When no command is pending at poll time and a
//! streaming schedule is configured, the worker sends the next schedule
//! entry instead, wrapping around the list.

use std::{net::SocketAddr, sync::Arc, thread, time::Duration};

use tklan_link::SerialLink;
use tklan_proto::wire::CommandRequest;
use tokio::{net::TcpListener, sync::broadcast};
use tracing::info;

mod error;
mod transport;
mod worker;

pub use error::GatewayError;

/// Events kept for slow subscribers before they start losing messages.
const EVENT_BUFFER: usize = 256;

/// Gateway socket and scheduling configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address of the commands socket.
    pub commands_addr: String,
    /// Bind address of the publisher socket.
    pub publisher_addr: String,
    /// How long the worker waits for a command before running a streaming
    /// entry.
    pub poll_period: Duration,
    /// Ordered list of frames to pump while no client request is pending.
    pub streaming: Vec<CommandRequest>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            commands_addr: "0.0.0.0:5555".to_string(),
            publisher_addr: "0.0.0.0:5556".to_string(),
            poll_period: Duration::from_millis(50),
            streaming: Vec::new(),
        }
    }
}

/// The gateway runtime: bound sockets plus the shared serial link.
pub struct Gateway {
    link: Arc<SerialLink>,
    config: GatewayConfig,
    commands: TcpListener,
    publisher: TcpListener,
    events: broadcast::Sender<String>,
}

impl Gateway {
    /// Bind both sockets.
    ///
    /// The link is shared, not owned: callers keep their handle for
    /// in-process use and for [`SerialLink::stop`] at shutdown.
    pub async fn bind(link: Arc<SerialLink>, config: GatewayConfig) -> Result<Self, GatewayError> {
        let commands = TcpListener::bind(&config.commands_addr).await?;
        let publisher = TcpListener::bind(&config.publisher_addr).await?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Ok(Self { link, config, commands, publisher, events })
    }

    /// Local address of the commands socket.
    pub fn commands_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.commands.local_addr()?)
    }

    /// Local address of the publisher socket.
    pub fn publisher_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.publisher.local_addr()?)
    }

    /// Serve both sockets until a listener fails.
    pub async fn run(self) -> Result<(), GatewayError> {
        info!(
            commands = %self.commands_addr()?,
            publisher = %self.publisher_addr()?,
            schedule = self.config.streaming.len(),
            "gateway running"
        );

        let (work_tx, work_rx) = std::sync::mpsc::channel();
        let link = Arc::clone(&self.link);
        let streaming = self.config.streaming.clone();
        let poll_period = self.config.poll_period;
        let worker_events = self.events.clone();
        let worker = thread::Builder::new()
            .name("tklan-gateway-worker".to_string())
            .spawn(move || {
                worker::worker_loop(link, streaming, poll_period, work_rx, worker_events);
            })
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        tokio::join!(
            transport::serve_commands(self.commands, work_tx, self.events.clone()),
            transport::serve_publisher(self.publisher, self.events.clone()),
        );

        // Both accept loops are gone, so every command sender is dropped
        // and the worker drains out.
        worker.join().map_err(|_| GatewayError::Internal("worker panicked".to_string()))?;
        Ok(())
    }
}
