//! Clients for the TKLan gateway sockets.
//!
//! [`CommandClient`] speaks the request/reply commands socket: one JSON
//! line out, one JSON line back. [`Subscriber`] attaches to the one-way
//! publisher socket and yields every published event. Both are thin I/O
//! wrappers; the shared JSON shapes live in [`tklan_proto::wire`].

use thiserror::Error;
use tklan_proto::wire::{CommandRequest, Event, Reply};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket-level failure.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer's line was not valid JSON of the expected shape.
    #[error("malformed line from gateway: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The gateway closed the connection.
    #[error("gateway closed the connection")]
    Closed,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Request/reply client for the commands socket.
pub struct CommandClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl CommandClient {
    /// Connect to a gateway commands socket.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, writer) = stream.into_split();
        Ok(Self { lines: BufReader::new(read).lines(), writer })
    }

    /// Send one command and wait for its reply line.
    pub async fn send(&mut self, request: &CommandRequest) -> Result<Reply> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        let reply = self.lines.next_line().await?.ok_or(ClientError::Closed)?;
        Ok(serde_json::from_str(&reply)?)
    }
}

/// One-way subscriber for the publisher socket.
pub struct Subscriber {
    lines: Lines<BufReader<OwnedReadHalf>>,
    // Kept so the gateway sees the connection as alive.
    _writer: OwnedWriteHalf,
}

impl Subscriber {
    /// Connect to a gateway publisher socket.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, writer) = stream.into_split();
        Ok(Self { lines: BufReader::new(read).lines(), _writer: writer })
    }

    /// Wait for the next published event.
    pub async fn next_event(&mut self) -> Result<Event> {
        let line = self.lines.next_line().await?.ok_or(ClientError::Closed)?;
        Ok(serde_json::from_str(&line)?)
    }
}
