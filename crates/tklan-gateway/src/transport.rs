//! TCP socket surfaces.
//!
//! Both sockets speak newline-delimited JSON. The commands socket is
//! request/reply: every line a client sends is answered with exactly one
//! line. The publisher socket is one-way: subscribers receive every event
//! published since they connected, best-effort.

use std::sync::mpsc;

use tklan_proto::wire::{CommandRequest, Event};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{broadcast, oneshot},
};
use tracing::{debug, error, warn};

use crate::worker::{WorkerMessage, publish};

/// Accept commands clients until the listener fails.
pub(crate) async fn serve_commands(
    listener: TcpListener,
    work: mpsc::Sender<WorkerMessage>,
    events: broadcast::Sender<String>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "commands client connected");
                let work = work.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_commands_client(stream, &work, &events).await {
                        debug!(%peer, error = %e, "commands client gone");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "commands accept failed");
                break;
            }
        }
    }
}

/// One request line in, one reply line out, until the client hangs up.
async fn handle_commands_client(
    stream: TcpStream,
    work: &mpsc::Sender<WorkerMessage>,
    events: &broadcast::Sender<String>,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<CommandRequest>(&line) {
            Ok(request) => transact(request, work, events).await,
            Err(e) => {
                warn!(error = %e, "malformed command line");
                serde_json::json!({ "error": format!("malformed request: {e}") }).to_string()
            }
        };
        write.write_all(response.as_bytes()).await?;
        write.write_all(b"\n").await?;
    }
    Ok(())
}

/// Hand one command to the worker and render its reply line.
async fn transact(
    request: CommandRequest,
    work: &mpsc::Sender<WorkerMessage>,
    events: &broadcast::Sender<String>,
) -> String {
    let (reply_tx, reply_rx) = oneshot::channel();
    if work.send(WorkerMessage::Command { request, reply: reply_tx }).is_err() {
        return worker_gone(events);
    }
    match reply_rx.await {
        Ok(reply) => serde_json::to_string(&reply)
            .unwrap_or_else(|_| r#"{"error":"reply serialization failed"}"#.to_string()),
        Err(_) => worker_gone(events),
    }
}

/// The worker died mid-flight: tell the subscribers and the client.
fn worker_gone(events: &broadcast::Sender<String>) -> String {
    error!("gateway worker unavailable");
    publish(events, &Event::Exception { exception: "gateway worker unavailable".to_string() });
    r#"{"error":"gateway worker unavailable"}"#.to_string()
}

/// Accept publisher subscribers until the listener fails.
pub(crate) async fn serve_publisher(listener: TcpListener, events: broadcast::Sender<String>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "subscriber connected");
                let rx = events.subscribe();
                tokio::spawn(async move {
                    forward_events(stream, rx).await;
                    debug!(%peer, "subscriber gone");
                });
            }
            Err(e) => {
                error!(error = %e, "publisher accept failed");
                break;
            }
        }
    }
}

/// Copy the event feed to one subscriber. Lagging subscribers lose
/// messages, never block the bus.
async fn forward_events(mut stream: TcpStream, mut rx: broadcast::Receiver<String>) {
    loop {
        match rx.recv().await {
            Ok(line) => {
                if stream.write_all(line.as_bytes()).await.is_err()
                    || stream.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "subscriber lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
