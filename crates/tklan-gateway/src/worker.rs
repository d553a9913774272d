//! The single transaction worker.
//!
//! Exactly one thread executes bus transactions on behalf of the sockets,
//! which keeps the per-link total order trivially true and gives the
//! streaming schedule a natural definition of "idle": no command arrived
//! within one poll period.

use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use tklan_link::{LinkError, SerialLink};
use tklan_proto::wire::{CommandRequest, ErrorReply, Event, FrameReply, Reply};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// Work handed to the transaction worker.
pub(crate) enum WorkerMessage {
    /// Transact one client command and answer on the oneshot.
    Command {
        /// The frame fields to put on the bus.
        request: CommandRequest,
        /// Where the reply line goes.
        reply: oneshot::Sender<Reply>,
    },
}

/// Worker loop: drain commands, pump the streaming schedule when idle.
///
/// Runs on a dedicated OS thread because every transaction blocks on the
/// serial port. Exits when all command senders are gone.
pub(crate) fn worker_loop(
    link: Arc<SerialLink>,
    streaming: Vec<CommandRequest>,
    poll_period: Duration,
    work: mpsc::Receiver<WorkerMessage>,
    events: broadcast::Sender<String>,
) {
    debug!(schedule = streaming.len(), "gateway worker running");
    let mut next_entry = 0usize;

    loop {
        match work.recv_timeout(poll_period) {
            Ok(WorkerMessage::Command { request, reply }) => {
                let outcome = execute(&link, &request);
                if let Reply::Frame(frame) = &outcome {
                    publish(&events, &Event::Request(request));
                    publish(&events, &Event::Frame(frame.clone()));
                }
                // The client may have hung up while we were on the bus.
                let _ = reply.send(outcome);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if !link.is_master() {
                    continue;
                }
                // A pending hand-over request outranks the schedule.
                if let Some(node) = link.take_give_master() {
                    if let Err(e) = link.offer_token(node) {
                        warn!(node, error = %e, "token hand-over failed");
                    }
                    continue;
                }
                if streaming.is_empty() {
                    continue;
                }
                let request = streaming[next_entry % streaming.len()].clone();
                next_entry = next_entry.wrapping_add(1);
                match execute(&link, &request) {
                    Reply::Frame(frame) => {
                        publish(&events, &Event::Request(request));
                        publish(&events, &Event::Frame(frame));
                    }
                    Reply::Error(err) => {
                        warn!(error = %err.error, "streaming entry failed");
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("gateway worker exiting");
}

/// Build the frame, transact it, shape the outcome for the JSON surface.
fn execute(link: &SerialLink, request: &CommandRequest) -> Reply {
    let result =
        request.to_frame().map_err(LinkError::from).and_then(|frame| link.send_frame(&frame));
    match result {
        Ok(frame) => Reply::Frame(FrameReply::from(&frame)),
        Err(e) => {
            debug!(destination = request.destination, error = %e, "command failed");
            Reply::Error(ErrorReply { request: request.clone(), error: e.to_string() })
        }
    }
}

/// Best-effort fan-out; a publisher with no subscribers is fine.
pub(crate) fn publish(events: &broadcast::Sender<String>, event: &Event) {
    if let Ok(line) = serde_json::to_string(event) {
        let _ = events.send(line);
    }
}
