//! The datapath → control bridge.
//!
//! The UDP thread never touches a TLS socket. Anything it needs the control
//! side to do travels through one bounded queue of tagged events, pushed
//! with `try_send` so the receive loop cannot block on a slow control side.

use crate::network::frame::{self, ControlFrame};
use crate::state::{SessionId, Switchboard};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Depth of the datapath → control queue.
pub const CONTROL_QUEUE_DEPTH: usize = 1024;

/// Work the datapath asks of the control side.
#[derive(Debug)]
pub enum ControlEvent {
    /// Sustained decrypt failure: ask the client to renegotiate the
    /// datagram cipher.
    Resync { session: SessionId },
    /// A voice packet for a recipient without a viable UDP path, to be
    /// framed onto their control channel.
    Tunneled { session: SessionId, packet: Bytes },
}

/// Drain the control queue, turning events into frames on the per-session
/// control channels. Runs until the queue closes.
pub async fn run_control_link(board: Arc<Switchboard>, mut rx: mpsc::Receiver<ControlEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ControlEvent::Resync { session } => {
                debug!(session, "requesting datagram cipher resync");
                forward(&board, session, ControlFrame::new(frame::CRYPT_SETUP, Bytes::new()));
            }
            ControlEvent::Tunneled { session, packet } => {
                forward(&board, session, ControlFrame::new(frame::UDP_TUNNEL, packet));
            }
        }
    }
}

fn forward(board: &Switchboard, session: SessionId, frame: ControlFrame) {
    match board.senders.get(&session) {
        Some(tx) => {
            // A full writer queue means the client is not draining its TLS
            // stream. Tunneled voice is as lossy as the UDP it replaces.
            if tx.try_send(frame).is_err() {
                trace!(session, "control writer congested, frame dropped");
            }
        }
        None => trace!(session, "control frame for a session that is gone"),
    }
}
