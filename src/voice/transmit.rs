//! Dual-path voice emission.
//!
//! A packet for a recipient goes out encrypted over UDP when that path is
//! viable — address learned, cipher keyed, and the client either prefers
//! UDP or the caller forces it (ping echoes). Otherwise the plaintext is
//! queued to the control side and rides the recipient's TLS channel as a
//! tunneled frame.

use crate::control::ControlEvent;
use crate::crypto::CRYPT_OVERHEAD;
use crate::state::ServerUser;
use crate::voice::proto::MAX_DATAGRAM;
use bytes::Bytes;
use std::net::UdpSocket;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Headroom for the emitted header growing past the inbound datagram (the
/// prepended sender varint).
const SEND_BUF: usize = MAX_DATAGRAM + CRYPT_OVERHEAD + 16;

#[derive(Clone)]
pub struct Transmitter {
    socket: Arc<UdpSocket>,
    control: mpsc::Sender<ControlEvent>,
}

impl Transmitter {
    pub fn new(socket: Arc<UdpSocket>, control: mpsc::Sender<ControlEvent>) -> Self {
        Self { socket, control }
    }

    /// Send one already-rendered packet to one recipient. UDP errors are
    /// swallowed: voice is best-effort.
    pub fn send(&self, recipient: &ServerUser, packet: &Bytes, force_udp: bool) {
        if let Some(addr) = recipient.udp_addr() {
            if recipient.prefers_udp() || force_udp {
                let mut crypt = recipient.crypt.lock().unwrap();
                if crypt.is_initialized() {
                    let mut wire = [0u8; SEND_BUF];
                    if let Ok(n) = crypt.encrypt(packet, &mut wire) {
                        drop(crypt);
                        if let Err(err) = self.socket.send_to(&wire[..n], addr) {
                            trace!(session = recipient.session, error = %err, "udp send failed");
                        }
                        return;
                    }
                }
            }
        }
        // Slow path: tunnel through the recipient's control channel. The
        // shared `Bytes` makes this a reference count bump, not a copy.
        if self
            .control
            .try_send(ControlEvent::Tunneled {
                session: recipient.session,
                packet: packet.clone(),
            })
            .is_err()
        {
            trace!(session = recipient.session, "control queue full, tunneled frame dropped");
        }
    }
}
