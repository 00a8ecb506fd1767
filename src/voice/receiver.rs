//! The UDP datapath thread.
//!
//! One dedicated OS thread owns the voice socket. Reads use a 1-second
//! timeout so the thread observes the running flag promptly on platforms
//! where closing the socket does not interrupt a blocking read.
//!
//! Per datagram: length sanity, peer lookup under the shared registry
//! lock, decrypt (exact peer hit, or probing every user on the source
//! host — the port-change learning path), then dispatch to the ping echo
//! or the voice router.
//!
//! The probe path is the one place the datapath writes the registry: it
//! drops the shared lock, takes the exclusive lock to migrate the peer
//! binding, and re-verifies the session still exists both before the
//! migration and after downgrading back to the shared lock. A session
//! that vanished in a gap is a normal outcome; the packet is abandoned.

use crate::crypto::CRYPT_OVERHEAD;
use crate::error::DropReason;
use crate::state::{ServerUser, Switchboard, World};
use crate::voice::proto::{self, MAX_DATAGRAM, MIN_DATAGRAM};
use crate::voice::router::VoiceRouter;
use crate::voice::transmit::Transmitter;
use bytes::Bytes;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, RwLockReadGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
    board: Arc<Switchboard>,
    router: Arc<VoiceRouter>,
    transmitter: Transmitter,
}

impl UdpReceiver {
    pub fn new(
        socket: Arc<UdpSocket>,
        board: Arc<Switchboard>,
        router: Arc<VoiceRouter>,
        transmitter: Transmitter,
    ) -> Self {
        Self {
            socket,
            board,
            router,
            transmitter,
        }
    }

    /// Start the datapath thread. Fails only on socket configuration; the
    /// caller treats that as the server being invalid.
    pub fn spawn(self) -> io::Result<thread::JoinHandle<()>> {
        self.socket
            .set_read_timeout(Some(Duration::from_secs(1)))?;
        thread::Builder::new()
            .name("voice-rx".to_owned())
            .spawn(move || self.run())
    }

    fn run(self) {
        info!("voice datapath running");
        // Room for one byte past the limit so truncation is detectable.
        let mut wire = [0u8; MAX_DATAGRAM + 1];
        let mut plain = [0u8; MAX_DATAGRAM];

        while self.board.is_running() {
            let (len, peer) = match self.socket.recv_from(&mut wire) {
                Ok(received) => received,
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => {
                    if self.board.is_running() {
                        warn!(error = %err, "voice socket read failed");
                    }
                    break;
                }
            };
            if let Err(reason) = self.handle_datagram(&wire[..len], peer, &mut plain) {
                trace!(%peer, reason = reason.code(), "datagram dropped");
            }
        }
        info!("voice datapath stopped");
    }

    fn handle_datagram(
        &self,
        datagram: &[u8],
        peer: SocketAddr,
        plain: &mut [u8; MAX_DATAGRAM],
    ) -> Result<(), DropReason> {
        if datagram.len() < MIN_DATAGRAM {
            return Err(DropReason::Runt);
        }
        if datagram.len() > MAX_DATAGRAM {
            return Err(DropReason::Oversize);
        }

        let mut world = self.board.world.read().unwrap();

        let (user, plain_len) = match world.users.by_peer(peer).cloned() {
            Some(user) => {
                let len = self
                    .check_decrypt(&user, datagram, plain)
                    .ok_or(DropReason::Decrypt)?;
                (user, len)
            }
            None => {
                let (user, len) = self.probe_host(&world, peer, datagram, plain)?;
                // Migrate host → peer under the exclusive lock. The session
                // may die in either gap; re-verify on both sides.
                let session = user.session;
                drop(world);
                {
                    let mut exclusive = self.board.world.write().unwrap();
                    if !exclusive.users.claim_peer(session, peer) {
                        return Err(DropReason::Vanished);
                    }
                }
                world = self.board.world.read().unwrap();
                if !world.users.contains(session) {
                    return Err(DropReason::Vanished);
                }
                debug!(session, %peer, "udp peer address learned");
                (user, len)
            }
        };

        let plain = &plain[..plain_len];
        user.touch_activity();

        match proto::message_type(plain[0]) {
            proto::UDP_TYPE_PING => {
                // Exact payload back, encrypted, forcing the UDP path.
                self.transmitter
                    .send(&user, &Bytes::copy_from_slice(plain), true);
                Ok(())
            }
            proto::UDP_TYPE_VOICE => {
                user.set_prefers_udp(true);
                self.router.route(&world, &user, plain)
            }
            other => {
                trace!(session = user.session, kind = other, "unknown datagram type");
                Ok(())
            }
        }
    }

    /// Try every user connected from the datagram's source host; the first
    /// cipher that verifies it claims the address.
    fn probe_host(
        &self,
        world: &RwLockReadGuard<'_, World>,
        peer: SocketAddr,
        datagram: &[u8],
        plain: &mut [u8; MAX_DATAGRAM],
    ) -> Result<(Arc<ServerUser>, usize), DropReason> {
        for candidate in world.users.host_candidates(peer.ip()) {
            if !candidate.crypt.lock().unwrap().is_initialized() {
                continue;
            }
            if let Some(len) = self.check_decrypt(&candidate, datagram, plain) {
                return Ok((candidate, len));
            }
        }
        Err(DropReason::UnknownPeer)
    }

    /// Decrypt with one user's cipher. On failure, apply the resync policy:
    /// if this session has not decrypted anything for a while and has not
    /// been asked recently, queue a resync solicitation for the control
    /// side.
    fn check_decrypt(
        &self,
        user: &ServerUser,
        datagram: &[u8],
        plain: &mut [u8; MAX_DATAGRAM],
    ) -> Option<usize> {
        debug_assert!(datagram.len() >= CRYPT_OVERHEAD);
        let mut crypt = user.crypt.lock().unwrap();
        match crypt.decrypt(datagram, plain) {
            Ok(len) => Some(len),
            Err(_) => {
                if crypt.should_request_resync(Instant::now()) {
                    self.board.push_control(crate::control::ControlEvent::Resync {
                        session: user.session,
                    });
                }
                None
            }
        }
    }
}
