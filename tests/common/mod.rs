//! Integration test infrastructure: an in-process voice server on loopback
//! sockets and a client helper speaking the real datagram cipher.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use voxd::config::LimitsConfig;
use voxd::control::ControlEvent;
use voxd::crypto::{CryptMaterial, CryptState, CRYPT_OVERHEAD};
use voxd::state::{RuleSet, ServerUser, SessionId, Switchboard};
use voxd::voice::proto::write_varint;
use voxd::voice::{Transmitter, UdpReceiver, VoiceRouter};

/// Receive timeout for packets a test expects to arrive.
const RECV_TIMEOUT: Duration = Duration::from_millis(1500);
/// Receive timeout when asserting silence.
const SILENCE_TIMEOUT: Duration = Duration::from_millis(300);

pub struct VoiceServer {
    pub board: Arc<Switchboard>,
    pub acl: Arc<RuleSet>,
    pub addr: SocketAddr,
    /// The datapath → control queue, observable by tests.
    pub control_rx: mpsc::Receiver<ControlEvent>,
}

impl VoiceServer {
    pub fn start() -> Self {
        Self::with_limits(LimitsConfig {
            bandwidth: 72_000,
            timeout: 30,
            max_users: 32,
        })
    }

    pub fn with_limits(limits: LimitsConfig) -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind voice socket");
        let addr = socket.local_addr().expect("voice socket addr");
        let socket = Arc::new(socket);

        let (control_tx, control_rx) = mpsc::channel(1024);
        let acl = Arc::new(RuleSet::new());
        let board = Arc::new(Switchboard::new(limits, acl.clone(), control_tx.clone()));

        let transmitter = Transmitter::new(Arc::clone(&socket), control_tx);
        let router = Arc::new(VoiceRouter::new(Arc::clone(&board), transmitter.clone()));
        UdpReceiver::new(socket, Arc::clone(&board), router, transmitter)
            .spawn()
            .expect("spawn datapath");

        Self {
            board,
            acl,
            addr,
            control_rx,
        }
    }

    /// An authenticated client with negotiated crypt material but no UDP
    /// address known to the server yet.
    pub fn client(&self, name: &str) -> VoiceClient {
        let user = self
            .board
            .connect(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .expect("connect");
        self.board.authenticate(user.session, name).expect("authenticate");

        let material = CryptMaterial::generate();
        user.crypt
            .lock()
            .unwrap()
            .set_material_server(&material);
        let mut crypt = CryptState::new();
        crypt.set_material_client(&material);

        VoiceClient {
            session: user.session,
            user,
            crypt,
            socket: bind_client_socket(),
            server: self.addr,
        }
    }

    /// A client with a working UDP path: the server has learned its
    /// address from a ping and it prefers UDP delivery.
    pub fn udp_client(&self, name: &str) -> VoiceClient {
        let mut client = self.client(name);
        client.ping(&[0x55]);
        let echo = client.recv().expect("ping echo");
        assert_eq!(echo, vec![2 << 5, 0x55], "ping echoes its exact payload");
        client.user.set_prefers_udp(true);
        client
    }

    /// Wait for a tunneled-voice event for `session` on the control queue.
    pub fn expect_tunneled(&mut self, session: SessionId) -> Vec<u8> {
        let deadline = Instant::now() + RECV_TIMEOUT;
        while Instant::now() < deadline {
            match self.control_rx.try_recv() {
                Ok(ControlEvent::Tunneled {
                    session: got,
                    packet,
                }) if got == session => return packet.to_vec(),
                Ok(_) => continue,
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        panic!("no tunneled frame for session {session} within the deadline");
    }

    pub fn assert_registry_invariants(&self) {
        self.board.world.read().unwrap().users.assert_invariants();
    }
}

pub struct VoiceClient {
    pub session: SessionId,
    pub user: Arc<ServerUser>,
    pub crypt: CryptState,
    socket: UdpSocket,
    server: SocketAddr,
}

impl VoiceClient {
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("client socket addr")
    }

    /// Move to a fresh socket (new source port), keeping the cipher state.
    pub fn rebind(&mut self) {
        self.socket = bind_client_socket();
    }

    /// Encrypt and send one plaintext datagram.
    pub fn send_plain(&mut self, plain: &[u8]) {
        let mut wire = vec![0u8; plain.len() + CRYPT_OVERHEAD];
        let n = self.crypt.encrypt(plain, &mut wire).expect("encrypt");
        self.socket
            .send_to(&wire[..n], self.server)
            .expect("send datagram");
    }

    /// Send a voice packet to `target` with the given payload.
    pub fn send_voice(&mut self, target: u8, payload: &[u8]) {
        let mut plain = Vec::with_capacity(1 + payload.len());
        plain.push(1 << 5 | (target & 0x1F));
        plain.extend_from_slice(payload);
        self.send_plain(&plain);
    }

    pub fn ping(&mut self, payload: &[u8]) {
        let mut plain = Vec::with_capacity(1 + payload.len());
        plain.push(2 << 5);
        plain.extend_from_slice(payload);
        self.send_plain(&plain);
    }

    /// Send raw bytes without encryption, for hostile-input tests.
    pub fn send_raw(&mut self, wire: &[u8]) {
        self.socket.send_to(wire, self.server).expect("send raw");
    }

    /// Receive and decrypt one datagram.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        self.recv_within(RECV_TIMEOUT)
    }

    /// Receive with the short grace timeout; `None` once the stream is dry.
    pub fn recv_quick(&mut self) -> Option<Vec<u8>> {
        self.recv_within(SILENCE_TIMEOUT)
    }

    /// Assert nothing arrives for a grace period.
    pub fn expect_silence(&mut self) {
        if let Some(packet) = self.recv_within(SILENCE_TIMEOUT) {
            panic!("unexpected packet {packet:02x?}");
        }
    }

    fn recv_within(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        self.socket
            .set_read_timeout(Some(timeout))
            .expect("set timeout");
        let mut wire = [0u8; 1024];
        let mut plain = [0u8; 1024];
        match self.socket.recv(&mut wire) {
            Ok(n) => {
                let len = self
                    .crypt
                    .decrypt(&wire[..n], &mut plain)
                    .expect("decrypt received datagram");
                Some(plain[..len].to_vec())
            }
            Err(_) => None,
        }
    }
}

fn bind_client_socket() -> UdpSocket {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind client socket");
    socket
        .set_read_timeout(Some(RECV_TIMEOUT))
        .expect("set timeout");
    socket
}

/// The packet a recipient should see: delivery class and target in byte 0,
/// then the sender's session varint, then the payload.
pub fn expected_packet(class: u8, target: u8, sender: SessionId, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![class << 5 | target];
    write_varint(&mut out, u64::from(sender));
    out.extend_from_slice(payload);
    out
}
