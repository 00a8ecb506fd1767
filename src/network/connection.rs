//! Connection - one client's control channel.
//!
//! The stream splits into a writer task draining the session's frame queue
//! (the same queue the control link feeds with tunneled voice and resync
//! requests) and an inline read loop dispatching the small control surface:
//! version exchange, authentication, ping, crypt setup, and tunneled voice.

use crate::crypto::CryptMaterial;
use crate::network::frame::{self, ControlCodec, ControlFrame};
use crate::state::{ServerUser, Switchboard};
use crate::voice::proto::{self, MAX_DATAGRAM};
use crate::voice::router::VoiceRouter;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, instrument, warn};

/// Wire protocol revision announced in the Version frame.
const PROTOCOL_VERSION: u32 = 3;

/// Depth of the per-session writer queue.
const WRITER_QUEUE: usize = 64;

pub struct Connection {
    user: Arc<ServerUser>,
    addr: SocketAddr,
    board: Arc<Switchboard>,
    router: Arc<VoiceRouter>,
    password: Option<String>,
}

impl Connection {
    pub fn new(
        user: Arc<ServerUser>,
        addr: SocketAddr,
        board: Arc<Switchboard>,
        router: Arc<VoiceRouter>,
        password: Option<String>,
    ) -> Self {
        Self {
            user,
            addr,
            board,
            router,
            password,
        }
    }

    /// Run the connection until the peer goes away or is rejected.
    #[instrument(skip_all, fields(session = self.user.session, addr = %self.addr), name = "control")]
    pub async fn run<S>(self, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = self.user.session;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, ControlCodec::new());

        // The writer task is the sole consumer of the session's frame
        // queue; registering the sender makes the session reachable for
        // tunneled voice and resync solicitations.
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ControlFrame>(WRITER_QUEUE);
        self.board.senders.insert(session, outgoing_tx.clone());

        let write_handle = tokio::spawn(async move {
            let mut writer = FramedWrite::new(write_half, ControlCodec::new());
            while let Some(frame) = outgoing_rx.recv().await {
                if writer.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let version = ControlFrame::new(
            frame::VERSION,
            Bytes::copy_from_slice(&PROTOCOL_VERSION.to_be_bytes()),
        );
        let _ = outgoing_tx.send(version).await;

        // The liveness tick notices when the idle sweep or shutdown tore
        // the session down while the peer was silent.
        let mut liveness = tokio::time::interval(std::time::Duration::from_secs(5));
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let next = tokio::select! {
                next = reader.next() => next,
                _ = liveness.tick() => {
                    if !self.board.is_running() || self.board.get_user(session).is_none() {
                        break;
                    }
                    continue;
                }
            };
            let incoming = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    warn!(error = %err, "control read failed");
                    break;
                }
                None => break,
            };
            match self.dispatch(&incoming, &outgoing_tx).await {
                Ok(false) => {}
                Ok(true) => break,
                Err(err) => {
                    warn!(error = %err, "control dispatch failed");
                    break;
                }
            }
        }

        // Idempotent against the idle sweep and shutdown.
        self.board.disconnect(session);
        drop(outgoing_tx);
        let _ = write_handle.await;
        info!("connection closed");
        Ok(())
    }

    /// Handle one inbound frame. `Ok(true)` ends the connection.
    async fn dispatch(
        &self,
        incoming: &ControlFrame,
        out: &mpsc::Sender<ControlFrame>,
    ) -> anyhow::Result<bool> {
        match incoming.kind {
            frame::VERSION => {
                debug!(payload = incoming.payload.len(), "client version");
                Ok(false)
            }
            frame::AUTHENTICATE => self.authenticate(&incoming.payload, out).await,
            frame::PING => {
                self.user.touch_activity();
                let _ = out
                    .send(ControlFrame::new(frame::PING, incoming.payload.clone()))
                    .await;
                Ok(false)
            }
            frame::CRYPT_SETUP => {
                // The client lost datagram sync: issue fresh material.
                if self.user.is_authenticated() {
                    debug!("client requested crypt resync");
                    self.issue_crypt_setup(out).await;
                }
                Ok(false)
            }
            frame::UDP_TUNNEL => {
                self.tunnel_voice(&incoming.payload);
                Ok(false)
            }
            other => {
                debug!(kind = other, "ignoring unknown control frame");
                Ok(false)
            }
        }
    }

    async fn authenticate(
        &self,
        payload: &Bytes,
        out: &mpsc::Sender<ControlFrame>,
    ) -> anyhow::Result<bool> {
        if self.user.is_authenticated() {
            return Ok(false);
        }
        let Ok(text) = std::str::from_utf8(payload) else {
            return self.reject(out, "malformed login").await;
        };
        let (name, offered_password) = match text.split_once('\n') {
            Some((name, password)) => (name, Some(password)),
            None => (text, None),
        };
        if name.is_empty() || name.len() > 128 {
            return self.reject(out, "invalid name").await;
        }
        if let Some(required) = &self.password {
            if offered_password != Some(required.as_str()) {
                return self.reject(out, "wrong server password").await;
            }
        }
        self.board.authenticate(self.user.session, name)?;
        self.issue_crypt_setup(out).await;

        let mut sync = BytesMut::with_capacity(4);
        sync.put_u32(self.user.session);
        let _ = out
            .send(ControlFrame::new(frame::SERVER_SYNC, sync.freeze()))
            .await;
        Ok(false)
    }

    async fn reject(&self, out: &mpsc::Sender<ControlFrame>, reason: &str) -> anyhow::Result<bool> {
        info!(reason, "rejecting login");
        let _ = out
            .send(ControlFrame::new(
                frame::REJECT,
                Bytes::copy_from_slice(reason.as_bytes()),
            ))
            .await;
        Ok(true)
    }

    /// Generate fresh datagram cipher material, install it for this
    /// session, and ship it to the client.
    async fn issue_crypt_setup(&self, out: &mpsc::Sender<ControlFrame>) {
        let material = CryptMaterial::generate();
        self.user.crypt.lock().unwrap().set_material_server(&material);

        let mut payload = BytesMut::with_capacity(48);
        payload.extend_from_slice(&material.key);
        payload.put_u64(material.server_nonce);
        payload.put_u64(material.client_nonce);
        let _ = out
            .send(ControlFrame::new(frame::CRYPT_SETUP, payload.freeze()))
            .await;
    }

    /// Voice arriving through the control channel instead of UDP.
    fn tunnel_voice(&self, payload: &Bytes) {
        if !self.user.is_authenticated() {
            return;
        }
        if payload.is_empty() || payload.len() > MAX_DATAGRAM - crate::crypto::CRYPT_OVERHEAD {
            return;
        }
        self.user.set_prefers_udp(false);
        self.user.touch_activity();
        if proto::message_type(payload[0]) == proto::UDP_TYPE_VOICE {
            let world = self.board.world.read().unwrap();
            if let Err(reason) = self.router.route(&world, &self.user, payload) {
                debug!(reason = reason.code(), "tunneled voice dropped");
            }
        }
    }
}
