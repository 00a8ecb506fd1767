//! Gateway - accepts control-channel connections.
//!
//! Binds the TCP listener, terminates TLS when configured, and spawns a
//! [`Connection`] task per client. Refusals that need no protocol — banned
//! address, full server — happen here, before any handshake work.

use crate::config::Config;
use crate::network::Connection;
use crate::state::Switchboard;
use crate::voice::router::VoiceRouter;
use anyhow::Context;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::ServerConfig as RustlsConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

pub struct Gateway {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    board: Arc<Switchboard>,
    router: Arc<VoiceRouter>,
    banned: Vec<IpAddr>,
    password: Option<String>,
}

impl Gateway {
    /// Bind the control listener per the configuration.
    pub async fn bind(
        config: &Config,
        board: Arc<Switchboard>,
        router: Arc<VoiceRouter>,
    ) -> anyhow::Result<Self> {
        let addr = SocketAddr::new(config.server.bind, config.server.port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("control listen on {addr} failed"))?;

        let tls = match &config.tls {
            Some(tls) => Some(load_acceptor(&tls.cert, &tls.key)?),
            None => {
                warn!("no TLS material configured; control channel is plaintext");
                None
            }
        };

        info!(%addr, tls = tls.is_some(), "control channel listening");
        Ok(Self {
            listener,
            tls,
            board,
            router,
            banned: config.banned.clone(),
            password: config.server.password.clone(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the switchboard stops running.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(error = %err, "accept failed");
                    continue;
                }
            };
            if !self.board.is_running() {
                return Ok(());
            }
            if self.banned.contains(&addr.ip()) {
                info!(%addr, "refusing banned address");
                continue;
            }
            let user = match self.board.connect(addr.ip()) {
                Ok(user) => user,
                Err(err) => {
                    info!(%addr, error = %err, "refusing connection");
                    continue;
                }
            };
            info!(session = user.session, %addr, "connection accepted");

            let board = Arc::clone(&self.board);
            let router = Arc::clone(&self.router);
            let tls = self.tls.clone();
            let password = self.password.clone();
            tokio::spawn(async move {
                let session = user.session;
                let connection = Connection::new(user, addr, board.clone(), router, password);
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => connection.run(stream).await,
                        Err(err) => {
                            warn!(session, %addr, error = %err, "tls handshake failed");
                            board.disconnect(session);
                            return;
                        }
                    },
                    None => connection.run(stream).await,
                };
                if let Err(err) = result {
                    warn!(session, %addr, error = %err, "connection error");
                }
            });
        }
    }
}

fn load_acceptor(cert: &std::path::Path, key: &std::path::Path) -> anyhow::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert).with_context(|| format!("open {}", cert.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("parse certificate chain")?;

    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key).with_context(|| format!("open {}", key.display()))?,
    ))
    .context("parse private key")?
    .context("no private key found")?;

    let config = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("assemble TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
