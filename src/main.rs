//! voxd - low-latency group voice chat daemon.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use voxd::config::Config;
use voxd::control::{self, CONTROL_QUEUE_DEPTH};
use voxd::network::Gateway;
use voxd::state::{RuleSet, Switchboard};
use voxd::voice::{Transmitter, UdpReceiver, VoiceRouter};

/// Period of the idle-timeout sweep.
const SWEEP_PERIOD: Duration = Duration::from_millis(15_500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "voxd.toml".to_string());
    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "failed to load config");
        e
    })?;

    info!(
        bind = %config.server.bind,
        port = config.server.port,
        max_users = config.limits.max_users,
        "starting voxd"
    );

    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
    let board = Arc::new(Switchboard::new(
        config.limits.clone(),
        Arc::new(RuleSet::new()),
        control_tx.clone(),
    ));

    // The voice socket binds before anything is spawned: without it the
    // server is invalid and never starts the datapath.
    let voice_addr = SocketAddr::new(config.server.bind, config.server.port);
    let socket = Arc::new(UdpSocket::bind(voice_addr).map_err(|e| {
        error!(%voice_addr, error = %e, "voice socket bind failed");
        e
    })?);
    info!(%voice_addr, "voice datapath bound");

    let transmitter = Transmitter::new(Arc::clone(&socket), control_tx);
    let router = Arc::new(VoiceRouter::new(Arc::clone(&board), transmitter.clone()));
    let datapath = UdpReceiver::new(
        socket,
        Arc::clone(&board),
        Arc::clone(&router),
        transmitter,
    )
    .spawn()?;

    tokio::spawn(control::run_control_link(Arc::clone(&board), control_rx));
    tokio::spawn(idle_sweep(Arc::clone(&board)));

    let gateway = Gateway::bind(&config, Arc::clone(&board), router).await?;

    tokio::select! {
        result = gateway.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }

    board.shutdown();
    if datapath.join().is_err() {
        error!("voice datapath panicked");
    }
    info!("stopped");
    Ok(())
}

/// Disconnect users silent on both transports past the configured timeout.
async fn idle_sweep(board: Arc<Switchboard>) {
    let mut ticker = tokio::time::interval(SWEEP_PERIOD);
    loop {
        ticker.tick().await;
        if !board.is_running() {
            return;
        }
        for session in board.idle_sessions() {
            info!(session, "idle timeout");
            board.disconnect(session);
        }
    }
}
