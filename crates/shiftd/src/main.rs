//! `shiftd` — local half of a two-party Layer-2 tunnel. Parses flags and an
//! optional config file, opens the local TAP device, performs the
//! handshake with the remote peer, then runs the session until a fatal
//! error tears it down.

use std::process::ExitCode;

use clap::Parser;
use shift_core::{HandshakeOptions, Peer, PeerError};
use shiftd::config::ConfigError;
use shiftd::tunnel::linux::LinuxTunTap;
use shiftd::{supervisor, Cli, Config};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    rt.block_on(run())
}

async fn run() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::resolve(cli) {
        Ok(c) => c,
        Err(e @ ConfigError::ConflictingIpFamily) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(252); // -4
        }
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(251); // -5
        }
    };

    let max_frame_len = 2 * shift_core::wire::MTU_WARN;
    let tunnel = match LinuxTunTap::open(&config.tun_name, max_frame_len) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "failed to create tunnel device");
            return ExitCode::from(255); // -1
        }
    };
    tracing::info!(name = tunnel.name(), "tunnel device up");

    let opts = HandshakeOptions {
        addr: config.addr.clone(),
        connect: config.connect,
        ip_family: config.ip_family,
        junk: config.junk.clone(),
        key: config.key,
        time_offset: config.time_offset,
        name: config.name.clone(),
        name_len: config.name_len,
    };

    let peer = match Peer::establish(opts).await {
        Ok(p) => p,
        Err(e @ (PeerError::NameTooShort { .. } | PeerError::NameMismatch { .. })) => {
            tracing::error!(error = %e, "handshake failed");
            return ExitCode::from(253); // -3
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to establish connection to peer");
            return ExitCode::from(254); // -2
        }
    };

    let fatal = supervisor::run(
        std::sync::Arc::new(tunnel),
        std::sync::Arc::new(peer),
        config.ka_min_wait,
        config.ka_max_wait,
    )
    .await;

    tracing::error!(error = %fatal, "session terminated");
    ExitCode::FAILURE
}
