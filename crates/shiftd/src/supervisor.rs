//! Supervisor — wires the `Tunnel` and `Peer` together, spawns the TX and
//! RX paths, and waits for the first fatal error from either.

use std::sync::Arc;
use std::time::Duration;

use shift_core::Peer;
use tokio::sync::mpsc;

use crate::tunnel::Tunnel;
use crate::{rx, tx};

/// Runs one session to completion: spawns TX and RX over `tunnel` and
/// `peer`, waits for the first fatal error either posts, then closes both.
/// There is no reconnect — a session that ends is the caller's to restart.
pub async fn run<T: Tunnel>(
    tunnel: Arc<T>,
    peer: Arc<Peer>,
    ka_min_wait: Duration,
    ka_max_wait: Duration,
) -> anyhow::Error {
    let (error_tx, mut error_rx) = mpsc::channel::<anyhow::Error>(4);

    tokio::spawn(tx::run(
        tunnel.clone(),
        peer.clone(),
        error_tx.clone(),
        ka_min_wait,
        ka_max_wait,
    ));

    {
        let tunnel = tunnel.clone();
        let peer = peer.clone();
        let error_tx = error_tx.clone();
        tokio::spawn(async move {
            rx::run(tunnel.as_ref(), peer.as_ref(), error_tx).await;
        });
    }
    drop(error_tx);

    let fatal = error_rx.recv().await.unwrap_or_else(|| {
        anyhow::anyhow!("all session tasks exited without reporting an error")
    });

    tracing::error!(error = %fatal, "session ending, tearing down");
    peer.close();
    if let Err(e) = tunnel.close() {
        tracing::warn!(error = %e, "error closing tunnel");
    }

    fatal
}
