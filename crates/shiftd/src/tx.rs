//! TX path: reads frames from the `Tunnel`, drops oversize ones, marshals
//! and encrypt-sends the rest, and interleaves a jittered keepalive
//! schedule so the TCP path and the traffic pattern both stay alive when
//! the tunnel is idle.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use shift_core::{wire, Peer, PeerError};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::tunnel::Tunnel;

/// Runs the TX path until the frame producer's rendezvous closes or a
/// fatal error is posted to `errors`. Spawns the frame-producer task
/// itself; returns once this task's own loop exits.
pub async fn run<T: Tunnel>(
    tunnel: Arc<T>,
    peer: Arc<Peer>,
    errors: mpsc::Sender<anyhow::Error>,
    min_wait: Duration,
    max_wait: Duration,
) {
    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(16);
    spawn_producer(tunnel.clone(), frame_tx, errors.clone());

    loop {
        let wait = jittered_wait(min_wait, max_wait);
        tokio::select! {
            _ = sleep(wait) => {
                if let Err(e) = send_keepalive(&peer).await {
                    let _ = errors.send(anyhow::anyhow!("keepalive send failed: {e}")).await;
                    return;
                }
            }
            received = frame_rx.recv() => {
                match received {
                    Some(frame) => {
                        if let Err(e) = send_to_insert(tunnel.as_ref(), &peer, &frame).await {
                            let _ = errors.send(anyhow::anyhow!("frame send failed: {e}")).await;
                            return;
                        }
                    }
                    None => return, // producer closed the rendezvous (already reported, or shutting down)
                }
            }
        }
    }
}

/// Repeatedly reads frames from the Tunnel and forwards them over the
/// bounded rendezvous. Exits, reporting the error, on the first read
/// failure; exits quietly if the rendezvous receiver is gone.
fn spawn_producer<T: Tunnel>(
    tunnel: Arc<T>,
    frame_tx: mpsc::Sender<Vec<u8>>,
    errors: mpsc::Sender<anyhow::Error>,
) {
    tokio::spawn(async move {
        loop {
            match tunnel.read().await {
                Ok(frame) => {
                    if frame_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = errors.send(anyhow::anyhow!("tunnel read failed: {e}")).await;
                    return;
                }
            }
        }
    });
}

fn jittered_wait(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..max)
}

/// Sends a zero-length record: an ordinary, validly-hashed `Record` with
/// an empty payload. See SPEC_FULL.md's resolution of the keepalive
/// framing ambiguity for why this shape was chosen over one carrying a
/// random-size random payload.
async fn send_keepalive(peer: &Peer) -> Result<(), PeerError> {
    let record = wire::marshal(&[]).expect("empty payload is always within MAX_FRAME_LEN");
    tracing::trace!("sending keepalive");
    peer.send_enc(&record).await
}

async fn send_to_insert<T: Tunnel>(
    tunnel: &T,
    peer: &Peer,
    frame: &[u8],
) -> Result<(), PeerError> {
    if frame.len() > tunnel.max_frame_len() {
        tracing::warn!(
            len = frame.len(),
            max = tunnel.max_frame_len(),
            "dropping frame larger than the tunnel allows"
        );
        return Ok(());
    }
    let record = match wire::marshal(frame) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(len = frame.len(), error = %e, "dropping frame the protocol can't carry");
            return Ok(());
        }
    };
    peer.send_enc(&record).await
}
