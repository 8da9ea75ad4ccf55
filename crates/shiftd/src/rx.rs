//! RX path: reads a length-prefixed, hashed record from the `Peer` and
//! writes the verified payload to the `Tunnel`.
//!
//! Unmarshalling is not one call (see `shift_core::wire`'s module docs) —
//! the three reads (length, payload, hash) are sequenced here, each
//! through `Peer::recv_enc`, so the Cryptor consumes keystream bytes in
//! the same order they arrive on the wire.

use shift_core::{wire, Peer};
use tokio::sync::mpsc;

use crate::tunnel::Tunnel;

/// Fatal RX-path errors. Either one desynchronizes the stream — there is
/// no way to resume mid-record — so both terminate the session.
#[derive(Debug, thiserror::Error)]
pub enum RxError {
    #[error("received record length {len} exceeds the tunnel's {max}-byte limit")]
    TooBig { len: usize, max: usize },
    #[error("checksum mismatch on a received record")]
    BadChecksum,
    #[error(transparent)]
    Peer(#[from] shift_core::PeerError),
    #[error("writing to tunnel: {0}")]
    TunnelWrite(#[source] std::io::Error),
}

/// Runs the RX loop until a fatal error occurs, reporting it to `errors`
/// and returning.
pub async fn run<T: Tunnel>(tunnel: &T, peer: &Peer, errors: mpsc::Sender<anyhow::Error>) {
    loop {
        if let Err(e) = recv_one(tunnel, peer).await {
            let _ = errors.send(anyhow::anyhow!("rx failed: {e}")).await;
            return;
        }
    }
}

async fn recv_one<T: Tunnel>(tunnel: &T, peer: &Peer) -> Result<(), RxError> {
    let len_bytes = peer.recv_enc(wire::LEN_FIELD_LEN).await?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;

    if len > tunnel.max_frame_len() {
        return Err(RxError::TooBig {
            len,
            max: tunnel.max_frame_len(),
        });
    }

    let payload = peer.recv_enc(len).await?;
    let received_hash = peer.recv_enc(wire::HASH_LEN).await?;

    let len_be: [u8; wire::LEN_FIELD_LEN] = [len_bytes[0], len_bytes[1]];
    let expected_hash = wire::record_hash(&len_be, &payload);
    if !wire::ct_eq(&expected_hash, &received_hash) {
        return Err(RxError::BadChecksum);
    }

    // A zero-length payload is a keepalive: the write below is then a
    // genuine no-op, exactly as spec'd.
    tunnel.write(&payload).await.map_err(RxError::TunnelWrite)?;
    Ok(())
}
