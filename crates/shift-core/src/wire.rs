//! The on-wire record format: `len:u16_be || payload || SHA-224(len||payload)`.
//!
//! Marshalling is a single call; unmarshalling is deliberately not, because
//! the receiver must sequence three encrypted reads (length, payload, hash)
//! through its Cryptor rather than buffer a whole record before decrypting
//! it. See `shiftd`'s RX task for that half.

use sha2::{Digest, Sha224};
use subtle::ConstantTimeEq;

/// Records longer than this are unrepresentable on the wire — the length
/// field is a big-endian `u16`.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// SHA-224 digest length in bytes.
pub const HASH_LEN: usize = 28;

/// Length of the big-endian length prefix.
pub const LEN_FIELD_LEN: usize = 2;

/// Expected MTU ceiling; a Tunnel's `max_frame_len()` must stay within
/// `2 * MTU_WARN`.
pub const MTU_WARN: usize = 1 << 14;

/// Errors raised while marshalling a frame for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds the protocol's {max}-byte maximum")]
    TooLong { len: usize, max: usize },
}

/// Build `len_be16 || frame || SHA224(len_be16 || frame)`.
pub fn marshal(frame: &[u8]) -> Result<Vec<u8>, WireError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(WireError::TooLong {
            len: frame.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let len_be = (frame.len() as u16).to_be_bytes();
    let hash = record_hash(&len_be, frame);

    let mut out = Vec::with_capacity(LEN_FIELD_LEN + frame.len() + HASH_LEN);
    out.extend_from_slice(&len_be);
    out.extend_from_slice(frame);
    out.extend_from_slice(&hash);
    Ok(out)
}

/// SHA-224 over `len_be || payload` — the value every record's trailing
/// hash must equal for the record to be accepted.
pub fn record_hash(len_be: &[u8; LEN_FIELD_LEN], payload: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha224::new();
    hasher.update(len_be);
    hasher.update(payload);
    hasher.finalize().into()
}

/// Constant-time byte equality. Never short-circuits on the first
/// differing byte — used for both the hash check (RX path) and the name
/// round-trip check (handshake), since both compare secrets or
/// secret-derived material against attacker-influenced input.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
