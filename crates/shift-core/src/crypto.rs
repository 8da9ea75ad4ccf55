//! Cryptographic primitives for the shift wire protocol.
//!
//! Provides the time-warped ChaCha20 keying scheme: a shared 32-byte key, an
//! 8-byte nonce exchanged cleartext by the remote peer, and the local
//! reception time combine into two independent keystreams, one per
//! direction. There is no key agreement here — the key is pre-shared — and
//! no unsafe code in this module.

use chacha20::cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher};
use chacha20::ChaCha20Legacy;

/// Length in bytes of the pre-shared key.
pub const KEY_LEN: usize = 32;

/// Length in bytes of the nonce exchanged cleartext at handshake time.
pub const NONCE_LEN: usize = 8;

/// A single direction's ChaCha20 stream.
///
/// Not thread-safe: the caller must serialize access (see `Peer`'s
/// per-direction locks). Encryption and decryption are the same XOR
/// operation, applied to successive keystream bytes in call order.
pub struct Cryptor(ChaCha20Legacy);

impl Cryptor {
    fn new(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Self {
        let key = GenericArray::from_slice(key);
        let nonce = GenericArray::from_slice(nonce);
        Cryptor(ChaCha20Legacy::new(key, nonce))
    }

    /// XOR-applies the next `buf.len()` keystream bytes in place.
    pub fn crypt(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}

/// Derive the tx/rx Cryptor pair from a pre-shared key, the nonce the remote
/// peer sent cleartext, and the local wall-clock time (plus any configured
/// offset) at which that nonce was received.
///
/// `tx` is this side's outbound stream, `rx` its inbound stream. The two
/// differ only in the low two bits of the timed nonce's first byte, which
/// keeps them from ever producing the same keystream.
pub fn new_cryptor_pair(
    key: &[u8; KEY_LEN],
    nonce: [u8; NONCE_LEN],
    when: i64,
) -> (Cryptor, Cryptor) {
    let timed = timed_nonce(nonce, when);
    tracing::debug!(timed_nonce = %hex::encode(timed), "time-adjusted nonce");

    let mut tx_nonce = timed;
    tx_nonce[0] &= 0xFC;
    let tx = Cryptor::new(key, &tx_nonce);

    let mut rx_nonce = timed;
    rx_nonce[0] |= 0x03;
    let rx = Cryptor::new(key, &rx_nonce);

    (tx, rx)
}

/// `timed[i] = nonce[i] XOR ((when >> 8i) & 0xFF)`.
fn timed_nonce(nonce: [u8; NONCE_LEN], when: i64) -> [u8; NONCE_LEN] {
    let mut timed = [0u8; NONCE_LEN];
    for i in 0..NONCE_LEN {
        timed[i] = nonce[i] ^ (((when >> (8 * i)) & 0xFF) as u8);
    }
    timed
}
