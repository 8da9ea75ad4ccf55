//! shift-core — the wire protocol engine: Cryptor, Framer, and Peer.
//!
//! No Tunnel, no CLI, no config file parsing — those live in `shiftd`. This
//! crate only knows how to turn a pre-shared key and a freshly-arrived
//! nonce into two keystreams, frame and verify records, and run the
//! handshake over a `tokio::net::TcpStream`.

pub mod crypto;
pub mod peer;
pub mod wire;

pub use peer::{HandshakeOptions, IpFamily, Peer, PeerError};
