//! shiftd — the daemon binary's library half: configuration, the Tunnel
//! capability and its implementations, and the TX/RX/Supervisor runtime
//! that drives one session over a `shift_core::Peer`.

pub mod config;
pub mod rx;
pub mod supervisor;
pub mod tunnel;
pub mod tx;

pub use config::{Cli, Config, ConfigError};
