//! The `Tunnel` capability — the core's only interface to the host
//! kernel's TUN/TAP device. Modeled as a trait so the protocol engine
//! (`shift-core`) never names a device type; see `linux` for the concrete
//! Linux TAP driver and `loopback` for the in-process test double used by
//! the integration harness.

pub mod linux;
pub mod loopback;

use async_trait::async_trait;

/// One Ethernet frame, read from or destined for the kernel.
pub type Frame = Vec<u8>;

/// Platform handle to a TUN/TAP-like device.
///
/// `read()` is called only by the TX path's frame producer; `write()` only
/// by the RX path. Neither call synchronizes with the other, but an
/// implementation is shared (`Arc`) across the two tasks issuing them, so
/// it must tolerate concurrent calls to its two different methods.
#[async_trait]
pub trait Tunnel: Send + Sync + 'static {
    /// Blocks until one Ethernet frame is available.
    async fn read(&self) -> std::io::Result<Frame>;

    /// Blocks until `frame` has been handed to the kernel.
    async fn write(&self, frame: &[u8]) -> std::io::Result<()>;

    /// Upper bound on frame size. Always `<= 2 * shift_core::wire::MTU_WARN`.
    fn max_frame_len(&self) -> usize;

    /// Idempotent; may also tear down the kernel interface.
    fn close(&self) -> std::io::Result<()>;
}
