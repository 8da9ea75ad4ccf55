//! In-process `Tunnel` test double.
//!
//! `LoopbackTunnel::new` returns a `Tunnel` the TX/RX paths can drive
//! exactly like a kernel device, plus a `Handle` the test harness uses to
//! inject frames (as if the host wanted to transmit them) and observe
//! delivered frames (as if the host had received them) — without a real
//! TAP device or root.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{Frame, Tunnel};

/// The `Tunnel` half, driven by the TX/RX tasks.
pub struct LoopbackTunnel {
    /// Frames the test injects for the TX path's `read()` to pick up.
    outbound: Mutex<mpsc::Receiver<Frame>>,
    /// Frames the RX path's `write()` delivers to the test.
    inbound: mpsc::Sender<Frame>,
    max_frame_len: usize,
}

/// The test-side half, paired with one `LoopbackTunnel`.
pub struct Handle {
    inject: mpsc::Sender<Frame>,
    delivered: Mutex<mpsc::Receiver<Frame>>,
}

impl LoopbackTunnel {
    /// Builds one `Tunnel` plus the `Handle` used to drive it from a test.
    pub fn new(max_frame_len: usize) -> (Self, Handle) {
        let (inject_tx, outbound_rx) = mpsc::channel(16);
        let (inbound_tx, delivered_rx) = mpsc::channel(16);
        (
            LoopbackTunnel {
                outbound: Mutex::new(outbound_rx),
                inbound: inbound_tx,
                max_frame_len,
            },
            Handle {
                inject: inject_tx,
                delivered: Mutex::new(delivered_rx),
            },
        )
    }
}

impl Handle {
    /// Simulates the host wanting to transmit `frame`.
    pub async fn inject(&self, frame: Frame) {
        self.inject.send(frame).await.expect("tunnel task exited");
    }

    /// Waits for the next frame the RX path delivered to the host, if any
    /// arrives before the channel is dropped.
    pub async fn recv_delivered(&self) -> Option<Frame> {
        self.delivered.lock().await.recv().await
    }
}

#[async_trait]
impl Tunnel for LoopbackTunnel {
    async fn read(&self) -> std::io::Result<Frame> {
        self.outbound.lock().await.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "loopback tunnel closed")
        })
    }

    async fn write(&self, frame: &[u8]) -> std::io::Result<()> {
        self.inbound.send(frame.to_vec()).await.map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "loopback tunnel closed")
        })
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}
