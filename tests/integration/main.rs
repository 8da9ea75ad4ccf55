//! shift integration test harness.
//!
//! `shift` is only the *local* half of the tunnel — the remote "insert"
//! peer is a separate program, not part of this workspace, and it keys its
//! Cryptors with the mirror-image direction bits (`shift-core/src/crypto.rs`
//! fixes `tx` to the shift→insert direction and `rx` to insert→shift; an
//! `insert` implementation assigns those the other way around). Pairing two
//! `shift_core::Peer`s against each other therefore cannot complete a
//! handshake: both ends would derive the same pair of keystreams from their
//! own perspective, and neither would originate the nonce.
//!
//! `FakeInsert` below is a from-scratch test double that plays exactly the
//! steps spec.md assigns to `insert`: it discards the cleartext junk
//! banner, originates the nonce, derives the mirrored Cryptor pair from the
//! same `(key, nonce, when)`, and completes the name round-trip. Real
//! `shift_core::Peer`s under test connect to it over loopback TCP; a
//! `LoopbackTunnel` stands in for the kernel TAP device on the `shift` side
//! so frames can be injected and observed without root or a real interface.

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use shift_core::crypto::{new_cryptor_pair, Cryptor, KEY_LEN, NONCE_LEN};
use shift_core::wire::{self, ct_eq, record_hash, HASH_LEN, LEN_FIELD_LEN};
use shift_core::{HandshakeOptions, IpFamily, Peer, PeerError};
use shiftd::tunnel::loopback::LoopbackTunnel;
use shiftd::{rx, tx};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const JUNK: &[u8] = b"GET / HTTP/1.1\r\n";
const NONCE: [u8; NONCE_LEN] = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];

fn key32(s: &str) -> [u8; KEY_LEN] {
    s.as_bytes()
        .try_into()
        .expect("test key literal must be exactly 32 bytes")
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

/// Binds an ephemeral loopback port and returns the listener plus its
/// address string, ready for a `shift` peer to `connect` to.
async fn bind_ephemeral() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding an ephemeral loopback port should not fail");
    let addr = listener
        .local_addr()
        .expect("a bound listener has a local address");
    (listener, addr.to_string())
}

/// `shift`-side handshake options for a peer under test. Always dials out
/// (`connect: true`) to the `FakeInsert` listener.
fn shift_opts(
    addr: String,
    key: [u8; KEY_LEN],
    name: &str,
    name_len: usize,
    time_offset: i64,
) -> HandshakeOptions {
    HandshakeOptions {
        addr,
        connect: true,
        ip_family: IpFamily::Any,
        junk: JUNK.to_vec(),
        key,
        time_offset,
        name: name.to_string(),
        name_len,
    }
}

/// A minimal stand-in for the real, separately-implemented `insert` peer.
/// Plays exactly the steps spec.md §4.3 assigns to `insert`: discards the
/// junk banner, originates the nonce cleartext, derives the mirrored
/// Cryptor pair from `new_cryptor_pair`'s output (its outbound stream is
/// `shift`'s `rx` construction and vice versa — see `crypto.rs`'s direction
/// bits), and completes the name round-trip.
struct FakeInsert {
    stream: TcpStream,
    tx: Cryptor,
    rx: Cryptor,
}

impl FakeInsert {
    /// Accepts one connection on `listener` and runs the insert side of the
    /// handshake: read `junk.len()` bytes of cleartext junk, write `nonce`
    /// cleartext, derive Cryptors from `(key, nonce, when)`, then receive
    /// `name_len` bytes from the peer and send back `name` padded to the
    /// same length.
    async fn accept_and_handshake(
        listener: TcpListener,
        key: [u8; KEY_LEN],
        name: &str,
        name_len: usize,
    ) -> io::Result<Self> {
        let (stream, _) = listener.accept().await?;

        let mut junk = vec![0u8; JUNK.len()];
        {
            let mut r = &stream;
            r.read_exact(&mut junk).await?;
        }

        let when = unix_now();
        {
            let mut w = &stream;
            w.write_all(&NONCE).await?;
        }

        // `new_cryptor_pair`'s `.0` is always the shift→insert stream and
        // `.1` always insert→shift, regardless of which side calls it —
        // `insert`'s own outbound direction is the latter, its inbound the
        // former.
        let (shift_to_insert, insert_to_shift) = new_cryptor_pair(&key, NONCE, when);
        let mut fake = FakeInsert {
            stream,
            tx: insert_to_shift,
            rx: shift_to_insert,
        };

        let mut padded = name.as_bytes().to_vec();
        padded.resize(name_len, 0);

        let _received = fake.recv_enc(name_len).await?;
        fake.send_enc(&padded).await?;

        Ok(fake)
    }

    async fn send_enc(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut owned = buf.to_vec();
        self.tx.crypt(&mut owned);
        let mut w = &self.stream;
        w.write_all(&owned).await
    }

    async fn recv_enc(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let mut r = &self.stream;
        r.read_exact(&mut buf).await?;
        self.rx.crypt(&mut buf);
        Ok(buf)
    }

    /// Reads one full `Record` (length, payload, hash) and returns the
    /// payload once the trailing hash has been verified.
    async fn recv_record(&mut self) -> io::Result<Vec<u8>> {
        let len_bytes = self.recv_enc(LEN_FIELD_LEN).await?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let payload = self.recv_enc(len).await?;
        let hash = self.recv_enc(HASH_LEN).await?;

        let expected = record_hash(&[len_bytes[0], len_bytes[1]], &payload);
        if !ct_eq(&expected, &hash) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad checksum"));
        }
        Ok(payload)
    }
}

// ── S1 ───────────────────────────────────────────────────────────────────

/// Establishes that a real `shift` peer and `FakeInsert`, with matching
/// key/name/clock, complete the handshake — the baseline every other
/// scenario's *failure* is measured against.
#[tokio::test]
async fn handshake_happy_path() {
    let (listener, addr) = bind_ephemeral().await;
    let key = key32("012345678901234567890123456789AB");

    let insert_fut = FakeInsert::accept_and_handshake(listener, key, "0001", 1024);
    let shift_fut = Peer::establish(shift_opts(addr, key, "0001", 1024, 0));

    let (insert_result, shift_result) = tokio::join!(insert_fut, shift_fut);
    insert_result.expect("fake insert should complete its side of the handshake");
    let peer = shift_result.expect("shift peer should complete the handshake");
    assert!(peer.remote_addr().ip().is_loopback());
}

// ── S2 ───────────────────────────────────────────────────────────────────

/// With the handshake mechanics themselves proven correct by S1, a name
/// mismatch alone — not a broken harness — must now be what fails it.
#[tokio::test]
async fn name_mismatch_is_rejected() {
    let (listener, addr) = bind_ephemeral().await;
    let key = key32("012345678901234567890123456789AB");

    let insert_fut = FakeInsert::accept_and_handshake(listener, key, "0002", 1024);
    let shift_fut = Peer::establish(shift_opts(addr, key, "0001", 1024, 0));

    let (insert_result, shift_result) = tokio::join!(insert_fut, shift_fut);
    insert_result.expect("fake insert should still complete its own steps");
    assert!(matches!(shift_result, Err(PeerError::NameMismatch { .. })));
}

// ── S3 ───────────────────────────────────────────────────────────────────

/// Same matching key and name as S1 — only `time_offset` differs — so a
/// failure here is attributable to clock skew alone.
#[tokio::test]
async fn clock_skew_breaks_the_name_round_trip() {
    let (listener, addr) = bind_ephemeral().await;
    let key = key32("012345678901234567890123456789AB");

    let insert_fut = FakeInsert::accept_and_handshake(listener, key, "0001", 1024);
    let shift_fut = Peer::establish(shift_opts(addr, key, "0001", 1024, 3600));

    let (insert_result, shift_result) = tokio::join!(insert_fut, shift_fut);
    insert_result.expect("fake insert should still complete its own steps");
    assert!(matches!(shift_result, Err(PeerError::NameMismatch { .. })));
}

// ── S4 ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn frame_round_trip_within_one_second() {
    let (listener, addr) = bind_ephemeral().await;
    let key = key32("012345678901234567890123456789AB");

    let insert_fut = FakeInsert::accept_and_handshake(listener, key, "0001", 1024);
    let shift_fut = Peer::establish(shift_opts(addr, key, "0001", 1024, 0));
    let (insert, peer) = tokio::join!(insert_fut, shift_fut);
    let mut insert = insert.expect("fake insert handshake");
    let peer = Arc::new(peer.expect("shift peer handshake"));

    let (tunnel, handle) = LoopbackTunnel::new(4096);
    let tunnel = Arc::new(tunnel);

    // Keepalives stay out of the way — the jitter window never elapses
    // during this test.
    let never = Duration::from_secs(3600);
    let (err_tx, _err_rx) = mpsc::channel(4);
    tokio::spawn(tx::run(tunnel, peer, err_tx, never, never));

    let frame = vec![0xABu8; 100];
    handle.inject(frame.clone()).await;

    let delivered = timeout(Duration::from_secs(1), insert.recv_record())
        .await
        .expect("frame should be delivered within 1s")
        .expect("record should be well-formed");
    assert_eq!(delivered, frame);
}

// ── S5 ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn oversize_frame_is_dropped_and_session_continues() {
    let (listener, addr) = bind_ephemeral().await;
    let key = key32("012345678901234567890123456789AB");

    let insert_fut = FakeInsert::accept_and_handshake(listener, key, "0001", 1024);
    let shift_fut = Peer::establish(shift_opts(addr, key, "0001", 1024, 0));
    let (insert, peer) = tokio::join!(insert_fut, shift_fut);
    let mut insert = insert.expect("fake insert handshake");
    let peer = Arc::new(peer.expect("shift peer handshake"));

    // Large enough that the Tunnel itself accepts the read; the drop has
    // to come from the protocol's 65535-byte record limit, not the
    // device's own MTU ceiling.
    let (tunnel, handle) = LoopbackTunnel::new(70_000);
    let tunnel = Arc::new(tunnel);

    let never = Duration::from_secs(3600);
    let (err_tx, mut err_rx) = mpsc::channel(4);
    tokio::spawn(tx::run(tunnel, peer, err_tx, never, never));

    handle.inject(vec![0u8; 70_000]).await;
    handle.inject(vec![0xCDu8; 50]).await;

    let delivered = timeout(Duration::from_secs(1), insert.recv_record())
        .await
        .expect("the normal frame following the oversize one should still arrive")
        .expect("record should be well-formed");
    assert_eq!(delivered, vec![0xCDu8; 50]);
    assert!(
        err_rx.try_recv().is_err(),
        "an oversize frame must not be reported as a fatal session error"
    );
}

// ── S6 ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn corrupted_record_is_reported_as_bad_checksum() {
    let (listener, addr) = bind_ephemeral().await;
    let key = key32("012345678901234567890123456789AB");

    let insert_fut = FakeInsert::accept_and_handshake(listener, key, "0001", 1024);
    let shift_fut = Peer::establish(shift_opts(addr, key, "0001", 1024, 0));
    let (insert, peer) = tokio::join!(insert_fut, shift_fut);
    let mut insert = insert.expect("fake insert handshake");
    let peer = peer.expect("shift peer handshake");

    let (tunnel, _handle) = LoopbackTunnel::new(4096);
    let (err_tx, mut err_rx) = mpsc::channel(4);
    tokio::spawn(async move {
        rx::run(&tunnel, &peer, err_tx).await;
    });

    let mut record = wire::marshal(b"hello").unwrap();
    record[LEN_FIELD_LEN] ^= 0xFF;
    insert
        .send_enc(&record)
        .await
        .expect("sending the corrupted record itself should succeed");

    let err = timeout(Duration::from_secs(1), err_rx.recv())
        .await
        .expect("rx should report the checksum failure promptly")
        .expect("error channel still open");
    assert!(
        err.to_string().contains("checksum"),
        "unexpected error: {err}"
    );
}

// ── S7 ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn idle_tunnel_still_emits_jittered_keepalives() {
    let (listener, addr) = bind_ephemeral().await;
    let key = key32("012345678901234567890123456789AB");

    let insert_fut = FakeInsert::accept_and_handshake(listener, key, "0001", 1024);
    let shift_fut = Peer::establish(shift_opts(addr, key, "0001", 1024, 0));
    let (insert, peer) = tokio::join!(insert_fut, shift_fut);
    let mut insert = insert.expect("fake insert handshake");
    let peer = Arc::new(peer.expect("shift peer handshake"));

    let (tunnel, _handle) = LoopbackTunnel::new(4096);
    let tunnel = Arc::new(tunnel);

    let (err_tx, _err_rx) = mpsc::channel(4);
    tokio::spawn(tx::run(
        tunnel,
        peer,
        err_tx,
        Duration::from_millis(100),
        Duration::from_millis(200),
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    let mut count = 0;
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match timeout(remaining, insert.recv_record()).await {
            Ok(Ok(payload)) => {
                assert!(payload.is_empty(), "a keepalive must never carry a payload");
                count += 1;
            }
            _ => break,
        }
    }
    assert!(
        count >= 3,
        "expected at least 3 keepalives within 1s of idle time, got {count}"
    );
}

// ── Property 5 ─────────────────────────────────────────────────────────

/// Concurrent `send_enc` calls on one `Peer` must not interleave: the
/// tx-lock spans encrypt+write, so the wire sees the N buffers whole, in
/// some order, never with bytes from two calls mixed into one record.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_send_enc_calls_never_interleave() {
    let (listener, addr) = bind_ephemeral().await;
    let key = key32("012345678901234567890123456789AB");

    let insert_fut = FakeInsert::accept_and_handshake(listener, key, "0001", 1024);
    let shift_fut = Peer::establish(shift_opts(addr, key, "0001", 1024, 0));
    let (insert, peer) = tokio::join!(insert_fut, shift_fut);
    let mut insert = insert.expect("fake insert handshake");
    let peer = Arc::new(peer.expect("shift peer handshake"));

    const N: usize = 32;
    let frames: Vec<Vec<u8>> = (0..N).map(|i| vec![i as u8; 37 + i]).collect();

    let senders = frames
        .iter()
        .cloned()
        .map(|frame| {
            let peer = peer.clone();
            tokio::spawn(async move {
                let record = wire::marshal(&frame).unwrap();
                peer.send_enc(&record).await
            })
        })
        .collect::<Vec<_>>();

    let mut received = Vec::with_capacity(N);
    for _ in 0..N {
        let payload = insert.recv_record().await.expect(
            "a record read back must be intact — no bytes from a concurrent send_enc call may leak into it",
        );
        received.push(payload);
    }

    for handle in senders {
        handle
            .await
            .unwrap()
            .expect("every concurrent send_enc call should succeed");
    }

    let mut expected = frames;
    expected.sort();
    received.sort();
    assert_eq!(
        received, expected,
        "every frame sent concurrently must arrive exactly once, byte-for-byte"
    );
}
