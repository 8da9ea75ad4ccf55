//! `Peer` — owns the TCP connection to the remote "insert" peer, performs
//! the handshake, and exposes locked encrypted send/recv of exact byte
//! counts.
//!
//! The handshake has a cyclic dependency: the Cryptor pair needs the nonce,
//! the name exchange needs the Cryptor pair, and the caller wants one
//! `Peer` at the end of it. We resolve it by building the Cryptors inline
//! during construction and only returning `Peer` once everything —
//! including the name round-trip — has succeeded.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::crypto::{self, Cryptor, KEY_LEN, NONCE_LEN};
use crate::wire::ct_eq;

/// Which IP family to force when resolving `addr`, or either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpFamily {
    #[default]
    Any,
    V4,
    V6,
}

/// Handshake parameters. One `Peer` is built from one of these.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    /// Address to connect to or listen on.
    pub addr: String,
    /// Connect if true; otherwise bind, accept one connection, stop listening.
    pub connect: bool,
    pub ip_family: IpFamily,
    /// Cleartext banner sent before the nonce exchange.
    pub junk: Vec<u8>,
    /// 32-byte pre-shared key.
    pub key: [u8; KEY_LEN],
    /// Seconds added to local wall-clock time before deriving the Cryptors.
    pub time_offset: i64,
    /// This side's install-identity string.
    pub name: String,
    /// Padded length of the name record. Must be >= `name.len()`.
    pub name_len: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("resolving {addr}: {source}")]
    Addr {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no addresses for {0} matched the requested IP family")]
    NoMatchingAddr(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("name_len {name_len} is shorter than name ({name_bytes} bytes)")]
    NameTooShort { name_len: usize, name_bytes: usize },
    #[error(
        "name mismatch: sent {sent:?} ({sent_nulls} trailing nulls), received {received:?} ({received_nulls} trailing nulls)"
    )]
    NameMismatch {
        sent: String,
        sent_nulls: usize,
        received: String,
        received_nulls: usize,
    },
}

/// One established tunnel connection: a TCP socket plus the two derived
/// Cryptors and their per-direction locks.
pub struct Peer {
    stream: TcpStream,
    remote_addr: SocketAddr,
    tx: Mutex<Cryptor>,
    rx: Mutex<Cryptor>,
}

impl Peer {
    /// Resolve `opts.addr`, connect or accept, exchange junk and nonce,
    /// derive the Cryptor pair, and confirm names. Returns a `Peer` ready
    /// for `send_enc`/`recv_enc` only once all of that has succeeded.
    pub async fn establish(opts: HandshakeOptions) -> Result<Self, PeerError> {
        if opts.name.len() > opts.name_len {
            return Err(PeerError::NameTooShort {
                name_len: opts.name_len,
                name_bytes: opts.name.len(),
            });
        }

        let stream = connect_or_accept(&opts).await?;
        let remote_addr = stream.peer_addr()?;
        tracing::info!(%remote_addr, "connected to peer");

        // Junk is cleartext and unauthenticated — it exists only to
        // disguise the stream opener.
        {
            let mut w = &stream;
            w.write_all(&opts.junk).await?;
        }
        tracing::debug!(junk_len = opts.junk.len(), "sent junk banner");

        let mut nonce = [0u8; NONCE_LEN];
        {
            let mut r = &stream;
            r.read_exact(&mut nonce).await?;
        }
        let when = unix_now() + opts.time_offset;
        tracing::debug!(nonce = %hex::encode(nonce), when, "received nonce");

        let (tx, rx) = crypto::new_cryptor_pair(&opts.key, nonce, when);

        let peer = Peer {
            stream,
            remote_addr,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        };

        peer.exchange_names(&opts.name, opts.name_len).await?;
        tracing::info!(%remote_addr, "handshake complete");

        Ok(peer)
    }

    async fn exchange_names(&self, name: &str, name_len: usize) -> Result<(), PeerError> {
        let mut sent = name.as_bytes().to_vec();
        sent.resize(name_len, 0);

        self.send_enc(&sent).await?;
        let (sent_trimmed, sent_nulls) = trim_trailing_nulls(&sent);
        tracing::debug!(
            name = %String::from_utf8_lossy(sent_trimmed),
            sent_nulls,
            "sent name"
        );

        let received = self.recv_enc(name_len).await?;
        let (received_trimmed, received_nulls) = trim_trailing_nulls(&received);

        if !ct_eq(&sent, &received) {
            self.close();
            return Err(PeerError::NameMismatch {
                sent: String::from_utf8_lossy(sent_trimmed).into_owned(),
                sent_nulls,
                received: String::from_utf8_lossy(received_trimmed).into_owned(),
                received_nulls,
            });
        }
        Ok(())
    }

    /// Encrypt `buf` under the tx Cryptor and write it in full.
    ///
    /// Holds the tx lock across encrypt+write so keystream bytes stay in
    /// lock-step with the bytes actually reaching the wire: concurrent
    /// callers never interleave mid-record.
    pub async fn send_enc(&self, buf: &[u8]) -> Result<(), PeerError> {
        let mut cryptor = self.tx.lock().await;
        let mut owned = buf.to_vec();
        cryptor.crypt(&mut owned);

        let mut w = &self.stream;
        if let Err(e) = w.write_all(&owned).await {
            self.close();
            return Err(e.into());
        }
        Ok(())
    }

    /// Read exactly `n` bytes and decrypt them under the rx Cryptor.
    pub async fn recv_enc(&self, n: usize) -> Result<Vec<u8>, PeerError> {
        let mut cryptor = self.rx.lock().await;
        let mut buf = vec![0u8; n];

        let mut r = &self.stream;
        if let Err(e) = r.read_exact(&mut buf).await {
            self.close();
            return Err(e.into());
        }
        cryptor.crypt(&mut buf);
        Ok(buf)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Forcibly closes the underlying socket. Idempotent. Unblocks any
    /// `send_enc`/`recv_enc` in flight on either direction with an I/O
    /// error, which is how the supervisor tears a session down.
    pub fn close(&self) {
        let fd = self.stream.as_raw_fd();
        // SAFETY: `fd` is a valid, open socket owned by `self.stream` for
        // the lifetime of this call. `shutdown(2)` is safe to invoke
        // concurrently with in-flight reads/writes on the same fd — it is
        // the kernel mechanism for aborting them, which is exactly what a
        // torn-down session needs.
        unsafe {
            libc::shutdown(fd, libc::SHUT_RDWR);
        }
    }
}

async fn connect_or_accept(opts: &HandshakeOptions) -> Result<TcpStream, PeerError> {
    let candidates: Vec<SocketAddr> = lookup_host(&opts.addr)
        .await
        .map_err(|source| PeerError::Addr {
            addr: opts.addr.clone(),
            source,
        })?
        .filter(|a| match opts.ip_family {
            IpFamily::Any => true,
            IpFamily::V4 => a.is_ipv4(),
            IpFamily::V6 => a.is_ipv6(),
        })
        .collect();

    let addr = *candidates
        .first()
        .ok_or_else(|| PeerError::NoMatchingAddr(opts.addr.clone()))?;

    if opts.connect {
        tracing::debug!(%addr, "dialing peer");
        Ok(TcpStream::connect(addr).await?)
    } else {
        tracing::debug!(%addr, "listening for peer");
        let listener = TcpListener::bind(addr).await?;
        // Exactly one peer per process lifetime — accept once, then let
        // the listener drop, which stops listening.
        let (stream, peer_addr) = listener.accept().await?;
        tracing::debug!(%peer_addr, "accepted connection");
        Ok(stream)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

/// Trim trailing NUL bytes, returning the trimmed slice and the count
/// removed.
pub fn trim_trailing_nulls(b: &[u8]) -> (&[u8], usize) {
    let trimmed_len = b.iter().rposition(|&c| c != 0).map_or(0, |i| i + 1);
    (&b[..trimmed_len], b.len() - trimmed_len)
}
