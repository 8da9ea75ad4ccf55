//! Linux TAP device driver.
//!
//! Opens `/dev/net/tun`, requests a TAP (Ethernet, not IP — we carry whole
//! frames) interface via `TUNSETIFF`, and drives it through `AsyncFd` so
//! reads and writes never block a worker thread. This is the one module in
//! the workspace that talks directly to the kernel; everything above it
//! only ever sees the `Tunnel` trait.

use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;

use super::{Frame, Tunnel};

const IFNAMSIZ: usize = 16;
/// `TUNSETIFF` from `linux/if_tun.h`: `_IOW('T', 202, int)`.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Mirrors the portion of `struct ifreq` that `TUNSETIFF` reads/writes.
/// The real struct is a union past `ifr_name`; we only need the `ifr_flags`
/// member, and pad out to the union's size so the ioctl doesn't read past
/// the end of our buffer.
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _union_pad: [u8; 22],
}

/// A Linux TAP device, identified by its kernel-assigned or requested name.
pub struct LinuxTunTap {
    fd: AsyncFd<RawFd>,
    name: String,
    max_frame_len: usize,
    closed: AtomicBool,
}

impl LinuxTunTap {
    /// Opens `/dev/net/tun` and brings up a TAP interface.
    /// `requested_name` may be empty to let the kernel assign one (e.g.
    /// `tap0`); it is truncated to `IFNAMSIZ - 1` bytes otherwise.
    pub fn open(requested_name: &str, max_frame_len: usize) -> io::Result<Self> {
        let path = CString::new("/dev/net/tun").expect("no interior NULs");
        // SAFETY: `path` is a valid NUL-terminated C string naming a
        // standard Linux char device; `open` is an ordinary syscall.
        let raw_fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if raw_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut req = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _union_pad: [0; 22],
        };
        for (dst, src) in req
            .ifr_name
            .iter_mut()
            .zip(requested_name.bytes().take(IFNAMSIZ - 1))
        {
            *dst = src as libc::c_char;
        }

        // SAFETY: `raw_fd` was just opened above and is valid; `req` is
        // laid out exactly as the kernel expects for `TUNSETIFF`.
        let ret = unsafe { libc::ioctl(raw_fd, TUNSETIFF, &mut req as *mut IfReq) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: `raw_fd` has had no other handles taken of it yet.
            unsafe { libc::close(raw_fd) };
            return Err(err);
        }

        let name: String = req
            .ifr_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8 as char)
            .collect();

        set_nonblocking(raw_fd)?;

        Ok(LinuxTunTap {
            fd: AsyncFd::new(raw_fd)?,
            name,
            max_frame_len,
            closed: AtomicBool::new(false),
        })
    }

    /// The interface name the kernel assigned (or the one we requested).
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is the freshly opened, still-uniquely-owned descriptor
    // from `LinuxTunTap::open`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: same fd, flags read from F_GETFL immediately above.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[async_trait]
impl Tunnel for LinuxTunTap {
    async fn read(&self) -> io::Result<Frame> {
        loop {
            let mut guard = self.fd.readable().await?;
            let mut buf = vec![0u8; self.max_frame_len];
            let result = guard.try_io(|inner| {
                // SAFETY: `inner` wraps the same open fd for the duration
                // of this call; `buf` is valid for `buf.len()` bytes.
                let n = unsafe {
                    libc::read(
                        *inner.get_ref(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: `inner` wraps the same open fd for the duration
                // of this call; `frame` is valid for `frame.len()` bytes.
                let n = unsafe {
                    libc::write(
                        *inner.get_ref(),
                        frame.as_ptr() as *const libc::c_void,
                        frame.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // SAFETY: `closed` ensures this runs at most once for this fd.
        let ret = unsafe { libc::close(*self.fd.get_ref()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
