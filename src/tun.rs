//! Tunnel device and raw socket handles.
//!
//! Opens the two tun devices, the raw IPv6 outbound socket, and the
//! system forwarding toggle, all before privileges are dropped. The
//! resulting `TunnelSession` owns every descriptor for the life of the
//! daemon; nothing is duplicated or shared.

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType};
use tokio::io::unix::AsyncFd;
use tracing::warn;

use crate::config::MTU_MAX;
use crate::error::ClatdError;

/// Name of the IPv6-facing tunnel interface.
pub const DEVICE6: &str = "clat";

/// Name of the IPv4-facing tunnel interface.
pub const DEVICE4: &str = "clat4";

/// Frame header on the tun devices: `{flags: u16, protocol: u16}`.
pub const TUN_HEADER_LEN: usize = 4;

/// Largest frame a tun read can produce.
pub const PACKET_LEN: usize = MTU_MAX as usize + TUN_HEADER_LEN;

const FORWARDING_PATH: &str = "/proc/sys/net/ipv6/conf/all/forwarding";

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;

#[repr(C)]
struct IfReqTun {
    name: [u8; libc::IFNAMSIZ],
    flags: libc::c_short,
}

/// The running tunnel instance.
///
/// Handle fields are immutable after provisioning; only the running flag
/// changes, mutated by the dispatcher when it observes EOF or a
/// termination signal. The loop is single-threaded, so a `Cell` is all
/// the cancellation token needs to be.
pub struct TunnelSession {
    /// IPv6-facing tun device (reads frames from local IPv4 senders'
    /// translated traffic path; see dispatch for the demux rule).
    pub tun6: AsyncFd<OwnedFd>,
    /// IPv4-facing tun device.
    pub tun4: AsyncFd<OwnedFd>,
    /// Raw IPv6 socket for translated outbound packets.
    pub raw6: OwnedFd,
    /// Open handle on the system IPv6 forwarding toggle.
    pub forwarding: File,
    pub device6: String,
    pub device4: String,
    pub uplink: String,
    pub net_id: Option<u32>,
    running: Cell<bool>,
}

impl TunnelSession {
    pub fn new(
        tun6: OwnedFd,
        tun4: OwnedFd,
        raw6: OwnedFd,
        forwarding: File,
        uplink: String,
        net_id: Option<u32>,
    ) -> Result<Self, ClatdError> {
        set_nonblocking(tun6.as_raw_fd())?;
        set_nonblocking(tun4.as_raw_fd())?;
        Ok(Self {
            tun6: AsyncFd::new(tun6)?,
            tun4: AsyncFd::new(tun4)?,
            raw6,
            forwarding,
            device6: DEVICE6.to_string(),
            device4: DEVICE4.to_string(),
            uplink,
            net_id,
            running: Cell::new(true),
        })
    }

    pub fn running(&self) -> bool {
        self.running.get()
    }

    /// Cooperative cancellation: observed at the top of the next loop
    /// iteration.
    pub fn stop(&self) {
        self.running.set(false);
    }
}

/// Open the tun cloning device. The legacy path is tried first, matching
/// deployments where only the old node exists.
pub fn tun_open() -> Result<OwnedFd, ClatdError> {
    tun_open_paths(&["/dev/tun", "/dev/net/tun"])
}

fn tun_open_paths(paths: &[&str]) -> Result<OwnedFd, ClatdError> {
    let mut last = std::io::Error::from(std::io::ErrorKind::NotFound);
    for path in paths {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => return Ok(OwnedFd::from(file)),
            Err(e) => last = e,
        }
    }
    // Keep the last errno: a permissions failure reads differently from
    // a missing device node.
    Err(ClatdError::TunOpenFailed(format!(
        "no tun cloning device could be opened: {}",
        last
    )))
}

/// Attach an open tun fd to a named interface.
///
/// IFF_TUN without IFF_NO_PI: every frame keeps the 4-byte packet-info
/// header carrying the embedded protocol tag the dispatcher keys on.
pub fn tun_attach(fd: BorrowedFd<'_>, device: &str) -> Result<(), ClatdError> {
    let mut req = IfReqTun {
        name: ifreq_name(device).ok_or_else(|| ClatdError::TunAttachFailed {
            device: device.to_string(),
            detail: "interface name too long".to_string(),
        })?,
        flags: IFF_TUN,
    };

    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut req) };
    if rc < 0 {
        return Err(ClatdError::TunAttachFailed {
            device: device.to_string(),
            detail: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

/// NUL-padded interface name for an ifreq, or None if it does not fit.
fn ifreq_name(device: &str) -> Option<[u8; libc::IFNAMSIZ]> {
    let bytes = device.as_bytes();
    if bytes.len() >= libc::IFNAMSIZ {
        return None;
    }
    let mut name = [0u8; libc::IFNAMSIZ];
    name[..bytes.len()].copy_from_slice(bytes);
    Some(name)
}

/// Open the raw IPv6 socket used for translated outbound packets.
///
/// The translator computes transport checksums itself, so kernel
/// checksum offload on the raw socket is turned off; failure to do so is
/// survivable and only logged.
pub fn open_raw_socket() -> Result<OwnedFd, ClatdError> {
    let fd = socket(
        AddressFamily::Inet6,
        SockType::Raw,
        SockFlag::empty(),
        SockProtocol::Raw,
    )
    .map_err(|e| ClatdError::RawSocketFailed(e.to_string()))?;

    const IPV6_CHECKSUM: libc::c_int = 7;
    let off: libc::c_int = -1;
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::IPPROTO_IPV6,
            IPV6_CHECKSUM,
            &off as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            "could not disable checksum offload on raw socket"
        );
    }

    Ok(fd)
}

/// Open the system-wide IPv6 forwarding toggle for later writes.
pub fn open_forwarding() -> Result<File, ClatdError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(FORWARDING_PATH)
        .map_err(|e| ClatdError::ForwardingFailed(format!("{}: {}", FORWARDING_PATH, e)))
}

/// Enable or disable IPv6 forwarding through the held handle.
pub fn set_forwarding(file: &File, enable: bool) -> Result<(), ClatdError> {
    let setting: &[u8] = if enable { b"1\n" } else { b"0\n" };
    (&*file)
        .write_all(setting)
        .map_err(|e| ClatdError::ForwardingFailed(e.to_string()))
}

/// Read from a descriptor into a buffer.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Write a full buffer to a descriptor.
pub fn write_fd(fd: BorrowedFd<'_>, buf: &[u8]) -> std::io::Result<usize> {
    let n = unsafe {
        libc::write(
            fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        )
    };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Send a self-contained IPv6 packet on the raw socket toward `dst`.
pub fn send_raw6(fd: BorrowedFd<'_>, packet: &[u8], dst: Ipv6Addr) -> std::io::Result<usize> {
    let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sa.sin6_addr.s6_addr = dst.octets();

    let n = unsafe {
        libc::sendto(
            fd.as_raw_fd(),
            packet.as_ptr() as *const libc::c_void,
            packet.len(),
            0,
            &sa as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn set_nonblocking(fd: RawFd) -> Result<(), ClatdError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(ClatdError::Io(std::io::Error::last_os_error()));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(ClatdError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifreq_name_fits_and_pads() {
        let name = ifreq_name("clat4").unwrap();
        assert_eq!(&name[..5], b"clat4");
        assert!(name[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn tun_open_failure_carries_the_os_error() {
        let err = tun_open_paths(&["/nonexistent/tun-a", "/nonexistent/tun-b"]).unwrap_err();
        assert_eq!(err.reason_code(), "tun_open_failed");
        let msg = err.to_string();
        assert!(msg.contains("No such file"), "{}", msg);
    }

    #[test]
    fn ifreq_name_rejects_oversize() {
        assert!(ifreq_name("an-interface-name-way-too-long").is_none());
        // IFNAMSIZ includes the terminating NUL
        assert!(ifreq_name(&"x".repeat(libc::IFNAMSIZ)).is_none());
        assert!(ifreq_name(&"x".repeat(libc::IFNAMSIZ - 1)).is_some());
    }
}
