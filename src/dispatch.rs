//! The packet-dispatch event loop.
//!
//! One logical thread of control: reads, translation, writes, and the
//! periodic uplink poll are strictly serialized, so the applied config
//! and the tunnel handles need no locking. The only suspension point is
//! a single bounded `select!` over descriptor readiness, the poll
//! timeout, and the termination signal. Merging I/O readiness with the
//! timer means the periodic check cannot starve under continuous
//! traffic and never blocks packet processing for more than one cycle.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::{Duration, Instant};

use tokio::io::unix::AsyncFdReadyGuard;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::error::ClatdError;
use crate::monitor::{AddressMonitor, AddressSource};
use crate::netadmin::NetAdmin;
use crate::translate::Translator;
use crate::tun::{read_fd, TunnelSession, PACKET_LEN, TUN_HEADER_LEN};
use crate::tunnel::TunnelManager;

/// How often the uplink interface is polled for address changes.
pub const INTERFACE_POLL_PERIOD: Duration = Duration::from_secs(30);

/// Upper bound on one wait when no traffic is flowing.
pub const NO_TRAFFIC_POLL_TIMEOUT: Duration = Duration::from_secs(90);

const ETH_P_IP: u16 = libc::ETH_P_IP as u16;
const ETH_P_IPV6: u16 = libc::ETH_P_IPV6 as u16;

/// Decoded view of one tun frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameView<'a> {
    /// Shorter than the packet-info header.
    Malformed,
    Frame {
        /// Packet-info flags, host byte order. Expected zero.
        flags: u16,
        /// Ether-type of the embedded network-layer packet.
        protocol: u16,
        payload: &'a [u8],
    },
}

/// Bound-checked decode of the fixed `{flags, protocol}` header.
pub fn parse_frame(buf: &[u8]) -> FrameView<'_> {
    if buf.len() < TUN_HEADER_LEN {
        return FrameView::Malformed;
    }
    FrameView::Frame {
        flags: u16::from_ne_bytes([buf[0], buf[1]]),
        protocol: u16::from_be_bytes([buf[2], buf[3]]),
        payload: &buf[TUN_HEADER_LEN..],
    }
}

/// Demux one frame by its embedded-protocol tag.
///
/// An embedded IPv4 packet is translated out the raw IPv6 socket; an
/// embedded IPv6 packet is translated to the IPv4-facing device. The
/// rule is keyed on the tag alone, whichever device produced the frame.
fn dispatch_frame<T: Translator>(
    session: &TunnelSession,
    cfg: &NetworkConfig,
    translator: &T,
    buf: &[u8],
) {
    match parse_frame(buf) {
        FrameView::Malformed => {
            warn!(len = buf.len(), "short read, dropping frame");
        }
        FrameView::Frame {
            flags,
            protocol,
            payload,
        } => {
            if flags != 0 {
                warn!(flags, "unexpected packet-info flags");
            }
            match protocol {
                ETH_P_IP => translator.translate(session.raw6.as_fd(), cfg, true, payload),
                ETH_P_IPV6 => {
                    translator.translate(session.tun4.get_ref().as_fd(), cfg, false, payload)
                }
                other => warn!(protocol = other, "unknown packet type"),
            }
        }
    }
}

/// Read one frame from a ready tun device and dispatch it.
///
/// EOF means the device was torn down externally: a normal shutdown
/// trigger, not an error. Read failures are transient and logged.
fn service_ready<T: Translator>(
    session: &TunnelSession,
    guard: &mut AsyncFdReadyGuard<'_, OwnedFd>,
    cfg: &NetworkConfig,
    translator: &T,
) {
    let mut buf = [0u8; PACKET_LEN];
    match guard.try_io(|inner| read_fd(inner.get_ref().as_raw_fd(), &mut buf)) {
        Ok(Ok(0)) => {
            warn!("tun interface removed");
            session.stop();
        }
        Ok(Ok(n)) => dispatch_frame(session, cfg, translator, &buf[..n]),
        Ok(Err(e)) => warn!(error = %e, "tun read error"),
        // Spurious readiness; wait again.
        Err(_would_block) => {}
    }
}

/// Run until a termination signal arrives or a tun device disappears.
pub async fn run<T, N, S>(
    session: &TunnelSession,
    translator: &T,
    manager: &mut TunnelManager<N>,
    monitor: &AddressMonitor<S>,
) -> Result<(), ClatdError>
where
    T: Translator,
    N: NetAdmin,
    S: AddressSource,
{
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut last_poll = Instant::now();

    info!(
        uplink = %session.uplink,
        net_id = ?session.net_id,
        "entering event loop"
    );

    while session.running() {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("termination signal received");
                session.stop();
            }
            guard = session.tun6.readable() => match guard {
                Ok(mut guard) => service_ready(session, &mut guard, manager.config(), translator),
                Err(e) => warn!(error = %e, "wait on tunnel device failed"),
            },
            guard = session.tun4.readable() => match guard {
                Ok(mut guard) => service_ready(session, &mut guard, manager.config(), translator),
                Err(e) => warn!(error = %e, "wait on tunnel device failed"),
            },
            _ = tokio::time::sleep(NO_TRAFFIC_POLL_TIMEOUT) => {}
        }

        // Runs whether or not any handle was ready, so continuous
        // traffic cannot starve the migration check.
        if last_poll.elapsed() >= INTERFACE_POLL_PERIOD {
            monitor.poll(manager);
            last_poll = Instant::now();
        }
    }

    Ok(())
}
