//! Uplink address monitoring.
//!
//! Periodically re-derives the local /64 from the uplink interface's
//! current global IPv6 address and, when it has moved, asks the tunnel
//! manager to swap routes. Driven cooperatively by the dispatcher's wait
//! timeout; never runs concurrently with itself or with packet dispatch.

use std::net::Ipv6Addr;

use tracing::warn;

use crate::config::{derive_local_address, NetworkConfig};
use crate::netadmin::NetAdmin;
use crate::tunnel::TunnelManager;

/// Where the monitor learns the uplink's address. The real source walks
/// the kernel's interface-address list.
pub trait AddressSource {
    /// The interface's current global-scope IPv6 address, if any.
    fn global_ipv6(&self, iface: &str) -> Option<Ipv6Addr>;
}

/// `AddressSource` backed by getifaddrs(3).
pub struct Ifaddrs;

impl AddressSource for Ifaddrs {
    fn global_ipv6(&self, iface: &str) -> Option<Ipv6Addr> {
        let addrs = match nix::ifaddrs::getifaddrs() {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "getifaddrs failed");
                return None;
            }
        };
        addrs
            .filter(|ifa| ifa.interface_name == iface)
            .filter_map(|ifa| {
                let addr = ifa.address?;
                let in6 = addr.as_sockaddr_in6()?;
                Some(in6.ip())
            })
            .find(is_global)
    }
}

fn is_global(addr: &Ipv6Addr) -> bool {
    let link_local = addr.segments()[0] & 0xffc0 == 0xfe80;
    !addr.is_unspecified() && !addr.is_loopback() && !addr.is_multicast() && !link_local
}

pub struct AddressMonitor<S: AddressSource> {
    source: S,
    uplink: String,
    host_id: Ipv6Addr,
}

impl<S: AddressSource> AddressMonitor<S> {
    pub fn new(source: S, uplink: String, host_id: Ipv6Addr) -> Self {
        Self {
            source,
            uplink,
            host_id,
        }
    }

    /// One polling pass.
    ///
    /// A missing uplink address is tolerated (the interface may be
    /// transiently down) and changes nothing. An unchanged derived
    /// subnet is a no-op. A changed subnet is handed to the manager as a
    /// whole replacement config.
    pub fn poll<N: NetAdmin>(&self, manager: &mut TunnelManager<N>) {
        let Some(uplink_addr) = self.source.global_ipv6(&self.uplink) else {
            warn!(iface = %self.uplink, "no global IPv6 address on uplink");
            return;
        };

        let candidate = derive_local_address(uplink_addr, self.host_id);
        let current = manager.config().ipv6_local_subnet;
        if candidate == current {
            return;
        }

        warn!(from = %current, to = %candidate, "clat subnet changed");
        let new = NetworkConfig {
            ipv6_local_address: candidate,
            ipv6_local_subnet: candidate,
            ..manager.config().clone()
        };
        manager.reconfigure_subnet(new);
    }
}
