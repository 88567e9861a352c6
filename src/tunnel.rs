//! Tunnel configuration lifecycle.
//!
//! The manager owns the applied `NetworkConfig` and is the only
//! component that mutates routing state: initial provisioning, the
//! atomic subnet swap on uplink migration, and best-effort teardown.

use std::net::IpAddr;

use tracing::{info, warn};

use crate::config::{NetworkConfig, MTU_DELTA};
use crate::error::ClatdError;
use crate::netadmin::NetAdmin;

pub struct TunnelManager<N: NetAdmin> {
    net: N,
    config: NetworkConfig,
    device6: String,
    device4: String,
}

impl<N: NetAdmin> TunnelManager<N> {
    pub fn new(net: N, config: NetworkConfig, device6: String, device4: String) -> Self {
        Self {
            net,
            config,
            device6,
            device4,
        }
    }

    /// Currently applied configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn net_for_tests(&self) -> &N {
        &self.net
    }

    /// Apply the initial configuration: addresses, then up-state, then
    /// the host route. The order matters: bringing an interface up is
    /// externally observable and listeners treat it as "configuration
    /// finalized", so everything else must already be in place, and the
    /// route must exist before forwarding is enabled. Any failure here
    /// is fatal.
    pub fn configure(&self) -> Result<(), ClatdError> {
        let cfg = &self.config;

        // Self-destined /32: the IPv4-facing device is point-to-point.
        self.net
            .add_address(
                &self.device4,
                IpAddr::V4(cfg.ipv4_local_address),
                32,
                Some(IpAddr::V4(cfg.ipv4_local_address)),
            )
            .map_err(|e| ClatdError::NetConfigFailed(format!("address(4): {:#}", e)))?;

        self.net
            .add_address(&self.device6, IpAddr::V6(cfg.ipv6_local_address), 64, None)
            .map_err(|e| ClatdError::NetConfigFailed(format!("address(6): {:#}", e)))?;

        self.net
            .if_up(&self.device6, cfg.mtu)
            .map_err(|e| ClatdError::NetConfigFailed(format!("up(6): {:#}", e)))?;

        debug_assert!(cfg.ipv4_mtu <= cfg.mtu - MTU_DELTA);
        self.net
            .if_up(&self.device4, cfg.ipv4_mtu)
            .map_err(|e| ClatdError::NetConfigFailed(format!("up(4): {:#}", e)))?;

        // Route a /128 out of the (assumed routed to us) /64.
        self.net
            .add_route(&self.device6, IpAddr::V6(cfg.ipv6_local_subnet), 128)
            .map_err(|e| ClatdError::RouteFailed(format!("{:#}", e)))?;

        info!(
            device6 = %self.device6,
            device4 = %self.device4,
            ipv6 = %cfg.ipv6_local_address,
            ipv4 = %cfg.ipv4_local_address,
            mtu = cfg.mtu,
            ipv4_mtu = cfg.ipv4_mtu,
            "tunnel configured"
        );
        Ok(())
    }

    /// Swap in a new configuration after an uplink address migration:
    /// delete the old /128 route, replace the stored config wholesale,
    /// install the new /128 route. The caller never dispatches a packet
    /// mid-swap, so the dispatcher sees either the old or the new value.
    ///
    /// Runtime route failures are logged, not fatal; the route goes
    /// stale until the next successful migration.
    pub fn reconfigure_subnet(&mut self, new: NetworkConfig) {
        if let Err(e) = self
            .net
            .del_route(&self.device6, IpAddr::V6(self.config.ipv6_local_subnet), 128)
        {
            warn!(
                subnet = %self.config.ipv6_local_subnet,
                error = %format!("{:#}", e),
                "failed to remove old route"
            );
        }

        self.config = new;

        if let Err(e) = self
            .net
            .add_route(&self.device6, IpAddr::V6(self.config.ipv6_local_subnet), 128)
        {
            warn!(
                subnet = %self.config.ipv6_local_subnet,
                error = %format!("{:#}", e),
                "failed to install new route"
            );
        }
    }

    /// Best-effort cleanup at shutdown; the fds close when the session
    /// drops.
    pub fn teardown(&self) {
        if let Err(e) = self
            .net
            .del_route(&self.device6, IpAddr::V6(self.config.ipv6_local_subnet), 128)
        {
            warn!(error = %format!("{:#}", e), "route removal at teardown failed");
        }
    }
}
