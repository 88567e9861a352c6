//! Configuration for clatd.
//!
//! Reads the flat `key value` configuration file, clamps the MTU pair to
//! usable bounds, and derives the local IPv6 address from the uplink
//! interface's address plus the configured host-id suffix.

use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use tracing::warn;

use crate::error::ClatdError;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/clatd.conf";

/// 40 bytes IPv6 header - 20 bytes IPv4 header + 8 bytes fragment header.
pub const MTU_DELTA: u16 = 28;

/// Minimum IPv6 MTU.
pub const MTU_MIN: u16 = 1280;

/// Largest MTU the tunnel interfaces will be configured with.
pub const MTU_MAX: u16 = 1500;

/// The applied network parameter set.
///
/// Replaced as a whole unit when the uplink address migrates; no field is
/// ever mutated in place, so the dispatcher observes either the old or
/// the new value, never a mix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Local IPv6 host address, assigned /64 to the IPv6-facing device.
    pub ipv6_local_address: Ipv6Addr,
    /// Address routed /128 to the IPv6-facing device; re-derived from the
    /// uplink's current address on every monitor poll.
    pub ipv6_local_subnet: Ipv6Addr,
    /// Local IPv4 host address, assigned /32 to the IPv4-facing device.
    pub ipv4_local_address: Ipv4Addr,
    /// PLAT /96 prefix used to embed translated IPv4 destinations.
    pub plat_prefix: Ipv6Addr,
    /// MTU of the IPv6-facing device.
    pub mtu: u16,
    /// MTU of the IPv4-facing device, at most `mtu - 28`.
    pub ipv4_mtu: u16,
}

/// Identities for the privilege descent.
#[derive(Debug, Clone)]
pub struct PrivilegeConfig {
    pub user: String,
    pub group: String,
    /// Supplementary group granting network access.
    pub net_group: String,
}

/// Raw values from the configuration file, before derivation.
#[derive(Debug, Clone)]
pub struct RawConfig {
    /// Requested IPv6 MTU; `<= 0` means use the uplink interface's MTU.
    pub mtu: i32,
    /// Requested IPv4 MTU; `<= 0` means derive from the IPv6 MTU.
    pub ipv4_mtu: i32,
    /// Lower 64 bits of the local IPv6 address, in IPv6 notation.
    pub ipv6_host_id: Ipv6Addr,
    pub ipv4_local_address: Ipv4Addr,
    pub plat_prefix: Option<Ipv6Addr>,
    pub user: String,
    pub group: String,
    pub net_group: String,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            mtu: 0,
            ipv4_mtu: 0,
            ipv6_host_id: Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0x464),
            ipv4_local_address: Ipv4Addr::new(192, 0, 0, 4),
            plat_prefix: None,
            user: "clat".to_string(),
            group: "clat".to_string(),
            net_group: "inet".to_string(),
        }
    }
}

impl RawConfig {
    /// Load the configuration file. A missing file yields the defaults;
    /// an unreadable or malformed file is a fatal setup error.
    pub fn load(path: &Path) -> Result<Self, ClatdError> {
        let mut cfg = Self::default();

        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(cfg),
            Err(e) => {
                return Err(ClatdError::ConfigReadFailed(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        };

        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once(char::is_whitespace)
                .map(|(k, v)| (k, v.trim()))
                .ok_or_else(|| {
                    ClatdError::ConfigInvalid(format!(
                        "{}:{}: expected 'key value'",
                        path.display(),
                        lineno + 1
                    ))
                })?;

            let invalid = |e: &dyn std::fmt::Display| {
                ClatdError::ConfigInvalid(format!(
                    "{}:{}: {}: {}",
                    path.display(),
                    lineno + 1,
                    key,
                    e
                ))
            };

            match key {
                "mtu" => cfg.mtu = value.parse().map_err(|e| invalid(&e))?,
                "ipv4mtu" => cfg.ipv4_mtu = value.parse().map_err(|e| invalid(&e))?,
                "ipv6_host_id" => cfg.ipv6_host_id = value.parse().map_err(|e| invalid(&e))?,
                "ipv4_local_address" => {
                    cfg.ipv4_local_address = value.parse().map_err(|e| invalid(&e))?
                }
                "plat_prefix" => cfg.plat_prefix = Some(value.parse().map_err(|e| invalid(&e))?),
                "user" => cfg.user = value.to_string(),
                "group" => cfg.group = value.to_string(),
                "net_group" => cfg.net_group = value.to_string(),
                other => warn!(key = other, line = lineno + 1, "unknown config key"),
            }
        }

        Ok(cfg)
    }

    pub fn privilege(&self) -> PrivilegeConfig {
        PrivilegeConfig {
            user: self.user.clone(),
            group: self.group.clone(),
            net_group: self.net_group.clone(),
        }
    }

    /// Produce the applied parameter set for the given uplink state.
    ///
    /// `uplink_addr` is the uplink interface's current global IPv6
    /// address; `uplink_mtu` its MTU, used when no MTU was configured.
    /// The PLAT prefix may be overridden on the command line.
    pub fn resolve(
        &self,
        uplink_addr: Ipv6Addr,
        uplink_mtu: u16,
        plat_prefix_override: Option<Ipv6Addr>,
    ) -> Result<NetworkConfig, ClatdError> {
        let plat_prefix = plat_prefix_override
            .or(self.plat_prefix)
            .ok_or_else(|| {
                ClatdError::ConfigInvalid(
                    "no PLAT prefix: pass -p or set plat_prefix in the config file".to_string(),
                )
            })?;

        let mtu = effective_mtu(self.mtu, uplink_mtu);
        let ipv4_mtu = effective_ipv4_mtu(self.ipv4_mtu, mtu);
        let local = derive_local_address(uplink_addr, self.ipv6_host_id);

        Ok(NetworkConfig {
            ipv6_local_address: local,
            ipv6_local_subnet: local,
            ipv4_local_address: self.ipv4_local_address,
            plat_prefix,
            mtu,
            ipv4_mtu,
        })
    }
}

/// Clamp the requested MTU into `[MTU_MIN, MTU_MAX]`; a non-positive
/// request falls back to the uplink interface's MTU before clamping.
pub fn effective_mtu(requested: i32, uplink_mtu: u16) -> u16 {
    let m = if requested <= 0 {
        warn!(uplink_mtu, "no MTU configured, using uplink MTU");
        i32::from(uplink_mtu)
    } else {
        requested
    };
    m.clamp(i32::from(MTU_MIN), i32::from(MTU_MAX)) as u16
}

/// The IPv4 MTU must leave room for the translation overhead; a
/// non-positive or oversized request becomes `mtu - MTU_DELTA`.
pub fn effective_ipv4_mtu(requested: i32, mtu: u16) -> u16 {
    let max = mtu - MTU_DELTA;
    if requested <= 0 || requested > i32::from(max) {
        max
    } else {
        requested as u16
    }
}

/// Combine the uplink address's /64 with the configured host-id suffix.
pub fn derive_local_address(uplink_addr: Ipv6Addr, host_id: Ipv6Addr) -> Ipv6Addr {
    let up = uplink_addr.segments();
    let id = host_id.segments();
    Ipv6Addr::new(up[0], up[1], up[2], up[3], id[4], id[5], id[6], id[7])
}

/// Read an interface's MTU from sysfs.
pub fn interface_mtu(iface: &str) -> Result<u16, ClatdError> {
    let path = format!("/sys/class/net/{}/mtu", iface);
    let raw = fs::read_to_string(&path)
        .map_err(|e| ClatdError::ConfigReadFailed(format!("{}: {}", path, e)))?;
    raw.trim()
        .parse()
        .map_err(|e| ClatdError::ConfigInvalid(format!("{}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn mtu_clamped_to_bounds() {
        assert_eq!(effective_mtu(9000, 1500), MTU_MAX);
        assert_eq!(effective_mtu(600, 1500), MTU_MIN);
        assert_eq!(effective_mtu(1400, 1500), 1400);
        assert_eq!(effective_mtu(i32::from(MTU_MIN), 1500), MTU_MIN);
        assert_eq!(effective_mtu(i32::from(MTU_MAX), 1500), MTU_MAX);
    }

    #[test]
    fn mtu_falls_back_to_uplink() {
        assert_eq!(effective_mtu(0, 1432), 1432);
        assert_eq!(effective_mtu(-1, 1432), 1432);
        // Uplink MTU is clamped too
        assert_eq!(effective_mtu(0, 9000), MTU_MAX);
        assert_eq!(effective_mtu(0, 576), MTU_MIN);
    }

    #[test]
    fn ipv4_mtu_derived_when_unset_or_oversized() {
        assert_eq!(effective_ipv4_mtu(0, 1500), 1472);
        assert_eq!(effective_ipv4_mtu(-5, 1500), 1472);
        assert_eq!(effective_ipv4_mtu(1473, 1500), 1472);
        assert_eq!(effective_ipv4_mtu(1400, 1500), 1400);
        assert_eq!(effective_ipv4_mtu(1472, 1500), 1472);
    }

    #[test]
    fn local_address_combines_prefix_and_host_id() {
        let uplink: Ipv6Addr = "2001:db8:1:2:aaaa:bbbb:cccc:dddd".parse().unwrap();
        let host_id: Ipv6Addr = "::464".parse().unwrap();
        let local = derive_local_address(uplink, host_id);
        assert_eq!(local, "2001:db8:1:2::464".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = RawConfig::load(Path::new("/nonexistent/clatd.conf")).unwrap();
        assert_eq!(cfg.mtu, 0);
        assert_eq!(cfg.ipv4_local_address, Ipv4Addr::new(192, 0, 0, 4));
        assert!(cfg.plat_prefix.is_none());
        assert_eq!(cfg.user, "clat");
    }

    #[test]
    fn file_values_override_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f, "mtu 1400").unwrap();
        writeln!(f, "ipv4mtu 1300").unwrap();
        writeln!(f, "plat_prefix 64:ff9b::").unwrap();
        writeln!(f, "ipv6_host_id ::1:2").unwrap();
        writeln!(f, "user nobody").unwrap();
        f.flush().unwrap();

        let cfg = RawConfig::load(f.path()).unwrap();
        assert_eq!(cfg.mtu, 1400);
        assert_eq!(cfg.ipv4_mtu, 1300);
        assert_eq!(cfg.plat_prefix, Some("64:ff9b::".parse().unwrap()));
        assert_eq!(cfg.ipv6_host_id, "::1:2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(cfg.user, "nobody");
        assert_eq!(cfg.group, "clat");
    }

    #[test]
    fn malformed_value_is_fatal() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "mtu not-a-number").unwrap();
        f.flush().unwrap();

        let err = RawConfig::load(f.path()).unwrap_err();
        assert_eq!(err.reason_code(), "config_invalid");
    }

    #[test]
    fn resolve_requires_plat_prefix() {
        let raw = RawConfig::default();
        let uplink: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let err = raw.resolve(uplink, 1500, None).unwrap_err();
        assert_eq!(err.reason_code(), "config_invalid");

        let plat: Ipv6Addr = "64:ff9b::".parse().unwrap();
        let cfg = raw.resolve(uplink, 1500, Some(plat)).unwrap();
        assert_eq!(cfg.plat_prefix, plat);
        assert_eq!(cfg.mtu, 1500);
        assert_eq!(cfg.ipv4_mtu, 1472);
        assert_eq!(cfg.ipv6_local_address, cfg.ipv6_local_subnet);
    }
}
