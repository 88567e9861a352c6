//! OS network-configuration primitives.
//!
//! Address assignment, interface bring-up, and route programming go
//! through the `NetAdmin` trait so the tunnel manager and monitor can be
//! exercised against a recording fake. The real implementation shells
//! out to `ip(8)`.

use std::net::IpAddr;
use std::process::Command;

use anyhow::{Context, Result};

/// Address, link, and route operations the daemon needs.
///
/// All calls are fire-and-forget with a success/failure result; the
/// caller decides whether a failure is fatal.
pub trait NetAdmin {
    /// Assign `addr/prefix_len` to `device`, optionally point-to-point
    /// toward `peer`.
    fn add_address(
        &self,
        device: &str,
        addr: IpAddr,
        prefix_len: u8,
        peer: Option<IpAddr>,
    ) -> Result<()>;

    /// Set the MTU and bring the interface administratively up.
    fn if_up(&self, device: &str, mtu: u16) -> Result<()>;

    /// Install a device route for `dest/prefix_len`.
    fn add_route(&self, device: &str, dest: IpAddr, prefix_len: u8) -> Result<()>;

    /// Remove a device route for `dest/prefix_len`.
    fn del_route(&self, device: &str, dest: IpAddr, prefix_len: u8) -> Result<()>;
}

/// `NetAdmin` backed by the `ip` command.
pub struct IpCommand;

fn family_flag(addr: &IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "-4",
        IpAddr::V6(_) => "-6",
    }
}

/// Run an `ip` command.
fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .context("failed to execute ip command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ip {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(())
}

impl NetAdmin for IpCommand {
    fn add_address(
        &self,
        device: &str,
        addr: IpAddr,
        prefix_len: u8,
        peer: Option<IpAddr>,
    ) -> Result<()> {
        let cidr = format!("{}/{}", addr, prefix_len);
        match peer {
            Some(peer) => {
                let peer = peer.to_string();
                run_ip(&[
                    family_flag(&addr),
                    "addr",
                    "add",
                    &cidr,
                    "peer",
                    &peer,
                    "dev",
                    device,
                ])
            }
            None => run_ip(&[family_flag(&addr), "addr", "add", &cidr, "dev", device]),
        }
    }

    fn if_up(&self, device: &str, mtu: u16) -> Result<()> {
        let mtu = mtu.to_string();
        run_ip(&["link", "set", "dev", device, "mtu", &mtu])?;
        run_ip(&["link", "set", "dev", device, "up"])
    }

    fn add_route(&self, device: &str, dest: IpAddr, prefix_len: u8) -> Result<()> {
        let cidr = format!("{}/{}", dest, prefix_len);
        run_ip(&[family_flag(&dest), "route", "add", &cidr, "dev", device])
    }

    fn del_route(&self, device: &str, dest: IpAddr, prefix_len: u8) -> Result<()> {
        let cidr = format!("{}/{}", dest, prefix_len);
        run_ip(&[family_flag(&dest), "route", "del", &cidr, "dev", device])
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::net::IpAddr;

    use anyhow::Result;

    use super::NetAdmin;

    /// One recorded NetAdmin call, for asserting order and content.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Op {
        AddAddress(String, IpAddr, u8),
        IfUp(String, u16),
        AddRoute(String, IpAddr, u8),
        DelRoute(String, IpAddr, u8),
    }

    /// Records every call; operations listed in `fail` return errors.
    #[derive(Default)]
    pub struct Recorder {
        pub ops: RefCell<Vec<Op>>,
        pub fail: HashSet<&'static str>,
    }

    impl Recorder {
        fn record(&self, op: Op, kind: &'static str) -> Result<()> {
            self.ops.borrow_mut().push(op);
            if self.fail.contains(kind) {
                anyhow::bail!("{} refused", kind);
            }
            Ok(())
        }

        pub fn take(&self) -> Vec<Op> {
            self.ops.borrow_mut().drain(..).collect()
        }
    }

    impl NetAdmin for Recorder {
        fn add_address(
            &self,
            device: &str,
            addr: IpAddr,
            prefix_len: u8,
            _peer: Option<IpAddr>,
        ) -> Result<()> {
            self.record(Op::AddAddress(device.to_string(), addr, prefix_len), "addr")
        }

        fn if_up(&self, device: &str, mtu: u16) -> Result<()> {
            self.record(Op::IfUp(device.to_string(), mtu), "up")
        }

        fn add_route(&self, device: &str, dest: IpAddr, prefix_len: u8) -> Result<()> {
            self.record(Op::AddRoute(device.to_string(), dest, prefix_len), "route_add")
        }

        fn del_route(&self, device: &str, dest: IpAddr, prefix_len: u8) -> Result<()> {
            self.record(Op::DelRoute(device.to_string(), dest, prefix_len), "route_del")
        }
    }
}
