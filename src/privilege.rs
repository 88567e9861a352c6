//! One-way privilege descent.
//!
//! Runs exactly once, after every privileged resource (tun fds, raw
//! socket, forwarding toggle) is already open. Afterwards the process
//! holds exactly CAP_NET_ADMIN: enough to manage interfaces and routes,
//! with no way back to full privilege. Any failing step leaves the
//! process in an undefined privilege state, so each is fatal.

use nix::sys::prctl;
use nix::unistd::{setgid, setgroups, setuid, Group, User};

use crate::config::PrivilegeConfig;
use crate::error::ClatdError;

const CAP_NET_ADMIN: u32 = 12;
const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

fn step(name: &'static str, detail: impl ToString) -> ClatdError {
    ClatdError::PrivilegeDropFailed {
        step: name,
        detail: detail.to_string(),
    }
}

/// Drop to the configured unprivileged identity, keeping CAP_NET_ADMIN.
pub fn drop_privileges(cfg: &PrivilegeConfig) -> Result<(), ClatdError> {
    let user = User::from_name(&cfg.user)
        .map_err(|e| step("lookup_user", e))?
        .ok_or_else(|| step("lookup_user", format!("no such user: {}", cfg.user)))?;
    let group = Group::from_name(&cfg.group)
        .map_err(|e| step("lookup_group", e))?
        .ok_or_else(|| step("lookup_group", format!("no such group: {}", cfg.group)))?;
    let net_group = Group::from_name(&cfg.net_group)
        .map_err(|e| step("lookup_net_group", e))?
        .ok_or_else(|| step("lookup_net_group", format!("no such group: {}", cfg.net_group)))?;

    // Supplementary groups shrink to just the network group.
    setgroups(&[net_group.gid]).map_err(|e| step("setgroups", e))?;

    // Keep permitted capabilities across the identity change.
    prctl::set_keepcaps(true).map_err(|e| step("set_keepcaps", e))?;

    setgid(group.gid).map_err(|e| step("setgid", e))?;
    setuid(user.uid).map_err(|e| step("setuid", e))?;

    set_net_admin_only().map_err(|e| step("capset", e))?;

    Ok(())
}

/// Set effective+permitted to exactly CAP_NET_ADMIN.
///
/// The identity change above already cleared the effective set; this
/// re-raises the one capability we kept and drops everything else for
/// good. No nix wrapper exists for capset, so this goes through the raw
/// syscall.
fn set_net_admin_only() -> std::io::Result<()> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0, // self
    };
    // Version 3 takes two data elements covering 64 capability bits;
    // CAP_NET_ADMIN lives in the low word.
    let mut data = [CapUserData::default(); 2];
    data[0].effective = 1 << CAP_NET_ADMIN;
    data[0].permitted = 1 << CAP_NET_ADMIN;

    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
