//! Error types for clatd.

use thiserror::Error;

/// Daemon errors with standardized reason codes.
///
/// Everything raised during setup is fatal: a partially applied network
/// configuration must not be left running, so the caller propagates these
/// to `main` and the process exits non-zero. Runtime anomalies are logged
/// at the call site instead of being raised through this type.
#[derive(Debug, Error)]
pub enum ClatdError {
    /// Could not open the tun cloning device.
    #[error("tun_open_failed: {0}")]
    TunOpenFailed(String),

    /// Could not attach a tun fd to a named interface.
    #[error("tun_attach_failed: {device}: {detail}")]
    TunAttachFailed { device: String, detail: String },

    /// Could not open the raw IPv6 outbound socket.
    #[error("raw_socket_failed: {0}")]
    RawSocketFailed(String),

    /// Could not open or write the IPv6 forwarding toggle.
    #[error("forwarding_failed: {0}")]
    ForwardingFailed(String),

    /// Privilege descent failed at a named step.
    #[error("privilege_drop_failed: {step}: {detail}")]
    PrivilegeDropFailed { step: &'static str, detail: String },

    /// Could not read the configuration file.
    #[error("config_read_failed: {0}")]
    ConfigReadFailed(String),

    /// Configuration was read but is unusable.
    #[error("config_invalid: {0}")]
    ConfigInvalid(String),

    /// Address assignment or interface bring-up failed.
    #[error("net_config_failed: {0}")]
    NetConfigFailed(String),

    /// Initial host-route installation failed.
    #[error("route_failed: {0}")]
    RouteFailed(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClatdError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ClatdError::TunOpenFailed(_) => "tun_open_failed",
            ClatdError::TunAttachFailed { .. } => "tun_attach_failed",
            ClatdError::RawSocketFailed(_) => "raw_socket_failed",
            ClatdError::ForwardingFailed(_) => "forwarding_failed",
            ClatdError::PrivilegeDropFailed { .. } => "privilege_drop_failed",
            ClatdError::ConfigReadFailed(_) => "config_read_failed",
            ClatdError::ConfigInvalid(_) => "config_invalid",
            ClatdError::NetConfigFailed(_) => "net_config_failed",
            ClatdError::RouteFailed(_) => "route_failed",
            ClatdError::Io(_) => "io_error",
        }
    }
}
