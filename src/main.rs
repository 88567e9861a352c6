//! clatd - 464XLAT CLAT daemon.
//!
//! Bridges an IPv6-only uplink to locally presented IPv4 connectivity:
//! provisions a pair of tun interfaces and a raw IPv6 socket, drops
//! privileges to CAP_NET_ADMIN, then forwards and translates packets in
//! an indefinite poll-driven loop while watching the uplink for address
//! migration.
//!
//! Setup is fail-fast: a partially applied network configuration is
//! unsafe to leave running, so any error before the loop starts
//! terminates the process.

use std::net::Ipv6Addr;
use std::os::fd::AsFd;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod dispatch;
mod error;
mod monitor;
mod netadmin;
mod privilege;
mod translate;
mod tun;
mod tunnel;

use config::RawConfig;
use monitor::{AddressMonitor, AddressSource, Ifaddrs};
use netadmin::IpCommand;
use translate::Siit;
use tun::{TunnelSession, DEVICE4, DEVICE6};
use tunnel::TunnelManager;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable governing DNS resolution mode; inherited from
/// the spawning service and only valid in its scope, so it is cleared
/// before any configuration happens.
const DNS_MODE_VAR: &str = "RES_OPTIONS";

#[derive(Debug, Parser)]
#[command(name = "clatd", version, about = "464XLAT CLAT daemon")]
struct Cli {
    /// Uplink interface with IPv6 reachability.
    #[arg(short = 'i', value_name = "INTERFACE")]
    uplink_interface: String,

    /// PLAT /96 prefix; overrides the config file.
    #[arg(short = 'p', value_name = "PREFIX")]
    plat_prefix: Option<Ipv6Addr>,

    /// Network identifier, any base.
    #[arg(short = 'n', value_name = "NETID", value_parser = parse_net_id)]
    net_id: Option<u32>,
}

/// Parse an unsigned integer in any base, strtoul-style: `0x` hex,
/// leading `0` octal, decimal otherwise.
fn parse_net_id(s: &str) -> Result<u32, String> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
    {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    u32::from_str_radix(digits, radix).map_err(|e| format!("invalid NetID '{}': {}", s, e))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    // Usage and argument errors all exit non-zero, -h included.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "clatd failed");
            let mut source = e.source();
            while let Some(cause) = source {
                error!(cause = %cause, "caused by");
                source = cause.source();
            }
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!(
        version = VERSION,
        uplink = %cli.uplink_interface,
        "starting clat"
    );

    // Every privileged resource is opened before the descent.
    let fd6 = tun::tun_open().context("opening IPv6-facing tun device")?;
    let fd4 = tun::tun_open().context("opening IPv4-facing tun device")?;
    let forwarding = tun::open_forwarding().context("opening forwarding toggle")?;
    let raw6 = tun::open_raw_socket().context("opening raw socket")?;

    let raw_config = RawConfig::load(Path::new(config::DEFAULT_CONFIG_PATH))
        .context("reading configuration")?;

    privilege::drop_privileges(&raw_config.privilege()).context("dropping privileges")?;

    // Only valid in the scope of the process that spawned us.
    std::env::remove_var(DNS_MODE_VAR);

    let source = Ifaddrs;
    let uplink_addr = source
        .global_ipv6(&cli.uplink_interface)
        .with_context(|| format!("no global IPv6 address on {}", cli.uplink_interface))?;
    let uplink_mtu =
        config::interface_mtu(&cli.uplink_interface).context("reading uplink MTU")?;
    let network = raw_config
        .resolve(uplink_addr, uplink_mtu, cli.plat_prefix)
        .context("resolving configuration")?;

    tun::tun_attach(fd6.as_fd(), DEVICE6).context("attaching IPv6-facing tun device")?;
    tun::tun_attach(fd4.as_fd(), DEVICE4).context("attaching IPv4-facing tun device")?;

    let session = TunnelSession::new(
        fd6,
        fd4,
        raw6,
        forwarding,
        cli.uplink_interface.clone(),
        cli.net_id,
    )
    .context("building tunnel session")?;

    let mut manager = TunnelManager::new(
        IpCommand,
        network,
        session.device6.clone(),
        session.device4.clone(),
    );
    manager.configure().context("configuring tunnel")?;

    // Everything is in place; this is the externally visible "go".
    tun::set_forwarding(&session.forwarding, true).context("enabling IPv6 forwarding")?;

    let monitor = AddressMonitor::new(
        Ifaddrs,
        cli.uplink_interface.clone(),
        raw_config.ipv6_host_id,
    );

    // Loop until someone sends us a signal or tears down a tun device.
    dispatch::run(&session, &Siit, &mut manager, &monitor).await?;

    if let Err(e) = tun::set_forwarding(&session.forwarding, false) {
        error!(error = %e, "disabling IPv6 forwarding at shutdown failed");
    }
    manager.teardown();
    info!(uplink = %cli.uplink_interface, "shutting down clat");

    Ok(())
}
