use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result};
use egress_policy::FWMARK;
use socket2::{Domain, Protocol, Socket, Type};

/// Used when `/etc/resolv.conf` is missing or lists no nameserver.
pub const FALLBACK_UPSTREAM: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);

const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// First nameserver of `/etc/resolv.conf`, port 53, read once at startup.
pub fn discover_upstream() -> SocketAddr {
    match read_first_nameserver(RESOLV_CONF_PATH) {
        Ok(addr) => SocketAddr::new(addr, 53),
        Err(e) => {
            tracing::warn!(
                error = %e,
                fallback = %FALLBACK_UPSTREAM,
                "upstream resolver discovery failed"
            );
            FALLBACK_UPSTREAM
        }
    }
}

fn read_first_nameserver(path: &str) -> Result<IpAddr> {
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {path}"))?;
    let config = resolv_conf::Config::parse(&raw).context("Failed to parse resolv.conf")?;
    let nameserver = config
        .nameservers
        .first()
        .context("resolv.conf lists no nameserver")?;
    Ok(match nameserver {
        resolv_conf::ScopedIp::V4(v4) => IpAddr::V4(*v4),
        resolv_conf::ScopedIp::V6(v6, _) => IpAddr::V6(*v6),
    })
}

/// Build a non-blocking UDP socket for one upstream exchange. The socket
/// carries [`FWMARK`] so the NAT redirect lets it through instead of
/// looping it back to the forwarder.
pub fn marked_client_socket(upstream: SocketAddr) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(upstream), Type::DGRAM, Some(Protocol::UDP))
        .context("Failed to create upstream socket")?;
    socket
        .set_mark(FWMARK)
        .context("Failed to set SO_MARK on upstream socket")?;
    socket
        .set_nonblocking(true)
        .context("Failed to make upstream socket non-blocking")?;
    let bind: SocketAddr = if upstream.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    socket
        .bind(&bind.into())
        .context("Failed to bind upstream socket")?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_public_resolver_on_53() {
        assert_eq!(FALLBACK_UPSTREAM.port(), 53);
        assert!(FALLBACK_UPSTREAM.is_ipv4());
    }
}
