pub mod error;
pub mod policy;
pub mod snapshot;

pub use error::*;
pub use policy::*;
pub use snapshot::*;

/// SO_MARK value stamped on the DNS forwarder's upstream sockets.
///
/// The iptables redirect manager and the nftables ruleset both accept
/// packets carrying this mark unchanged; changing it in one place breaks
/// the bypass contract.
pub const FWMARK: u32 = 0x00051535;

/// Loopback port the DNS forwarder listens on and the NAT redirect targets.
pub const DNS_PROXY_PORT: u16 = 15353;

/// Name of the inet table owned by the sidecar.
pub const NFT_TABLE: &str = "opensandbox";

/// Name of the output-hooked filter chain inside [`NFT_TABLE`].
pub const NFT_CHAIN: &str = "egress";
