use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow};
use egress_policy::Mode;
use ipnet::IpNet;

pub const ENV_RULES: &str = "OPENSANDBOX_EGRESS_RULES";
pub const ENV_MODE: &str = "OPENSANDBOX_EGRESS_MODE";
pub const ENV_HTTP_ADDR: &str = "OPENSANDBOX_EGRESS_HTTP_ADDR";
pub const ENV_TOKEN: &str = "OPENSANDBOX_EGRESS_TOKEN";
pub const ENV_BLOCK_DOH: &str = "OPENSANDBOX_EGRESS_BLOCK_DOH_443";
pub const ENV_DOH_BLOCKLIST: &str = "OPENSANDBOX_EGRESS_DOH_BLOCKLIST";
pub const ENV_INSTANCE_ID: &str = "OPENSANDBOX_EGRESS_INSTANCE_ID";

const DEFAULT_HTTP_ADDR: &str = ":18080";

/// Process configuration, read from the environment exactly once.
#[derive(Debug, Clone)]
pub struct Config {
    pub bootstrap_rules: Option<String>,
    pub mode: Mode,
    pub http_addr: SocketAddr,
    pub token: Option<String>,
    pub block_doh_443: bool,
    pub doh_blocklist: Vec<IpNet>,
    pub instance_id: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// The actual parser, decoupled from the process environment so tests
    /// can feed it directly.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bootstrap_rules = lookup(ENV_RULES).filter(|raw| !raw.trim().is_empty());

        let mode = match lookup(ENV_MODE) {
            None => Mode::Dns,
            Some(raw) => Mode::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "unrecognized enforcement mode, using dns");
                Mode::Dns
            }),
        };

        let http_addr = parse_listen_addr(
            lookup(ENV_HTTP_ADDR)
                .as_deref()
                .unwrap_or(DEFAULT_HTTP_ADDR),
        )
        .with_context(|| format!("Invalid {ENV_HTTP_ADDR}"))?;

        let token = lookup(ENV_TOKEN).filter(|t| !t.is_empty());

        let block_doh_443 = lookup(ENV_BLOCK_DOH)
            .map(|raw| is_truthy(&raw))
            .unwrap_or(false);

        let doh_blocklist = match lookup(ENV_DOH_BLOCKLIST) {
            None => Vec::new(),
            Some(raw) => parse_blocklist(&raw).with_context(|| format!("Invalid {ENV_DOH_BLOCKLIST}"))?,
        };

        let instance_id = lookup(ENV_INSTANCE_ID)
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| {
                hostname::get()
                    .ok()
                    .and_then(|name| name.into_string().ok())
                    .unwrap_or_else(|| "unknown".to_string())
            });

        Ok(Self {
            bootstrap_rules,
            mode,
            http_addr,
            token,
            block_doh_443,
            doh_blocklist,
            instance_id,
        })
    }
}

/// Accept `:PORT` shorthand (bind all interfaces) as well as full
/// `HOST:PORT` addresses.
fn parse_listen_addr(raw: &str) -> Result<SocketAddr> {
    let trimmed = raw.trim();
    let candidate = if trimmed.starts_with(':') {
        format!("0.0.0.0{trimmed}")
    } else {
        trimmed.to_string()
    };
    candidate
        .parse()
        .map_err(|_| anyhow!("'{raw}' is not a listen address"))
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn parse_blocklist(raw: &str) -> Result<Vec<IpNet>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            if let Ok(net) = entry.parse::<IpNet>() {
                return Ok(net.trunc());
            }
            entry
                .parse::<std::net::IpAddr>()
                .map(IpNet::from)
                .map_err(|_| anyhow!("'{entry}' is not an IP or CIDR"))
        })
        .collect()
}
