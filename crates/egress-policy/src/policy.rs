use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Wire shape of a policy, as ingested over HTTP or from the bootstrap env.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(rename = "defaultAction", default)]
    pub default_action: Option<String>,
    #[serde(default)]
    pub egress: Vec<RuleDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDocument {
    pub action: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            _ => Err(PolicyError::InvalidAction(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// Process-lifetime enforcement level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Dns,
    DnsNft,
}

impl Mode {
    /// Case-insensitive parse; anything unrecognized is `None` so the
    /// caller can log and fall back to DNS-only.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dns" => Some(Self::Dns),
            "dns+nft" => Some(Self::DnsNft),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::DnsNft => "dns+nft",
        }
    }
}

/// A canonicalized rule target. Exactly one kind per rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Absolute FQDN, lower-cased, trailing dot stripped.
    Fqdn(String),
    /// `*.suffix` pattern, stored as the bare suffix.
    Wildcard(String),
    /// IPv4/IPv6 address or CIDR, normalized to its network address.
    Net(IpNet),
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PolicyError::InvalidTarget(raw.to_string()));
        }

        if let Ok(net) = trimmed.parse::<IpNet>() {
            return Ok(Self::Net(net.trunc()));
        }
        if let Ok(addr) = trimmed.parse::<IpAddr>() {
            return Ok(Self::Net(IpNet::from(addr)));
        }
        if trimmed.contains('/') {
            return Err(PolicyError::InvalidTarget(raw.to_string()));
        }

        let name = normalize_fqdn(trimmed);
        if let Some(suffix) = name.strip_prefix("*.") {
            if suffix.is_empty() || !has_valid_labels(suffix) {
                return Err(PolicyError::InvalidTarget(raw.to_string()));
            }
            return Ok(Self::Wildcard(suffix.to_string()));
        }
        if !name.contains('.') || !has_valid_labels(&name) {
            return Err(PolicyError::InvalidTarget(raw.to_string()));
        }
        Ok(Self::Fqdn(name))
    }

    /// Canonical textual form, used for rendering and duplicate detection.
    pub fn canonical(&self) -> String {
        match self {
            Self::Fqdn(name) => name.clone(),
            Self::Wildcard(suffix) => format!("*.{suffix}"),
            Self::Net(net) => net.to_string(),
        }
    }

    pub fn is_fqdn(&self) -> bool {
        matches!(self, Self::Fqdn(_) | Self::Wildcard(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub action: Action,
    pub target: Target,
}

/// Lower-case and strip the trailing dot of a query or rule name.
pub fn normalize_fqdn(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Every dot-separated label must be non-empty and restricted to hostname
/// characters. The single leading `*.` label is stripped by the caller.
fn has_valid_labels(name: &str) -> bool {
    name.split('.').all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exact_fqdn_and_normalizes() {
        let target = Target::parse("Files.PyPI.org.").unwrap();
        assert_eq!(target, Target::Fqdn("files.pypi.org".into()));
        assert_eq!(target.canonical(), "files.pypi.org");
    }

    #[test]
    fn parses_wildcard_suffix() {
        let target = Target::parse("*.pypi.org").unwrap();
        assert_eq!(target, Target::Wildcard("pypi.org".into()));
        assert_eq!(target.canonical(), "*.pypi.org");
        assert_eq!(
            Target::parse("*.org").unwrap(),
            Target::Wildcard("org".into())
        );
    }

    #[test]
    fn rejects_inner_wildcards() {
        assert!(Target::parse("a.*.example.com").is_err());
        assert!(Target::parse("*.").is_err());
        assert!(Target::parse("*.*.com").is_err());
    }

    #[test]
    fn parses_addresses_as_host_prefixes() {
        assert_eq!(
            Target::parse("8.8.8.8").unwrap(),
            Target::Net("8.8.8.8/32".parse().unwrap())
        );
        assert_eq!(
            Target::parse("2001:db8::1").unwrap(),
            Target::Net("2001:db8::1/128".parse().unwrap())
        );
    }

    #[test]
    fn normalizes_cidr_host_bits() {
        let target = Target::parse("10.0.0.1/8").unwrap();
        assert_eq!(target.canonical(), "10.0.0.0/8");
    }

    #[test]
    fn rejects_ambiguous_targets() {
        assert!(Target::parse("not an fqdn").is_err());
        assert!(Target::parse("localhost").is_err());
        assert!(Target::parse("10.0.0.0/33").is_err());
        assert!(Target::parse("example..com").is_err());
        assert!(Target::parse("").is_err());
    }

    #[test]
    fn action_parse_is_strict() {
        assert_eq!(Action::parse("allow").unwrap(), Action::Allow);
        assert_eq!(Action::parse("Deny").unwrap(), Action::Deny);
        assert!(Action::parse("accept").is_err());
    }

    #[test]
    fn mode_parse_is_case_insensitive() {
        assert_eq!(Mode::parse("DNS"), Some(Mode::Dns));
        assert_eq!(Mode::parse("dns+nft"), Some(Mode::DnsNft));
        assert_eq!(Mode::parse("nft"), None);
    }
}
