use std::fmt::Write;

use egress_policy::{Action, FWMARK, NFT_CHAIN, NFT_TABLE, PolicySnapshot};
use ipnet::IpNet;

/// Comment tags on the suppression rules; the counter scrape finds the
/// rules by these strings in `nft -j list table` output.
pub const DOT_RULE_COMMENT: &str = "dot_853";
pub const DOH_RULE_COMMENT: &str = "doh_443";

/// Default ageing applied to learned-set entries when the answer TTL is
/// unknown or very small.
pub const LEARNED_TIMEOUT_FLOOR_SECS: u64 = 60;

/// Rendering options derived from the environment, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct NftOptions {
    /// Drop tcp/udp 853 (DNS-over-TLS). Always on in dns+nft deployments.
    pub suppress_dot: bool,
    /// Drop DNS-over-HTTPS traffic on tcp/443.
    pub suppress_doh: bool,
    /// When non-empty, DoH suppression drops only these destinations
    /// instead of all of tcp/443.
    pub doh_blocklist: Vec<IpNet>,
}

/// Render the policy into a single atomic `nft -f` script.
///
/// The script deletes and re-creates the whole table, so a successful
/// apply replaces kernel state in one transaction and implicitly clears
/// previously learned entries.
pub fn render_ruleset(snapshot: &PolicySnapshot, options: &NftOptions) -> String {
    let mut script = String::new();
    let t = NFT_TABLE;
    let c = NFT_CHAIN;

    let _ = writeln!(script, "delete table inet {t}");
    let _ = writeln!(script, "add table inet {t}");

    for (name, kind) in [
        ("allow_v4", "ipv4_addr"),
        ("deny_v4", "ipv4_addr"),
        ("allow_v6", "ipv6_addr"),
        ("deny_v6", "ipv6_addr"),
    ] {
        let _ = writeln!(
            script,
            "add set inet {t} {name} {{ type {kind} ; flags interval ; auto-merge ; }}"
        );
    }
    for (name, kind) in [("learned_v4", "ipv4_addr"), ("learned_v6", "ipv6_addr")] {
        let _ = writeln!(
            script,
            "add set inet {t} {name} {{ type {kind} ; flags timeout ; timeout {LEARNED_TIMEOUT_FLOOR_SECS}s ; }}"
        );
    }

    let doh_targeted = options.suppress_doh && !options.doh_blocklist.is_empty();
    if doh_targeted {
        for (name, kind) in [("doh_block_v4", "ipv4_addr"), ("doh_block_v6", "ipv6_addr")] {
            let _ = writeln!(
                script,
                "add set inet {t} {name} {{ type {kind} ; flags interval ; auto-merge ; }}"
            );
        }
    }

    add_elements(&mut script, "allow_v4", snapshot.allow_v4());
    add_elements(&mut script, "deny_v4", snapshot.deny_v4());
    add_elements(&mut script, "allow_v6", snapshot.allow_v6());
    add_elements(&mut script, "deny_v6", snapshot.deny_v6());
    if doh_targeted {
        let v4: Vec<String> = options
            .doh_blocklist
            .iter()
            .filter(|net| matches!(net, IpNet::V4(_)))
            .map(|net| net.to_string())
            .collect();
        let v6: Vec<String> = options
            .doh_blocklist
            .iter()
            .filter(|net| matches!(net, IpNet::V6(_)))
            .map(|net| net.to_string())
            .collect();
        add_elements(&mut script, "doh_block_v4", &v4);
        add_elements(&mut script, "doh_block_v6", &v6);
    }

    let policy = match snapshot.default_action() {
        Action::Deny => "drop",
        Action::Allow => "accept",
    };
    let _ = writeln!(
        script,
        "add chain inet {t} {c} {{ type filter hook output priority 0 ; policy {policy} ; }}"
    );

    let _ = writeln!(
        script,
        "add rule inet {t} {c} ct state established,related accept"
    );
    let _ = writeln!(script, "add rule inet {t} {c} meta mark {FWMARK:#x} accept");
    let _ = writeln!(script, "add rule inet {t} {c} oifname \"lo\" accept");

    if options.suppress_dot {
        for proto in ["tcp", "udp"] {
            let _ = writeln!(
                script,
                "add rule inet {t} {c} {proto} dport 853 counter drop comment \"{DOT_RULE_COMMENT}\""
            );
        }
    }
    if options.suppress_doh {
        if doh_targeted {
            let _ = writeln!(
                script,
                "add rule inet {t} {c} ip daddr @doh_block_v4 tcp dport 443 counter drop comment \"{DOH_RULE_COMMENT}\""
            );
            let _ = writeln!(
                script,
                "add rule inet {t} {c} ip6 daddr @doh_block_v6 tcp dport 443 counter drop comment \"{DOH_RULE_COMMENT}\""
            );
        } else {
            let _ = writeln!(
                script,
                "add rule inet {t} {c} tcp dport 443 counter drop comment \"{DOH_RULE_COMMENT}\""
            );
        }
    }

    let _ = writeln!(script, "add rule inet {t} {c} ip daddr @deny_v4 drop");
    let _ = writeln!(script, "add rule inet {t} {c} ip6 daddr @deny_v6 drop");
    let _ = writeln!(script, "add rule inet {t} {c} ip daddr @allow_v4 accept");
    let _ = writeln!(script, "add rule inet {t} {c} ip6 daddr @allow_v6 accept");
    let _ = writeln!(script, "add rule inet {t} {c} ip daddr @learned_v4 accept");
    let _ = writeln!(script, "add rule inet {t} {c} ip6 daddr @learned_v6 accept");

    if snapshot.default_action() == Action::Deny {
        let _ = writeln!(script, "add rule inet {t} {c} counter drop");
    }

    script
}

fn add_elements<T: ToString>(script: &mut String, set: &str, elements: &[T]) {
    if elements.is_empty() {
        return;
    }
    let joined = elements
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(
        script,
        "add element inet {} {set} {{ {joined} }}",
        NFT_TABLE
    );
}

/// Render the `add element` script for a batch of learned addresses.
/// Timeouts are per element: answer TTL plus slack, floored.
pub fn render_learned_elements(set: &str, entries: &[(String, u64)]) -> String {
    let joined = entries
        .iter()
        .map(|(addr, timeout)| format!("{addr} timeout {timeout}s"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("add element inet {} {set} {{ {joined} }}\n", NFT_TABLE)
}

/// Element timeout for a learned answer: slightly above the TTL, never
/// below the floor.
pub fn learned_timeout_secs(ttl: u32) -> u64 {
    (u64::from(ttl) + 10).max(LEARNED_TIMEOUT_FLOOR_SECS)
}
