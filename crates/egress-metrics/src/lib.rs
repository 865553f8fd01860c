use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Result;
use egress_policy::{Action, Mode};
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// Metrics collector for the egress sidecar.
///
/// Every metric carries a constant `instance_id` label; names, types, and
/// label sets are part of the scrape contract and must not drift.
pub struct MetricsCollector {
    registry: Registry,
    started: Instant,

    dns_queries: IntCounterVec,
    forward_duration: Histogram,

    policy_updates: IntCounter,
    policy_rule_count: IntGaugeVec,
    enforcement_mode: IntGaugeVec,

    nft_apply: IntCounterVec,
    resolved_ips_added: IntCounter,
    doh_dot_dropped: IntCounterVec,

    violations: IntCounterVec,
    info: IntGaugeVec,
    uptime: Gauge,

    // Last kernel counter readings, so scrape deltas stay monotonic.
    kernel_drops_seen: Mutex<KernelDropsSeen>,
}

#[derive(Default)]
struct KernelDropsSeen {
    dot_853: u64,
    doh_443: u64,
}

impl MetricsCollector {
    pub fn new(instance_id: &str) -> Result<Self> {
        let labels = HashMap::from([(String::from("instance_id"), instance_id.to_string())]);
        let registry = Registry::new_custom(None, Some(labels))?;

        let dns_queries = IntCounterVec::new(
            Opts::new(
                "opensandbox_egress_dns_queries_total",
                "DNS queries served, by outcome",
            ),
            &["result"],
        )?;
        registry.register(Box::new(dns_queries.clone()))?;

        let forward_duration = Histogram::with_opts(HistogramOpts::new(
            "opensandbox_egress_dns_forward_duration_seconds",
            "Latency of upstream DNS forwards",
        ))?;
        registry.register(Box::new(forward_duration.clone()))?;

        let policy_updates = IntCounter::new(
            "opensandbox_egress_policy_updates_total",
            "Successful policy replacements",
        )?;
        registry.register(Box::new(policy_updates.clone()))?;

        let policy_rule_count = IntGaugeVec::new(
            Opts::new(
                "opensandbox_egress_policy_rule_count",
                "Rules in the active policy",
            ),
            &["default_action"],
        )?;
        registry.register(Box::new(policy_rule_count.clone()))?;

        let enforcement_mode = IntGaugeVec::new(
            Opts::new(
                "opensandbox_egress_enforcement_mode",
                "Active enforcement mode (1 on the active mode)",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(enforcement_mode.clone()))?;

        let nft_apply = IntCounterVec::new(
            Opts::new(
                "opensandbox_egress_nft_apply_total",
                "nftables ruleset applies, by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(nft_apply.clone()))?;

        let resolved_ips_added = IntCounter::new(
            "opensandbox_egress_nft_resolved_ips_added_total",
            "Resolved IPs inserted into the learned sets",
        )?;
        registry.register(Box::new(resolved_ips_added.clone()))?;

        let doh_dot_dropped = IntCounterVec::new(
            Opts::new(
                "opensandbox_egress_nft_doh_dot_packets_dropped_total",
                "Packets dropped by the DoT/DoH suppression rules",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(doh_dot_dropped.clone()))?;

        let violations = IntCounterVec::new(
            Opts::new(
                "opensandbox_egress_violations_total",
                "Policy violations observed",
            ),
            &["type"],
        )?;
        registry.register(Box::new(violations.clone()))?;

        let info = IntGaugeVec::new(
            Opts::new("opensandbox_egress_info", "Static instance information"),
            &["enforcement_mode", "version"],
        )?;
        registry.register(Box::new(info.clone()))?;

        let uptime = Gauge::new(
            "opensandbox_egress_uptime_seconds",
            "Seconds since process start",
        )?;
        registry.register(Box::new(uptime.clone()))?;

        Ok(Self {
            registry,
            started: Instant::now(),
            dns_queries,
            forward_duration,
            policy_updates,
            policy_rule_count,
            enforcement_mode,
            nft_apply,
            resolved_ips_added,
            doh_dot_dropped,
            violations,
            info,
            uptime,
            kernel_drops_seen: Mutex::new(KernelDropsSeen::default()),
        })
    }

    pub fn record_query_allowed(&self) {
        self.dns_queries.with_label_values(&["allowed"]).inc();
    }

    /// Every synthesized NXDOMAIN is both a denied query and a violation.
    pub fn record_query_denied(&self) {
        self.dns_queries.with_label_values(&["denied"]).inc();
        self.violations.with_label_values(&["dns_deny"]).inc();
    }

    pub fn record_query_forward_error(&self) {
        self.dns_queries.with_label_values(&["forward_error"]).inc();
    }

    pub fn observe_forward_latency(&self, seconds: f64) {
        self.forward_duration.observe(seconds);
    }

    /// Record a successful POST /policy swap.
    pub fn record_policy_update(&self, rule_count: usize, default_action: Action) {
        self.policy_updates.inc();
        self.set_policy_rule_count(rule_count, default_action);
    }

    /// Set the rule-count gauge without counting an update (startup path).
    pub fn set_policy_rule_count(&self, rule_count: usize, default_action: Action) {
        for action in [Action::Allow, Action::Deny] {
            let value = if action == default_action {
                rule_count as i64
            } else {
                0
            };
            self.policy_rule_count
                .with_label_values(&[action.as_str()])
                .set(value);
        }
    }

    /// Fix the mode gauges and info gauge once the final mode is known.
    pub fn set_enforcement_mode(&self, mode: Mode, version: &str) {
        for candidate in [Mode::Dns, Mode::DnsNft] {
            let value = if candidate == mode { 1 } else { 0 };
            self.enforcement_mode
                .with_label_values(&[candidate.as_str()])
                .set(value);
        }
        self.info
            .with_label_values(&[mode.as_str(), version])
            .set(1);
    }

    pub fn record_nft_apply(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.nft_apply.with_label_values(&[result]).inc();
    }

    pub fn record_resolved_ips_added(&self, count: u64) {
        self.resolved_ips_added.inc_by(count);
    }

    /// Fold absolute kernel counter readings into the monotonic counters.
    /// A reading lower than the last one (table was rebuilt) resets the
    /// baseline without emitting a delta.
    pub fn record_kernel_drop_counters(&self, dot_853: u64, doh_443: u64) {
        let mut seen = self
            .kernel_drops_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if dot_853 >= seen.dot_853 {
            self.doh_dot_dropped
                .with_label_values(&["dot_853"])
                .inc_by(dot_853 - seen.dot_853);
        }
        if doh_443 >= seen.doh_443 {
            self.doh_dot_dropped
                .with_label_values(&["doh_443"])
                .inc_by(doh_443 - seen.doh_443);
        }
        seen.dot_853 = dot_853;
        seen.doh_443 = doh_443;
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        self.uptime.set(self.started.elapsed().as_secs_f64());
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
