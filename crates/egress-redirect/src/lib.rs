use std::time::Duration;

use anyhow::{Context, Result};
use egress_policy::{DNS_PROXY_PORT, FWMARK};
use tokio::process::Command;

/// Comment tag on every rule this manager owns, so its own rules are
/// recognizable across restarts.
pub const RULE_COMMENT: &str = "opensandbox-egress";

const INSTALL_ATTEMPTS: u32 = 5;
const INSTALL_BACKOFF: Duration = Duration::from_millis(500);

/// Installs the NAT OUTPUT rules that steer all port-53 traffic in the
/// namespace to the local DNS forwarder. Packets carrying the forwarder's
/// own mark take the RETURN branch and reach the real upstream.
pub struct RedirectManager {
    proxy_port: u16,
}

impl RedirectManager {
    pub fn new() -> Self {
        Self {
            proxy_port: DNS_PROXY_PORT,
        }
    }

    /// The four rule specs in install order: mark bypasses first, then the
    /// redirects.
    fn rule_specs(&self) -> Vec<Vec<String>> {
        let mark = format!("{FWMARK:#x}");
        let port = self.proxy_port.to_string();
        let mut specs = Vec::with_capacity(4);
        for proto in ["udp", "tcp"] {
            specs.push(
                [
                    "-p", proto, "--dport", "53", "-m", "mark", "--mark", &mark, "-m", "comment",
                    "--comment", RULE_COMMENT, "-j", "RETURN",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            );
        }
        for proto in ["udp", "tcp"] {
            specs.push(
                [
                    "-p", proto, "--dport", "53", "-m", "comment", "--comment", RULE_COMMENT,
                    "-j", "REDIRECT", "--to-ports", &port,
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            );
        }
        specs
    }

    /// Install the redirect rules, retrying over a short grace window so a
    /// namespace that is still settling does not abort startup.
    pub async fn install(&self) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=INSTALL_ATTEMPTS {
            match self.install_once().await {
                Ok(()) => {
                    tracing::info!(port = self.proxy_port, "DNS redirect rules installed");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "iptables install attempt failed");
                    last_error = Some(e);
                    if attempt < INSTALL_ATTEMPTS {
                        tokio::time::sleep(INSTALL_BACKOFF).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("iptables install failed")))
            .context("Failed to install DNS redirect rules")
    }

    async fn install_once(&self) -> Result<()> {
        for spec in self.rule_specs() {
            if !self.rule_exists(&spec).await? {
                self.run_iptables("-A", &spec).await?;
            }
        }
        Ok(())
    }

    /// Remove the rules. Failures are logged and swallowed; the
    /// orchestrator destroys the namespace anyway.
    pub async fn remove(&self) {
        for spec in self.rule_specs() {
            if let Err(e) = self.run_iptables("-D", &spec).await {
                tracing::debug!(error = %e, "iptables rule removal skipped");
            }
        }
        tracing::info!("DNS redirect rules removed");
    }

    async fn rule_exists(&self, spec: &[String]) -> Result<bool> {
        let status = Command::new("iptables")
            .args(["-t", "nat", "-C", "OUTPUT"])
            .args(spec)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .context("Failed to run iptables -C")?;
        Ok(status.success())
    }

    async fn run_iptables(&self, op: &str, spec: &[String]) -> Result<()> {
        let output = Command::new("iptables")
            .args(["-t", "nat", op, "OUTPUT"])
            .args(spec)
            .output()
            .await
            .context("Failed to run iptables")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("iptables {} failed: {}", op, stderr);
        }

        Ok(())
    }
}

impl Default for RedirectManager {
    fn default() -> Self {
        Self::new()
    }
}
