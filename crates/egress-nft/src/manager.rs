use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use egress_policy::NFT_TABLE;
use similar::{ChangeTag, TextDiff};
use tokio::sync::Mutex;

use crate::ruleset::{DOH_RULE_COMMENT, DOT_RULE_COMMENT};

/// Packet counts read back from the suppression rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounters {
    pub dot_853: u64,
    pub doh_443: u64,
}

/// Drives the `nft` binary: atomic ruleset applies, learned-set element
/// inserts, counter reads, and teardown.
pub struct NftManager {
    command_timeout: Duration,
    last_applied: Mutex<Option<String>>,
}

impl NftManager {
    pub fn new() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            last_applied: Mutex::new(None),
        }
    }

    /// Apply a rendered ruleset atomically via `nft -f -`.
    ///
    /// The script's leading `delete table` fails on a fresh host where the
    /// table does not exist yet; that one error is expected and the apply
    /// is retried once without the delete line.
    pub async fn apply_ruleset(&self, script: &str) -> Result<()> {
        {
            let last = self.last_applied.lock().await;
            if last.as_deref() == Some(script) {
                tracing::debug!(table = NFT_TABLE, "ruleset unchanged, skipping apply");
                return Ok(());
            }
            if let Some(previous) = last.as_deref() {
                tracing::debug!(
                    table = NFT_TABLE,
                    diff = %render_script_diff(previous, script),
                    "ruleset changed"
                );
            }
        }

        match self.run_script(script).await {
            Ok(()) => {}
            Err(e) if is_missing_table_error(&e) => {
                let without_delete: String = script
                    .lines()
                    .filter(|line| !line.trim_start().starts_with("delete table"))
                    .map(|line| format!("{line}\n"))
                    .collect();
                self.run_script(&without_delete)
                    .await
                    .context("nft apply retry without delete failed")?;
            }
            Err(e) => return Err(e),
        }

        *self.last_applied.lock().await = Some(script.to_string());
        Ok(())
    }

    async fn run_script(&self, script: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        use tokio::process::Command;

        let mut child = Command::new("nft")
            .arg("-f")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn nft command")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            drop(stdin);
        }

        let output = tokio::time::timeout(self.command_timeout, child.wait_with_output())
            .await
            .context("nft command timed out")??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("nft command failed: {}", stderr);
        }

        Ok(())
    }

    /// Insert learned elements; `entries` are `(address, timeout_secs)`.
    pub async fn add_learned_elements(&self, set: &str, entries: &[(String, u64)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let script = crate::ruleset::render_learned_elements(set, entries);
        match self.run_script(&script).await {
            Ok(()) => Ok(()),
            // Re-learning an address that is already present is not an error.
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Snapshot the live table as JSON, `None` when it does not exist.
    pub async fn snapshot_table(&self) -> Result<Option<String>> {
        use tokio::process::Command;

        let output = Command::new("nft")
            .arg("-j")
            .arg("list")
            .arg("table")
            .arg("inet")
            .arg(NFT_TABLE)
            .output()
            .await
            .context("Failed to list nftables table")?;

        if output.status.success() {
            return Ok(Some(String::from_utf8_lossy(&output.stdout).to_string()));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such file or directory") {
            return Ok(None);
        }

        anyhow::bail!("Failed to snapshot table {}: {}", NFT_TABLE, stderr);
    }

    /// Read the DoT/DoH drop rule counters from the live table.
    pub async fn read_drop_counters(&self) -> Result<DropCounters> {
        let Some(raw) = self.snapshot_table().await? else {
            return Ok(DropCounters::default());
        };
        parse_drop_counters(&raw)
    }

    /// Delete the table. Missing table is not an error.
    pub async fn delete_table(&self) -> Result<()> {
        use tokio::process::Command;

        let output = Command::new("nft")
            .arg("delete")
            .arg("table")
            .arg("inet")
            .arg(NFT_TABLE)
            .output()
            .await
            .context("Failed to run nft delete table")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such file or directory") {
                anyhow::bail!("Failed to delete table: {}", stderr);
            }
        }

        *self.last_applied.lock().await = None;
        tracing::info!(table = NFT_TABLE, "deleted nftables table");
        Ok(())
    }
}

impl Default for NftManager {
    fn default() -> Self {
        Self::new()
    }
}

fn is_missing_table_error(error: &anyhow::Error) -> bool {
    error.to_string().contains("No such file or directory")
}

/// Extract the packet counts of the tagged suppression rules from
/// `nft -j list table` output.
fn parse_drop_counters(raw: &str) -> Result<DropCounters> {
    let doc: serde_json::Value =
        serde_json::from_str(raw).context("Failed to parse nft JSON output")?;

    let mut counters = DropCounters::default();
    let Some(entries) = doc.get("nftables").and_then(|n| n.as_array()) else {
        return Ok(counters);
    };

    for entry in entries {
        let Some(rule) = entry.get("rule") else {
            continue;
        };
        let Some(comment) = rule.get("comment").and_then(|c| c.as_str()) else {
            continue;
        };
        let packets = rule
            .get("expr")
            .and_then(|e| e.as_array())
            .and_then(|exprs| {
                exprs
                    .iter()
                    .find_map(|expr| expr.get("counter")?.get("packets")?.as_u64())
            })
            .unwrap_or(0);
        match comment {
            DOT_RULE_COMMENT => counters.dot_853 += packets,
            DOH_RULE_COMMENT => counters.doh_443 += packets,
            _ => {}
        }
    }

    Ok(counters)
}

fn render_script_diff(current: &str, desired: &str) -> String {
    let diff = TextDiff::from_lines(current, desired);
    let mut output = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => continue,
        };
        output.push(sign);
        output.push_str(change.value());
    }

    output
}
