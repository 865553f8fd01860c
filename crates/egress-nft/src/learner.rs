use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use egress_metrics::MetricsCollector;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, timeout_at};

use crate::manager::NftManager;
use crate::ruleset::learned_timeout_secs;

/// Inserts stay snappy but bursts of answers collapse into one nft call.
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// Channel capacity; learning is best-effort, so overflow just drops.
const QUEUE_DEPTH: usize = 1024;

/// One resolved A/AAAA answer authorized by an allow rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedIp {
    pub addr: IpAddr,
    pub ttl: u32,
}

/// Cheap handle the DNS forwarder uses to hand answers to the learner.
#[derive(Clone)]
pub struct LearnerHandle {
    tx: mpsc::Sender<ResolvedIp>,
}

impl LearnerHandle {
    /// Never blocks the DNS path; a full queue drops the entry.
    pub fn submit(&self, entry: ResolvedIp) {
        if self.tx.try_send(entry).is_err() {
            tracing::warn!(addr = %entry.addr, "learner queue full, dropping resolved IP");
        }
    }
}

/// Spawn the background learner task. The task drains resolved IPs,
/// coalesces them for up to [`COALESCE_WINDOW`], and flushes each batch
/// into the kernel's learned sets. Closing all handles flushes the final
/// batch and ends the task.
pub fn spawn_learner(
    nft: Arc<NftManager>,
    metrics: Arc<MetricsCollector>,
) -> (LearnerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let task = tokio::spawn(run_learner(rx, nft, metrics));
    (LearnerHandle { tx }, task)
}

async fn run_learner(
    mut rx: mpsc::Receiver<ResolvedIp>,
    nft: Arc<NftManager>,
    metrics: Arc<MetricsCollector>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = Instant::now() + COALESCE_WINDOW;
        let mut closed = false;
        loop {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(entry)) => batch.push(entry),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        flush_batch(&nft, &metrics, batch).await;

        if closed {
            return;
        }
    }
}

async fn flush_batch(nft: &NftManager, metrics: &MetricsCollector, batch: Vec<ResolvedIp>) {
    let (v4, v6) = coalesce_batch(batch);

    for (set, entries) in [("learned_v4", v4), ("learned_v6", v6)] {
        if entries.is_empty() {
            continue;
        }
        match nft.add_learned_elements(set, &entries).await {
            Ok(()) => {
                metrics.record_resolved_ips_added(entries.len() as u64);
                tracing::debug!(set, count = entries.len(), "learned resolved IPs");
            }
            Err(e) => {
                tracing::warn!(set, error = %e, "failed to insert learned IPs");
            }
        }
    }
}

/// Split a batch by family and dedupe addresses, keeping the longest
/// ageing when the same address was answered with different TTLs.
fn coalesce_batch(batch: Vec<ResolvedIp>) -> (Vec<(String, u64)>, Vec<(String, u64)>) {
    let mut v4: HashMap<String, u64> = HashMap::new();
    let mut v6: HashMap<String, u64> = HashMap::new();
    for entry in batch {
        let timeout = learned_timeout_secs(entry.ttl);
        let bucket = match entry.addr {
            IpAddr::V4(_) => &mut v4,
            IpAddr::V6(_) => &mut v6,
        };
        bucket
            .entry(entry.addr.to_string())
            .and_modify(|t| *t = (*t).max(timeout))
            .or_insert(timeout);
    }
    (v4.into_iter().collect(), v6.into_iter().collect())
}
