mod config;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use egress_api::{AppState, Enforcement};
use egress_dns::{DnsForwarder, bind_listeners, discover_upstream};
use egress_metrics::MetricsCollector;
use egress_nft::{NftManager, NftOptions, render_ruleset, spawn_learner};
use egress_policy::{Mode, PolicySnapshot};
use egress_redirect::RedirectManager;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinError;

use crate::config::Config;

#[tokio::main]
async fn main() {
    init_tracing();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("fatal startup error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run() -> Result<i32> {
    let config = Config::from_env()?;
    ensure_net_admin()?;

    let metrics = Arc::new(MetricsCollector::new(&config.instance_id)?);

    let bootstrap = match &config.bootstrap_rules {
        Some(raw) => PolicySnapshot::parse(raw.as_bytes())
            .with_context(|| format!("Invalid bootstrap policy in {}", config::ENV_RULES))?,
        None => PolicySnapshot::default_deny(),
    };
    let active = Arc::new(ArcSwap::from_pointee(bootstrap));

    let upstream = discover_upstream();

    // DNS listeners come up before the redirect so intercepted queries
    // always have a live destination.
    let (udp, tcp) = bind_listeners().await?;

    let redirect = RedirectManager::new();
    redirect.install().await?;

    let mut mode = config.mode;
    let mut enforcement = Enforcement::DnsOnly;
    let mut learner = None;
    let mut learner_task = None;
    if mode == Mode::DnsNft {
        let nft = Arc::new(NftManager::new());
        let options = NftOptions {
            suppress_dot: true,
            suppress_doh: config.block_doh_443 || !config.doh_blocklist.is_empty(),
            doh_blocklist: config.doh_blocklist.clone(),
        };
        let script = render_ruleset(&active.load(), &options);
        match nft.apply_ruleset(&script).await {
            Ok(()) => {
                metrics.record_nft_apply(true);
                let (handle, task) = spawn_learner(nft.clone(), metrics.clone());
                learner = Some(handle);
                learner_task = Some(task);
                enforcement = Enforcement::DnsNft { nft, options };
            }
            Err(e) => {
                metrics.record_nft_apply(false);
                tracing::error!(
                    "initial nftables apply failed, demoting to dns-only enforcement: {e:#}"
                );
                mode = Mode::Dns;
            }
        }
    }

    metrics.set_enforcement_mode(mode, env!("CARGO_PKG_VERSION"));
    {
        let snapshot = active.load();
        metrics.set_policy_rule_count(snapshot.rule_count(), snapshot.default_action());
    }

    let forwarder = Arc::new(DnsForwarder::new(
        active.clone(),
        upstream,
        metrics.clone(),
        learner.clone(),
    ));
    let mut udp_task = tokio::spawn(forwarder.clone().run_udp(udp));
    let mut tcp_task = tokio::spawn(forwarder.clone().run_tcp(tcp));

    let ready = Arc::new(AtomicBool::new(true));
    let state = Arc::new(AppState::new(
        active.clone(),
        metrics.clone(),
        enforcement,
        config.token.clone(),
        ready,
    ));
    let mut http_task = tokio::spawn(egress_api::serve(config.http_addr, state.clone()));

    tracing::info!(
        instance_id = %config.instance_id,
        mode = mode.as_str(),
        %upstream,
        http_addr = %config.http_addr,
        "egress sidecar ready"
    );

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let exit_code = tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
            0
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, shutting down");
            0
        }
        result = &mut udp_task => {
            log_task_exit("UDP DNS listener", result);
            2
        }
        result = &mut tcp_task => {
            log_task_exit("TCP DNS listener", result);
            2
        }
        result = &mut http_task => {
            log_task_exit("HTTP server", result);
            2
        }
    };

    // Stop accepting new work; in-flight queries are bounded by the
    // upstream timeout and finish on their own tasks.
    udp_task.abort();
    tcp_task.abort();
    http_task.abort();

    // Dropping every learner handle closes its channel, which flushes the
    // pending batch before the task exits.
    drop(forwarder);
    drop(learner);
    if let Some(task) = learner_task {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    redirect.remove().await;
    if let Enforcement::DnsNft { nft, .. } = &state.enforcement {
        if let Err(e) = nft.delete_table().await {
            tracing::warn!(error = %e, "nftables teardown failed");
        }
    }

    Ok(exit_code)
}

fn ensure_net_admin() -> Result<()> {
    let has_net_admin = caps::has_cap(
        None,
        caps::CapSet::Effective,
        caps::Capability::CAP_NET_ADMIN,
    )
    .is_ok_and(|b| b);

    if !has_net_admin {
        anyhow::bail!(
            "CAP_NET_ADMIN is missing; cannot manage iptables/nftables, refusing to run unenforced"
        );
    }
    Ok(())
}

fn log_task_exit(name: &str, result: Result<Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => tracing::error!(task = name, "exited unexpectedly"),
        Ok(Err(e)) => tracing::error!(task = name, "failed: {e:#}"),
        Err(e) => tracing::error!(task = name, error = %e, "panicked"),
    }
}
