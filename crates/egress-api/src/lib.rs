use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use egress_metrics::MetricsCollector;
use egress_nft::{NftManager, NftOptions, render_ruleset};
use egress_policy::PolicySnapshot;

/// Request header carrying the policy auth token.
pub const AUTH_HEADER: &str = "opensandbox-egress-auth";

/// Layer-2 backend the POST handler reconciles before publishing a
/// snapshot. DNS-only deployments (including demoted ones) skip the
/// kernel step entirely.
pub enum Enforcement {
    DnsOnly,
    DnsNft {
        nft: Arc<NftManager>,
        options: NftOptions,
    },
}

pub struct AppState {
    pub active: Arc<ArcSwap<PolicySnapshot>>,
    pub metrics: Arc<MetricsCollector>,
    pub enforcement: Enforcement,
    pub token: Option<String>,
    pub ready: Arc<AtomicBool>,
    /// Serializes render → kernel apply → pointer publish across POSTs.
    swap_lock: tokio::sync::Mutex<()>,
}

impl AppState {
    pub fn new(
        active: Arc<ArcSwap<PolicySnapshot>>,
        metrics: Arc<MetricsCollector>,
        enforcement: Enforcement,
        token: Option<String>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            active,
            metrics,
            enforcement,
            token,
            ready,
            swap_lock: tokio::sync::Mutex::new(()),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/policy", get(get_policy).post(post_policy))
        .route("/metrics", get(get_metrics))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve the policy/metrics/health API until the process exits.
pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {addr}"))?;
    tracing::info!(%addr, "policy API listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server failed")?;
    Ok(())
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.token.as_deref() else {
        return true;
    };
    headers
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == expected)
        .unwrap_or(false)
}

async fn get_policy(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, "invalid auth token\n").into_response();
    }
    axum::Json(state.active.load().to_document()).into_response()
}

async fn post_policy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, "invalid auth token\n").into_response();
    }

    let _guard = state.swap_lock.lock().await;

    let snapshot = match PolicySnapshot::parse(&body) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(error = %e, "rejected policy update");
            return (StatusCode::BAD_REQUEST, format!("{e}\n")).into_response();
        }
    };

    if let Enforcement::DnsNft { nft, options } = &state.enforcement {
        let script = render_ruleset(&snapshot, options);
        match nft.apply_ruleset(&script).await {
            Ok(()) => state.metrics.record_nft_apply(true),
            Err(e) => {
                state.metrics.record_nft_apply(false);
                tracing::error!(error = %e, "nft apply failed, keeping previous policy");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to apply packet filter\n",
                )
                    .into_response();
            }
        }
    }

    let rule_count = snapshot.rule_count();
    let default_action = snapshot.default_action();
    state.active.store(Arc::new(snapshot));
    state.metrics.record_policy_update(rule_count, default_action);
    tracing::info!(
        rules = rule_count,
        default_action = default_action.as_str(),
        "policy updated"
    );

    StatusCode::NO_CONTENT.into_response()
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Response {
    if let Enforcement::DnsNft { nft, .. } = &state.enforcement {
        match nft.read_drop_counters().await {
            Ok(counters) => state
                .metrics
                .record_kernel_drop_counters(counters.dot_853, counters.doh_443),
            Err(e) => tracing::debug!(error = %e, "skipping kernel counter scrape"),
        }
    }

    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable\n").into_response()
        }
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok\n").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting\n").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn state_with_token(token: Option<&str>) -> Arc<AppState> {
        Arc::new(AppState::new(
            Arc::new(ArcSwap::from_pointee(PolicySnapshot::default_deny())),
            Arc::new(MetricsCollector::new("test").unwrap()),
            Enforcement::DnsOnly,
            token.map(String::from),
            Arc::new(AtomicBool::new(true)),
        ))
    }

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTH_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[tokio::test]
    async fn post_without_token_is_rejected_before_parsing() {
        let state = state_with_token(Some("s3cret"));
        let response = post_policy(
            State(state.clone()),
            HeaderMap::new(),
            Bytes::from_static(b"this is not even json"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        // No state change on auth failure.
        assert_eq!(state.active.load().rule_count(), 0);
    }

    #[tokio::test]
    async fn post_with_token_replaces_the_snapshot() {
        let state = state_with_token(Some("s3cret"));
        let body = r#"{"defaultAction":"deny","egress":[{"action":"allow","target":"example.com"}]}"#;
        let response = post_policy(
            State(state.clone()),
            headers_with_auth("s3cret"),
            Bytes::from(body),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.active.load().rule_count(), 1);
        assert_eq!(
            state.active.load().evaluate("example.com"),
            egress_policy::Action::Allow
        );
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let state = state_with_token(Some("s3cret"));
        let response = post_policy(
            State(state.clone()),
            headers_with_auth("wrong"),
            Bytes::from_static(b"{}"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn reset_sentinel_bodies_reset_to_default_deny() {
        let state = state_with_token(None);
        let seed = r#"{"defaultAction":"allow","egress":[{"action":"deny","target":"example.com"}]}"#;
        post_policy(State(state.clone()), HeaderMap::new(), Bytes::from(seed)).await;
        assert_eq!(state.active.load().rule_count(), 1);

        for sentinel in ["", "   \n", "{}", "null"] {
            let response = post_policy(
                State(state.clone()),
                HeaderMap::new(),
                Bytes::from(sentinel.to_string()),
            )
            .await;
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
            let active = state.active.load();
            assert_eq!(active.rule_count(), 0);
            assert_eq!(active.default_action(), egress_policy::Action::Deny);
        }
    }

    #[tokio::test]
    async fn invalid_body_returns_400_and_keeps_state() {
        let state = state_with_token(None);
        let response = post_policy(
            State(state.clone()),
            HeaderMap::new(),
            Bytes::from_static(b"{\"egress\":[{\"action\":\"accept\",\"target\":\"a.b\"}]}"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.active.load().rule_count(), 0);
    }

    #[tokio::test]
    async fn get_policy_round_trips_the_posted_document() {
        let state = state_with_token(None);
        let body = r#"{"defaultAction":"deny","egress":[
            {"action":"allow","target":"*.PyPI.org"},
            {"action":"deny","target":"10.0.0.1/8"}
        ]}"#;
        post_policy(State(state.clone()), HeaderMap::new(), Bytes::from(body)).await;

        let doc = state.active.load().to_document();
        assert_eq!(doc.default_action.as_deref(), Some("deny"));
        let targets: Vec<&str> = doc.egress.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["*.pypi.org", "10.0.0.0/8"]);
    }

    #[tokio::test]
    async fn healthz_reflects_readiness() {
        let state = state_with_token(None);
        let ok = healthz(State(state.clone())).await;
        assert_eq!(ok.status(), StatusCode::OK);

        state.ready.store(false, Ordering::Relaxed);
        let starting = healthz(State(state)).await;
        assert_eq!(starting.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let state = state_with_token(None);
        let response = get_metrics(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("text/plain"));
    }
}
