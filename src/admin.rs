use crate::billing::Ledger;
use crate::callcontrol::CallControl;
use crate::firewall::Firewall;
use anyhow::{anyhow, Result};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Operator/collaborator surface: Prometheus scrape, live call
/// inspection, balance provisioning and firewall maintenance.
#[derive(Clone)]
pub struct AdminState {
    pub call_control: Arc<CallControl>,
    pub ledger: Arc<dyn Ledger>,
    pub firewall: Arc<Firewall>,
    pub metrics: PrometheusHandle,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(healthz))
        .route("/calls/active", get(list_active_calls))
        .route("/users", get(list_users))
        .route("/users/{id}/balance", post(update_balance))
        .route("/users/{id}", delete(delete_user))
        .route("/firewall/blacklist", get(list_blacklist))
        .route("/firewall/blacklist/{ip}", delete(clear_blacklist))
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: AdminState,
    cancel_token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow!("failed to bind admin listener {}: {}", addr, e))?;
    info!("admin API on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel_token.cancelled().await })
        .await?;
    Ok(())
}

async fn render_metrics(State(state): State<AdminState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_active_calls(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.call_control.active_calls())
}

#[derive(Debug, Deserialize)]
struct BalanceUpdate {
    amount: f64,
}

#[derive(Debug, Serialize)]
struct Account {
    uri: String,
    balance: f64,
}

async fn list_users(State(state): State<AdminState>) -> impl IntoResponse {
    let accounts: Vec<Account> = state
        .ledger
        .list_accounts()
        .into_iter()
        .map(|(uri, balance)| Account { uri, balance })
        .collect();
    Json(accounts)
}

async fn update_balance(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<BalanceUpdate>,
) -> StatusCode {
    state
        .ledger
        .set_balance(&format!("sip:{}@localhost", id), body.amount);
    StatusCode::NO_CONTENT
}

async fn delete_user(State(state): State<AdminState>, Path(id): Path<String>) -> StatusCode {
    state.ledger.remove_account(&format!("sip:{}@localhost", id));
    StatusCode::NO_CONTENT
}

async fn list_blacklist(State(state): State<AdminState>) -> impl IntoResponse {
    let ips: Vec<String> = state
        .firewall
        .get_blacklist()
        .into_iter()
        .map(|ip| ip.to_string())
        .collect();
    Json(ips)
}

async fn clear_blacklist(State(state): State<AdminState>, Path(ip): Path<String>) -> StatusCode {
    match ip.parse() {
        Ok(ip) => {
            if state.firewall.clear(&ip) {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::NOT_FOUND
            }
        }
        Err(_) => StatusCode::BAD_REQUEST,
    }
}

async fn stats(State(state): State<AdminState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "active_calls": state.call_control.active_calls().len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::MemoryLedger;
    use crate::callcontrol::CallControlOptions;

    fn state() -> AdminState {
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
        let (call_control, _terminations) = CallControl::new(
            ledger.clone(),
            CallControlOptions {
                rate: 0.01,
                workers: 1,
                queue_depth: 8,
            },
            CancellationToken::new(),
        );
        AdminState {
            call_control,
            ledger,
            firewall: Arc::new(Firewall::new(5)),
            metrics: crate::metrics::install_recorder().unwrap(),
        }
    }

    #[tokio::test]
    async fn balance_updates_normalize_the_subject() {
        let state = state();
        let status = update_balance(
            State(state.clone()),
            Path("100".to_string()),
            Json(BalanceUpdate { amount: 50.0 }),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.ledger.balance_of("sip:100@localhost"), Some(50.0));
    }

    #[tokio::test]
    async fn user_deletion_clears_the_balance() {
        let state = state();
        state.ledger.set_balance("sip:100@localhost", 10.0);
        let status = delete_user(State(state.clone()), Path("100".to_string())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.ledger.balance_of("sip:100@localhost"), None);
    }

    #[tokio::test]
    async fn blacklist_clear_handles_unknown_entries() {
        let state = state();
        let status = clear_blacklist(State(state.clone()), Path("198.51.100.1".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let status = clear_blacklist(State(state), Path("not-an-ip".to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn router_builds() {
        let _router = router(state());
    }
}
