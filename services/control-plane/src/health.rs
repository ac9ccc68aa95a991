//! Health check endpoints for load balancers and monitoring

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::db;
use crate::observability::HistogramSummary;
use crate::AppState;

/// Liveness: no external dependencies
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Readiness: the database answers
pub async fn readyz(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    match db::ping(&state.db).await {
        Ok(_) => Ok(Json(ReadinessResponse {
            status: "ready".to_string(),
            checks: vec![HealthCheck::new("database", "ok")],
        })),
        Err(e) => {
            tracing::error!("Readiness check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// Component checks plus the in-process metrics snapshot
pub async fn health_detail(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<DetailedHealthResponse>) {
    let mut checks = vec![];

    // Database is the only check that degrades the service
    let db_ok = db::ping(&state.db).await.is_ok();
    checks.push(HealthCheck::new("database", if db_ok { "ok" } else { "error" }));

    // Configuration checks are informational
    checks.push(HealthCheck::new(
        "secrets",
        if state.secrets.is_encryption_active() {
            "encrypted"
        } else {
            "plaintext"
        },
    ));

    checks.push(HealthCheck::new(
        "billing_webhook",
        if state.billing_webhook_secret.is_some() {
            "configured"
        } else {
            "disabled"
        },
    ));

    let providers = state.oauth.configured();
    checks.push(HealthCheck::new(
        "oauth",
        if providers.is_empty() { "disabled" } else { "configured" },
    ));

    // Metrics snapshot
    let snapshot = state.metrics.snapshot().await;

    let response = DetailedHealthResponse {
        status: if db_ok { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks,
        metrics: HealthMetrics {
            uptime_secs: snapshot.uptime_secs,
            counters: snapshot.counters,
            gauges: snapshot.gauges,
            histograms: snapshot.histograms,
        },
    };

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: Vec<HealthCheck>,
}

#[derive(Serialize)]
pub struct DetailedHealthResponse {
    pub status: String,
    pub version: String,
    pub checks: Vec<HealthCheck>,
    pub metrics: HealthMetrics,
}

#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
}

impl HealthCheck {
    fn new(name: &str, status: &str) -> Self {
        Self {
            name: name.to_string(),
            status: status.to_string(),
        }
    }
}

#[derive(Serialize)]
pub struct HealthMetrics {
    pub uptime_secs: u64,
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
}
