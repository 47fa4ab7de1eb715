use axum::{extract::State, response::Json};
use serde_json::{json, Value};
use std::time::Instant;

use crate::{database, error::ApiError, AppState};

/// Health check including store connectivity when a database is configured
pub async fn health_check(State(app_state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let store = match &app_state.db_pool {
        Some(pool) => {
            let started = Instant::now();
            match database::health_check(pool).await {
                Ok(()) => json!({
                    "healthy": true,
                    "backend": "postgres",
                    "response_time_ms": started.elapsed().as_millis() as u64,
                }),
                Err(e) => {
                    tracing::error!(error = %e, "database health check failed");
                    return Err(ApiError::internal("Service is unhealthy"));
                }
            }
        }
        None => json!({ "healthy": true, "backend": "memory" }),
    };

    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "service": "asset-recon",
        "checks": { "store": store },
    })))
}

/// Plain liveness probe
pub async fn health_check_simple() -> &'static str {
    "OK"
}
