use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::Json,
};
use chrono::Utc;
use serde::Deserialize;

use crate::{
    error::ApiError,
    models::{DiscoveryRequest, DiscoveryStatus, IngestReport},
    services::{normalize, scan_observations},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct ScanReportQuery {
    pub domain: String,
}

pub async fn start_discovery(
    State(app_state): State<AppState>,
    Path(org_id): Path<String>,
    Json(payload): Json<DiscoveryRequest>,
) -> Result<Json<DiscoveryStatus>, ApiError> {
    let status = app_state.run_manager.start(&org_id, payload).await?;
    Ok(Json(status))
}

pub async fn discovery_status(
    State(app_state): State<AppState>,
    Path(org_id): Path<String>,
) -> Json<DiscoveryStatus> {
    Json(app_state.run_manager.status(&org_id).await)
}

pub async fn stop_discovery(
    State(app_state): State<AppState>,
    Path(org_id): Path<String>,
) -> Result<Json<DiscoveryStatus>, ApiError> {
    let status = app_state.run_manager.stop(&org_id).await?;
    Ok(Json(status))
}

/// Ingest an uploaded nmap XML report as `nmap` observations of `domain`
pub async fn upload_scan_report(
    State(app_state): State<AppState>,
    Path(org_id): Path<String>,
    Query(query): Query<ScanReportQuery>,
    body: Bytes,
) -> Result<Json<IngestReport>, ApiError> {
    let domain = query.domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return Err(ApiError::validation("domain is required"));
    }
    if body.is_empty() {
        return Err(ApiError::validation("scan report body is empty"));
    }

    let observed_at = Utc::now();
    let hosts = normalize(&body)?;
    tracing::info!(
        organization_id = %org_id,
        domain = %domain,
        hosts = hosts.len(),
        "scan report normalized"
    );

    let observations = scan_observations(&org_id, &domain, &domain, hosts, observed_at);
    let report = app_state
        .ingestion
        .ingest_observations(&org_id, observations)
        .await;
    Ok(Json(report))
}
