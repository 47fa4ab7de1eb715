use axum::{
    extract::{Path, State},
    response::Json,
};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{Asset, AssetDeleteRequest, AssetUpdate},
    AppState,
};

#[derive(Debug, Serialize)]
pub struct AssetListResponse {
    pub assets: Vec<Asset>,
    pub total_count: usize,
}

#[derive(Debug, Serialize)]
pub struct AssetDeleteResponse {
    pub deleted: u64,
}

pub async fn list_assets(
    State(app_state): State<AppState>,
    Path(org_id): Path<String>,
) -> Result<Json<AssetListResponse>, ApiError> {
    let assets = app_state.asset_repo.list_by_organization(&org_id).await?;
    Ok(Json(AssetListResponse {
        total_count: assets.len(),
        assets,
    }))
}

pub async fn delete_assets(
    State(app_state): State<AppState>,
    Path(org_id): Path<String>,
    Json(payload): Json<AssetDeleteRequest>,
) -> Result<Json<AssetDeleteResponse>, ApiError> {
    if payload.ids.is_empty() {
        return Err(ApiError::validation("ids must not be empty"));
    }
    let deleted = app_state.asset_repo.delete_many(&org_id, &payload.ids).await?;
    tracing::info!(organization_id = %org_id, requested = payload.ids.len(), deleted, "assets deleted");
    Ok(Json(AssetDeleteResponse { deleted }))
}

/// Manual edit of domain, type, ip or ports. Edits are recorded under the
/// `manual` source at the time of the request.
pub async fn update_asset(
    State(app_state): State<AppState>,
    Path((org_id, id)): Path<(String, Uuid)>,
    Json(payload): Json<AssetUpdate>,
) -> Result<Json<Asset>, ApiError> {
    if payload.is_empty() {
        return Err(ApiError::validation("update must change at least one field"));
    }
    if payload
        .domain
        .as_deref()
        .is_some_and(|d| d.trim().trim_end_matches('.').is_empty())
    {
        return Err(ApiError::validation("domain must not be empty"));
    }

    let reconciler = app_state.ingestion.reconciler();
    let edited_at = Utc::now();
    let edit = |asset: Asset| reconciler.apply_manual_update(asset, &payload, edited_at);

    let asset = app_state
        .asset_repo
        .update_by_id(&org_id, &id, &edit)
        .await?;
    tracing::info!(organization_id = %org_id, asset_id = %id, domain = %asset.domain, "asset updated");
    Ok(Json(asset))
}
