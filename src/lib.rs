use axum::{
    middleware::from_fn,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use crate::{
    config::Settings,
    database::DatabasePool,
    error::ApiError,
    repositories::{AssetRepository, SqlxAssetRepository},
    services::{
        DiscoveryRunManager, DiscoveryService, ExternalServicesManager, IngestionService,
        Reconciler,
    },
};

pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod services;

/// Shared application state containing all dependencies
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    /// Present only when the SQL store backs the repository
    pub db_pool: Option<DatabasePool>,
    pub asset_repo: Arc<dyn AssetRepository>,
    pub ingestion: Arc<IngestionService>,
    pub run_manager: Arc<DiscoveryRunManager>,
}

impl AppState {
    /// Build the production state: Postgres store and configured sources
    pub async fn new(config: Settings) -> Result<Self, ApiError> {
        let db_pool = database::create_connection_pool(&config.database_url).await?;
        let asset_repo: Arc<dyn AssetRepository> = Arc::new(SqlxAssetRepository::new(
            db_pool.clone(),
            config.store_max_retries,
        ));

        let external_services = Arc::new(ExternalServicesManager::new(&config)?);
        let discovery = DiscoveryService::from_manager(external_services, &config);

        let mut state = Self::with_components(config, asset_repo, discovery)?;
        state.db_pool = Some(db_pool);
        Ok(state)
    }

    /// Wire state from prebuilt parts; the store and sources are up to the caller
    pub fn with_components(
        config: Settings,
        asset_repo: Arc<dyn AssetRepository>,
        discovery: DiscoveryService,
    ) -> Result<Self, ApiError> {
        let priority = config
            .parsed_source_priority()
            .map_err(|e| ApiError::Configuration(e.to_string()))?;
        let ingestion = Arc::new(IngestionService::new(
            asset_repo.clone(),
            Reconciler::new(priority),
        ));
        let run_manager = Arc::new(DiscoveryRunManager::new(
            Arc::new(discovery),
            ingestion.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            db_pool: None,
            asset_repo,
            ingestion,
            run_manager,
        })
    }
}

/// All routes with the logging layers applied
pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health_check))
        .route("/api/health/simple", get(handlers::health_check_simple))
        .route(
            "/api/organizations/:org_id/assets",
            get(handlers::asset_handlers::list_assets)
                .delete(handlers::asset_handlers::delete_assets),
        )
        .route(
            "/api/organizations/:org_id/assets/:id",
            put(handlers::asset_handlers::update_asset),
        )
        .route(
            "/api/organizations/:org_id/discovery",
            post(handlers::discovery_handlers::start_discovery)
                .get(handlers::discovery_handlers::discovery_status),
        )
        .route(
            "/api/organizations/:org_id/discovery/stop",
            post(handlers::discovery_handlers::stop_discovery),
        )
        .route(
            "/api/organizations/:org_id/scan-reports",
            post(handlers::discovery_handlers::upload_scan_report),
        )
        .with_state(app_state)
        .layer(from_fn(middleware::request_logging_middleware))
        .layer(middleware::create_logging_layer())
}
