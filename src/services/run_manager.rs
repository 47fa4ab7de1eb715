use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{DiscoveryRequest, DiscoveryRunStatus, DiscoveryStatus},
    services::{discovery_service::DiscoveryService, ingestion_service::IngestionService},
};

struct RunEntry {
    run_id: Uuid,
    status: DiscoveryStatus,
    handle: Option<JoinHandle<()>>,
}

/// Background discovery runs, at most one per organization
pub struct DiscoveryRunManager {
    discovery: Arc<DiscoveryService>,
    ingestion: Arc<IngestionService>,
    runs: Arc<Mutex<HashMap<String, RunEntry>>>,
}

impl DiscoveryRunManager {
    pub fn new(discovery: Arc<DiscoveryService>, ingestion: Arc<IngestionService>) -> Self {
        Self {
            discovery,
            ingestion,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a discovery + ingest run for an organization
    pub async fn start(
        &self,
        organization_id: &str,
        request: DiscoveryRequest,
    ) -> Result<DiscoveryStatus, ApiError> {
        if request.root_domain.trim().is_empty() {
            return Err(ApiError::validation("root_domain is required"));
        }

        let mut runs = self.runs.lock().await;
        if runs
            .get(organization_id)
            .is_some_and(|entry| entry.status.is_running())
        {
            return Err(ApiError::validation(format!(
                "discovery is already running for organization {}",
                organization_id
            )));
        }

        let run_id = Uuid::new_v4();
        let status = DiscoveryStatus {
            status: DiscoveryRunStatus::Running,
            root_domain: Some(request.root_domain.clone()),
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let discovery = self.discovery.clone();
        let ingestion = self.ingestion.clone();
        let registry = self.runs.clone();
        let org = organization_id.to_string();

        let handle = tokio::spawn(async move {
            let result = match discovery
                .discover(&org, &request.root_domain, &request.subdomains)
                .await
            {
                Ok(outcome) => {
                    let hosts_probed = outcome.hosts_probed.len();
                    let report = ingestion.ingest(&org, outcome).await;
                    Ok((hosts_probed, report))
                }
                Err(e) => Err(e),
            };

            let mut runs = registry.lock().await;
            let Some(entry) = runs.get_mut(&org).filter(|e| e.run_id == run_id) else {
                return;
            };
            // a stopped run keeps its cancelled status
            if !entry.status.is_running() {
                return;
            }
            entry.status.completed_at = Some(Utc::now());
            entry.handle = None;
            match result {
                Ok((hosts_probed, report)) => {
                    entry.status.status = DiscoveryRunStatus::Completed;
                    entry.status.hosts_probed = hosts_probed;
                    entry.status.errors = report
                        .failed_sources
                        .iter()
                        .map(|f| format!("{} via {}: {}", f.domain, f.source, f.message))
                        .chain(report.store_errors.iter().map(|d| format!("{}: store write failed", d)))
                        .collect();
                    entry.status.report = Some(report);
                    tracing::info!(organization_id = %org, "discovery run completed");
                }
                Err(e) => {
                    tracing::error!(organization_id = %org, error = %e, "discovery run failed");
                    entry.status.status = DiscoveryRunStatus::Failed;
                    entry.status.errors.push(e.to_string());
                }
            }
        });

        runs.insert(
            organization_id.to_string(),
            RunEntry {
                run_id,
                status: status.clone(),
                handle: Some(handle),
            },
        );

        tracing::info!(organization_id, %run_id, "discovery run started");
        Ok(status)
    }

    pub async fn status(&self, organization_id: &str) -> DiscoveryStatus {
        self.runs
            .lock()
            .await
            .get(organization_id)
            .map(|entry| entry.status.clone())
            .unwrap_or_default()
    }

    /// Cancel the running discovery of an organization
    pub async fn stop(&self, organization_id: &str) -> Result<DiscoveryStatus, ApiError> {
        let mut runs = self.runs.lock().await;
        let entry = runs
            .get_mut(organization_id)
            .filter(|entry| entry.status.is_running())
            .ok_or_else(|| ApiError::validation("Discovery is not running"))?;

        if let Some(handle) = entry.handle.take() {
            handle.abort();
        }
        entry.status.status = DiscoveryRunStatus::Cancelled;
        entry.status.completed_at = Some(Utc::now());
        entry.status.errors.push("Discovery stopped by user".to_string());

        tracing::info!(organization_id, "discovery run cancelled");
        Ok(entry.status.clone())
    }

    /// Abort every running discovery; used on shutdown
    pub async fn stop_all(&self) -> usize {
        let mut runs = self.runs.lock().await;
        let mut stopped = 0;
        for entry in runs.values_mut() {
            if let Some(handle) = entry.handle.take() {
                handle.abort();
                entry.status.status = DiscoveryRunStatus::Cancelled;
                entry.status.completed_at = Some(Utc::now());
                stopped += 1;
            }
        }
        stopped
    }
}
