use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::{
    models::{DiscoveryOutcome, HostObservation, IngestReport},
    repositories::AssetRepository,
    services::reconciliation::Reconciler,
};

/// Folds observations into the asset store, one atomic upsert per host.
pub struct IngestionService {
    asset_repo: Arc<dyn AssetRepository>,
    reconciler: Reconciler,
}

impl IngestionService {
    pub fn new(asset_repo: Arc<dyn AssetRepository>, reconciler: Reconciler) -> Self {
        Self {
            asset_repo,
            reconciler,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Ingest the result of one discovery cycle. Never fails: store errors
    /// are counted per host in the report.
    pub async fn ingest(&self, organization_id: &str, outcome: DiscoveryOutcome) -> IngestReport {
        let failed_hosts: HashSet<&str> = outcome
            .failures
            .iter()
            .map(|f| f.domain.as_str())
            .collect();
        let degraded_hosts = outcome
            .observations
            .iter()
            .map(|o| o.domain.as_str())
            .filter(|domain| failed_hosts.contains(domain))
            .collect::<HashSet<_>>()
            .len();

        let mut report = self
            .ingest_observations(organization_id, outcome.observations)
            .await;
        report.degraded_hosts = degraded_hosts;
        report.failed_sources = outcome.failures;

        if report.is_total_failure() {
            tracing::warn!(
                organization_id,
                failed_sources = report.failed_sources.len(),
                "discovery cycle produced no asset changes"
            );
        }
        report
    }

    /// Group observations by host and fold each group into its asset.
    /// Different hosts are written concurrently.
    pub async fn ingest_observations(
        &self,
        organization_id: &str,
        observations: Vec<HostObservation>,
    ) -> IngestReport {
        let mut groups: BTreeMap<String, Vec<HostObservation>> = BTreeMap::new();
        for observation in observations {
            if observation.organization_id != organization_id {
                tracing::warn!(
                    organization_id,
                    observation_organization = %observation.organization_id,
                    domain = %observation.domain,
                    "dropping observation for another organization"
                );
                continue;
            }
            groups
                .entry(observation.domain.clone())
                .or_default()
                .push(observation);
        }

        let writes = groups
            .into_iter()
            .map(|(domain, group)| async move {
                let result = self.write_group(organization_id, &domain, &group).await;
                (domain, result)
            });

        let mut report = IngestReport::default();
        for (domain, result) in join_all(writes).await {
            match result {
                Ok(true) => report.hosts_created += 1,
                Ok(false) => report.hosts_updated += 1,
                Err(e) => {
                    tracing::error!(
                        organization_id,
                        domain = %domain,
                        error = %e,
                        "failed to write asset"
                    );
                    report.store_errors.push(domain);
                }
            }
        }

        tracing::info!(
            organization_id,
            created = report.hosts_created,
            updated = report.hosts_updated,
            store_errors = report.store_errors.len(),
            "ingest finished"
        );
        report
    }

    /// Returns whether the asset was created.
    async fn write_group(
        &self,
        organization_id: &str,
        domain: &str,
        group: &[HostObservation],
    ) -> Result<bool, crate::error::ApiError> {
        let Some((first, rest)) = group.split_first() else {
            return Ok(false);
        };
        let reconciler = &self.reconciler;
        let merge = |existing| {
            rest.iter().fold(reconciler.reconcile(existing, first), |asset, obs| {
                reconciler.reconcile(Some(asset), obs)
            })
        };

        let outcome = self
            .asset_repo
            .upsert(organization_id, domain, &merge)
            .await?;
        tracing::debug!(
            organization_id,
            domain,
            created = outcome.created,
            observations = group.len(),
            "asset reconciled"
        );
        Ok(outcome.created)
    }
}
