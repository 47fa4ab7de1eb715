pub mod discovery_service;
pub mod external;
pub mod ingestion_service;
pub mod reconciliation;
pub mod report_normalizer;
pub mod run_manager;

pub use discovery_service::{scan_observations, DiscoveryOptions, DiscoveryService};
pub use external::ExternalServicesManager;
pub use ingestion_service::IngestionService;
pub use reconciliation::Reconciler;
pub use report_normalizer::normalize;
pub use run_manager::DiscoveryRunManager;
