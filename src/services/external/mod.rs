pub mod crtsh;
pub mod manager;
pub mod rate_limited_client;
pub mod scanner;
pub mod shodan;
pub mod source;
pub mod virustotal;
pub mod zoomeye;

pub use crtsh::CrtShClient;
pub use manager::ExternalServicesManager;
pub use rate_limited_client::RateLimitedClient;
pub use scanner::NmapScanner;
pub use shodan::ShodanAdapter;
pub use source::{failure_kind, ScanInvoker, SourceAdapter, SubdomainEnumerator};
pub use virustotal::VirusTotalAdapter;
pub use zoomeye::ZoomEyeAdapter;
