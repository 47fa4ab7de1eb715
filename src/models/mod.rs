pub mod asset;
pub mod discovery;
pub mod observation;
pub mod scan;

// Re-export commonly used types
pub use asset::*;
pub use discovery::*;
pub use observation::*;
pub use scan::*;
