pub mod merge;
pub mod models;
pub mod scanner;

pub use merge::{DiscoveryCache, DiscoverySummary};
pub use models::{DiscoveredPrinter, Protocol};
pub use scanner::{DiscoveryError, DiscoveryScanner, IppProbeScanner};
