pub mod health;
pub mod persistence;
pub mod store;

pub use health::{HealthReport, PrinterHealth};
pub use store::{AttemptResult, KeepaliveStatus, StateChange, StateStore};
