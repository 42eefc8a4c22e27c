pub mod loading;
pub mod models;
pub mod schedule;
pub mod store;
pub mod uri;

pub use store::{ConfigError, ConfigSnapshot, ConfigStore, PrinterConfig, PrinterPatch};
