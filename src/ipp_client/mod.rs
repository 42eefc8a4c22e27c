pub mod client;
pub mod models;

pub use client::{IppDevice, JobSubmitter, SubmitError, TelemetryError, TelemetryErrorKind, TelemetrySource};
pub use models::{DeviceState, TelemetrySnapshot};
