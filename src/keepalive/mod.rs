pub mod context;
pub mod due;
pub mod executor;
pub mod render;
pub mod tracker;

pub use context::Trigger;
pub use executor::{ExecuteError, Execution, Executor};
