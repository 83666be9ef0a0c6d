pub mod config;
pub mod error;
pub mod event;
pub mod telemetry;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{Result, StrataError};
pub use event::{EngineEvent, EventBus};
pub use telemetry::TelemetryShim;
pub use types::*;
