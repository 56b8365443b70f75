pub mod actor;
pub mod apps;
pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod organizations;
pub mod placement;
pub mod quota;
pub mod service_instances;
pub mod telemetry;

pub use actor::Actor;
pub use error::{CoreError, CoreResult, Denial, DenialReason, DenialTarget, ValidationError};
