//! Guardian-Log core: domain model, error taxonomy and configuration shared
//! by every other crate in the workspace.

pub mod config;
pub mod error;
pub mod logging;
pub mod model;

pub use config::GuardianConfig;
pub use error::{GuardianError, GuardianResult};
pub use model::*;
