use thiserror::Error;

use crate::config::ConfigError;
use crate::logging::LoggingError;

#[derive(Error, Debug)]
pub enum SystemError {
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] device_lifecycle::LifecycleError),

    #[error("Store error: {0}")]
    Store(#[from] device_store::StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),
}
