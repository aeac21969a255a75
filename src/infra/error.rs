use thiserror::Error;

use crate::cache::{StoreError, substrate::SubstrateError};
use crate::config::LoadError;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

impl InfraError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}

/// Top-level error of the `strata` binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("unknown cache store `{0}`")]
    UnknownStore(String),
    #[error("cache store `{0}` is not persistent")]
    NotPersistent(String),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl AppError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Load(_) => 2,
            AppError::UnknownStore(_) | AppError::NotPersistent(_) => 3,
            AppError::Infra(_) | AppError::Serialize(_) => 1,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        Self::Infra(InfraError::Io(error))
    }
}
