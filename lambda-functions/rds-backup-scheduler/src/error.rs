//! Error types for configuration, AWS calls and the run itself.
//!
//! Only [`RunError`] aborts a run. Everything else is recovered per resource
//! or per resource kind and ends up in the run summary.

use aws_sdk_backup::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

use crate::ResourceKind;

/// Invalid or missing configuration. Fatal at startup.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("{name} must be a positive integer, got '{value}'")]
    NotPositiveInteger { name: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// A failed AWS API call, normalized across services.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiError {
    /// The service answered with a structured error
    #[error("[{}] {message}", .code.as_deref().unwrap_or("Unknown"))]
    Service {
        code: Option<String>,
        message: String,
    },

    /// The request never got a service answer (network, timeout, dispatch)
    #[error("{message}")]
    Transport { message: String },

    /// The service answered but a required field was missing
    #[error("response is missing field {0}")]
    MalformedResponse(&'static str),
}

impl ApiError {
    /// Normalize an SDK error from any AWS service client.
    pub fn from_sdk<E, R>(err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        match &err {
            SdkError::ServiceError(_) => ApiError::Service {
                code: err.code().map(str::to_string),
                message: err
                    .message()
                    .map(str::to_string)
                    .unwrap_or_else(|| DisplayErrorContext(&err).to_string()),
            },
            _ => ApiError::Transport {
                message: DisplayErrorContext(&err).to_string(),
            },
        }
    }

    /// Error code reported by the service, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Service { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Message without the code prefix
    pub fn message(&self) -> String {
        match self {
            ApiError::Service { message, .. } | ApiError::Transport { message } => message.clone(),
            ApiError::MalformedResponse(_) => self.to_string(),
        }
    }
}

/// Listing a whole resource kind failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("listing {kind} resources failed: {source}")]
    Listing {
        kind: ResourceKind,
        #[source]
        source: ApiError,
    },
}

impl DiscoveryError {
    pub fn kind(&self) -> ResourceKind {
        match self {
            DiscoveryError::Listing { kind, .. } => *kind,
        }
    }
}

/// Faults that abort the whole run and surface as a 500.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to encode run summary: {0}")]
    Encode(#[from] serde_json::Error),
}
