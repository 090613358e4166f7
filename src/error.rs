use thiserror::Error;

use crate::repository::RepositoryError;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Publishing system not found: {0}")]
    SystemNotFound(String),

    #[error("Subset {subset:?} not defined for system {system:?}")]
    SubsetNotFound { system: String, subset: String },

    #[error("Invalid job parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write failed for {path} after retry: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Gateway transport error: {0}")]
    GatewayTransport(#[from] reqwest::Error),

    #[error("Gateway: {kind} ({message})")]
    GatewayRejected { kind: String, message: String },

    #[error("Gateway last job ID mismatch: gateway has {gateway:?}, expected {local:?}")]
    LastJobMismatch {
        gateway: Option<i64>,
        local: Option<i64>,
    },

    #[error("Worker {worker} aborted the job: {reason}")]
    WorkerAborted { worker: usize, reason: String },

    #[error("{0}")]
    ThresholdExceeded(String),

    #[error("Job cancelled by operator")]
    Cancelled,

    #[error("Unexpected job status {0}")]
    UnexpectedStatus(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PublishError {
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PublishError>;
