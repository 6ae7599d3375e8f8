use tdei_db::DbError;
use thiserror::Error;

pub type Result<T, E = JobError> = std::result::Result<T, E>;

/// Failures of one backend job, classified by pipeline stage.
#[derive(Debug, Error)]
pub enum JobError {
    /// Caller-supplied parameters were rejected before reaching the database.
    #[error("{0}")]
    InvalidInput(String),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("streaming error: {0}")]
    Streaming(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("archive error: {0}")]
    Archive(String),
}

impl JobError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Text safe to put in the outbound result message.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidInput(message) => message.clone(),
            Self::Database(_) => "Error executing query".to_string(),
            Self::Streaming(_) | Self::Storage(_) => "Error streaming data".to_string(),
            Self::Archive(_) => "Error zipping data".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
    #[error("invalid storage url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("upload of {path} did not complete: {reason}")]
    Upload { path: String, reason: String },
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },
}

#[derive(Debug, Error)]
#[error("publishing to {topic} failed: {reason}")]
pub struct PublishError {
    pub topic: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("storage setup failed: {0}")]
    Storage(#[from] StorageError),
}
