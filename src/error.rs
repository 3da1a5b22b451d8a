//! Error taxonomy for the pipeline.
//!
//! None of these reach UI callers: public entry points log them and degrade.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("{adapter} failed to initialize: {reason}")]
    Init { adapter: String, reason: String },

    #[error("{adapter} failed to dispatch: {reason}")]
    Dispatch { adapter: String, reason: String },

    #[error("{adapter} panicked during {stage}")]
    Panicked { adapter: String, stage: String },
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Network(String),

    #[error("ingestion endpoint returned status {0}")]
    Status(u16),

    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => DeliveryError::Status(status.as_u16()),
            None => DeliveryError::Network(err.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("experiment {experiment_id} disabled: {reason}")]
    ConfigValidation { experiment_id: String, reason: String },

    #[error("malformed input: {0}")]
    MalformedInput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_failing_part() {
        let err = AdapterError::Init {
            adapter: "pixel".to_string(),
            reason: "script blocked".to_string(),
        };
        assert_eq!(err.to_string(), "pixel failed to initialize: script blocked");
        assert_eq!(
            DeliveryError::Status(503).to_string(),
            "ingestion endpoint returned status 503"
        );
    }

    #[test]
    fn test_pipeline_error_wraps_transparently() {
        let err: PipelineError = StorageError::Unavailable("quota".to_string()).into();
        assert_eq!(err.to_string(), "storage unavailable: quota");
    }
}
