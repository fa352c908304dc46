use crate::accrual::Rejection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Poll timed out after {0} ms")]
    Timeout(u64),
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("Sink write error: {0}")]
    SinkWrite(String),
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("DB error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Transient failures are worth another attempt within the same poll cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Transport(_) | AppError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
