//! Error types for Uplink

use thiserror::Error;

/// Main error type for the Uplink core
#[derive(Error, Debug)]
pub enum UplinkError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Object store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<::config::ConfigError> for UplinkError {
    fn from(e: ::config::ConfigError) -> Self {
        UplinkError::Config(e.to_string())
    }
}

impl From<notify::Error> for UplinkError {
    fn from(e: notify::Error) -> Self {
        UplinkError::Watch(e.to_string())
    }
}

impl From<zip::result::ZipError> for UplinkError {
    fn from(e: zip::result::ZipError) -> Self {
        UplinkError::Archive(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, UplinkError>;
