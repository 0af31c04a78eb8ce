//! Error taxonomy / 错误分类
//!
//! Read paths turn `NotFound` into `None`/`false`; every other variant
//! propagates to the caller after the driver cleaned up its partial state.

use thiserror::Error;

/// Result alias used across drivers and the storage context / 统一结果类型
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Object or folder absent / 对象不存在
    #[error("not found: {0}")]
    NotFound(String),

    /// Destination already exists (raised before any mutation) / 目标已存在
    #[error("conflict: {0}")]
    Conflict(String),

    /// Visibility race or brief network failure / 临时错误
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Malformed multipart state, bad credentials, misconfiguration / 致命错误
    #[error("provider failure: {0}")]
    Fatal(String),

    /// Chunk metadata violates ordering or bounds / 分片元数据非法
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("storage is not configured: {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    /// Classify an HTTP status returned by a provider / 按HTTP状态码分类
    pub fn from_status(status: u16, context: impl Into<String>) -> Self {
        let context = context.into();
        match status {
            404 => StorageError::NotFound(context),
            409 | 412 => StorageError::Conflict(context),
            408 | 429 | 500..=599 => {
                StorageError::Transient(format!("HTTP {}: {}", status, context))
            }
            _ => StorageError::Fatal(format!("HTTP {}: {}", status, context)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return StorageError::Transient(err.to_string());
        }
        match err.status() {
            Some(status) => StorageError::from_status(status.as_u16(), err.to_string()),
            None => StorageError::Fatal(err.to_string()),
        }
    }
}

impl From<s3::error::S3Error> for StorageError {
    fn from(err: s3::error::S3Error) -> Self {
        match err {
            s3::error::S3Error::HttpFailWithBody(status, body) => {
                StorageError::from_status(status, body)
            }
            other => StorageError::Fatal(other.to_string()),
        }
    }
}

impl From<quick_xml::DeError> for StorageError {
    fn from(err: quick_xml::DeError) -> Self {
        StorageError::Fatal(format!("malformed provider response: {}", err))
    }
}
