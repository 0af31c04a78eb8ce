//! S3驱动工厂

use serde_json::Value;
use std::sync::Arc;

use crate::credentials::Credential;
use crate::error::{Result, StorageError};
use crate::storage::{DriverDeps, DriverFactory, StorageDriver};
use super::client::BucketClient;
use super::config::S3Config;
use super::driver::S3Driver;

/// S3驱动工厂
pub struct S3DriverFactory;

impl DriverFactory for S3DriverFactory {
    fn driver_type(&self) -> &'static str {
        "s3"
    }

    fn create_driver(
        &self,
        id: &str,
        config: Value,
        credential: Option<Credential>,
        deps: &DriverDeps,
    ) -> Result<Box<dyn StorageDriver>> {
        let config: S3Config = serde_json::from_value(config)
            .map_err(|e| StorageError::Fatal(format!("配置解析失败: {}", e)))?;
        if config.bucket.trim().is_empty() {
            return Err(StorageError::Fatal(format!("driver {}: bucket is required", id)));
        }

        let sessions = deps.require_sessions(id)?;
        let client = BucketClient::new(&config, credential)?;
        Ok(Box::new(S3Driver::new(
            id,
            config,
            Arc::new(client),
            sessions,
            deps.session_ttl,
        )))
    }
}
