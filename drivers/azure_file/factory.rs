//! Azure File驱动工厂

use serde_json::Value;
use std::sync::Arc;

use crate::credentials::Credential;
use crate::drivers::azure_rest::AzureRestClient;
use crate::error::{Result, StorageError};
use crate::storage::{DriverDeps, DriverFactory, StorageDriver};
use super::config::AzureFileConfig;
use super::driver::AzureFileDriver;

/// Azure File驱动工厂
pub struct AzureFileDriverFactory;

impl DriverFactory for AzureFileDriverFactory {
    fn driver_type(&self) -> &'static str {
        "azure_file"
    }

    fn create_driver(
        &self,
        id: &str,
        config: Value,
        credential: Option<Credential>,
        deps: &DriverDeps,
    ) -> Result<Box<dyn StorageDriver>> {
        let config: AzureFileConfig = serde_json::from_value(config)
            .map_err(|e| StorageError::Fatal(format!("配置解析失败: {}", e)))?;
        if config.share.trim().is_empty() {
            return Err(StorageError::Fatal(format!("driver {}: share is required", id)));
        }

        let sessions = deps.require_sessions(id)?;
        let client = Arc::new(AzureRestClient::new(credential, "file", Some(&config.endpoint))?);
        Ok(Box::new(AzureFileDriver::new(
            id,
            config,
            client,
            sessions,
            deps.session_ttl,
            deps.delete_visibility_timeout,
            deps.delete_poll_interval,
        )))
    }
}
