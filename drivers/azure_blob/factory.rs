//! Azure Blob驱动工厂

use serde_json::Value;
use std::sync::Arc;

use crate::credentials::Credential;
use crate::drivers::azure_rest::AzureRestClient;
use crate::error::{Result, StorageError};
use crate::storage::{DriverDeps, DriverFactory, StorageDriver};
use super::config::AzureBlobConfig;
use super::driver::AzureBlobDriver;

/// Azure Blob驱动工厂
pub struct AzureBlobDriverFactory;

impl DriverFactory for AzureBlobDriverFactory {
    fn driver_type(&self) -> &'static str {
        "azure_blob"
    }

    fn create_driver(
        &self,
        id: &str,
        config: Value,
        credential: Option<Credential>,
        deps: &DriverDeps,
    ) -> Result<Box<dyn StorageDriver>> {
        let config: AzureBlobConfig = serde_json::from_value(config)
            .map_err(|e| StorageError::Fatal(format!("配置解析失败: {}", e)))?;
        if config.container.trim().is_empty() {
            return Err(StorageError::Fatal(format!("driver {}: container is required", id)));
        }

        let client = Arc::new(AzureRestClient::new(credential, "blob", Some(&config.endpoint))?);
        Ok(Box::new(AzureBlobDriver::new(
            id,
            config,
            client,
            deps.delete_visibility_timeout,
            deps.delete_poll_interval,
        )))
    }
}
