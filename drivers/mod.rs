// Driver package / 驱动包
pub mod azure_rest;
pub mod azure_blob;
pub mod azure_file;
pub mod s3;
pub mod local;

use crate::error::Result;
use crate::storage::StorageManager;

/// Register all drivers to StorageManager / 注册所有驱动
pub async fn register_all(manager: &StorageManager) -> Result<()> {
    // Register Azure Blob driver (append blobs) / 注册Azure Blob驱动
    manager.register_factory(Box::new(azure_blob::AzureBlobDriverFactory)).await?;
    // Register Azure File driver (positional ranges) / 注册Azure文件共享驱动
    manager.register_factory(Box::new(azure_file::AzureFileDriverFactory)).await?;
    // Register S3 driver / 注册S3对象存储驱动
    manager.register_factory(Box::new(s3::S3DriverFactory)).await?;
    // Register local driver / 注册本地驱动
    manager.register_factory(Box::new(local::LocalDriverFactory)).await?;
    Ok(())
}
