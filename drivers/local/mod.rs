//! Local filesystem driver / 本地存储驱动
//!
//! Development and test provider. Object tags and content type are kept in
//! JSON sidecars under `.omnistore-meta/` inside the root.

mod driver;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::credentials::Credential;
use crate::error::{Result, StorageError};
use crate::storage::{DriverDeps, DriverFactory, StorageDriver};

pub use driver::{LocalDriver, META_DIR};

/// 本地存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// 根目录
    pub root: String,
    /// 根目录不存在时自动创建
    #[serde(default = "default_true")]
    pub create_root: bool,
}

fn default_true() -> bool {
    true
}

pub struct LocalDriverFactory;

impl DriverFactory for LocalDriverFactory {
    fn driver_type(&self) -> &'static str {
        "local"
    }

    fn create_driver(
        &self,
        id: &str,
        config: Value,
        _credential: Option<Credential>,
        _deps: &DriverDeps,
    ) -> Result<Box<dyn StorageDriver>> {
        let config: LocalConfig = serde_json::from_value(config)
            .map_err(|e| StorageError::Fatal(format!("配置解析失败: {}", e)))?;
        if config.root.trim().is_empty() {
            return Err(StorageError::Fatal(format!("driver {}: root is required", id)));
        }

        let root = PathBuf::from(&config.root);
        if !root.exists() {
            if config.create_root {
                std::fs::create_dir_all(&root)?;
            } else {
                return Err(StorageError::Fatal(format!("root directory does not exist: {}", config.root)));
            }
        }
        Ok(Box::new(LocalDriver::new(id, root)))
    }
}
