//! Azure Blob驱动配置

use serde::{Deserialize, Serialize};

/// Azure Blob配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureBlobConfig {
    /// 容器名称
    pub container: String,
    /// Service endpoint override, e.g. Azurite `http://127.0.0.1:10000/devstoreaccount1`
    /// 为空时使用 https://{account}.blob.core.windows.net
    #[serde(default)]
    pub endpoint: String,
    /// 容器内的根目录路径
    #[serde(default)]
    pub root_path: String,
}

impl Default for AzureBlobConfig {
    fn default() -> Self {
        Self {
            container: String::new(),
            endpoint: String::new(),
            root_path: String::new(),
        }
    }
}
