//! Azure File驱动配置

use serde::{Deserialize, Serialize};

/// Azure File配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AzureFileConfig {
    /// 共享名称
    pub share: String,
    /// 为空时使用 https://{account}.file.core.windows.net
    #[serde(default)]
    pub endpoint: String,
    /// 共享内的根目录路径
    #[serde(default)]
    pub root_path: String,
}
