//! Application configuration module / 应用配置模块
//!
//! Manages configuration loaded from config.json: active storage providers,
//! CDN providers and named credentials.
//! Creates default config file on first run / 首次运行时创建默认配置文件

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::{Credential, StaticCredentials};

/// Application configuration / 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Storage providers and upload tuning / 存储配置
    #[serde(default)]
    pub storage: StorageSettings,
    /// CDN purge providers / CDN配置
    #[serde(default)]
    pub cdn: CdnSettings,
    /// Named credentials referenced by providers / 凭证
    #[serde(default)]
    pub credentials: HashMap<String, Credential>,
}

/// Storage configuration / 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Active providers; writes fan out to all of them / 启用的存储
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Sliding expiration of upload sessions (seconds) / 上传会话过期时间
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Azure delete visibility wait (seconds) / 删除可见性等待
    #[serde(default = "default_delete_timeout")]
    pub delete_visibility_timeout_secs: u64,
    #[serde(default = "default_delete_poll")]
    pub delete_poll_interval_ms: u64,
}

/// One storage provider / 单个存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    /// Driver type: azure_blob, azure_file, s3, local / 驱动类型
    #[serde(rename = "type")]
    pub driver_type: String,
    /// Serves reads and listings / 主存储
    #[serde(default)]
    pub primary: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Name looked up in the credential provider / 凭证名称
    #[serde(default)]
    pub credential: Option<String>,
    /// Driver-specific settings / 驱动特有配置
    #[serde(default)]
    pub config: Value,
}

/// CDN configuration / CDN配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdnSettings {
    #[serde(default)]
    pub providers: Vec<CdnProviderConfig>,
    /// Above this many paths a purge collapses to `/*` / 最大路径数
    #[serde(default = "default_max_purge_paths")]
    pub max_paths: usize,
}

/// One CDN provider / 单个CDN配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdnProviderConfig {
    pub id: String,
    /// Provider type: front_door, cloudflare / 类型
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default)]
    pub config: Value,
}

fn default_true() -> bool {
    true
}

fn default_session_ttl() -> u64 {
    15 * 60
}

fn default_delete_timeout() -> u64 {
    30
}

fn default_delete_poll() -> u64 {
    500
}

fn default_max_purge_paths() -> usize {
    100
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            session_ttl_secs: default_session_ttl(),
            delete_visibility_timeout_secs: default_delete_timeout(),
            delete_poll_interval_ms: default_delete_poll(),
        }
    }
}

impl Default for CdnSettings {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            max_paths: default_max_purge_paths(),
        }
    }
}

impl StorageSettings {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn delete_visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_visibility_timeout_secs)
    }

    pub fn delete_poll_interval(&self) -> Duration {
        Duration::from_millis(self.delete_poll_interval_ms.max(1))
    }

    /// Enabled providers in configuration order / 已启用的存储
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

impl AppConfig {
    /// Credentials declared inline / 配置文件中的凭证
    pub fn static_credentials(&self) -> StaticCredentials {
        StaticCredentials::new(self.credentials.clone())
    }

    /// Check ids are unique and at most one primary is flagged / 校验配置
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for provider in self.storage.enabled_providers() {
            if provider.id.trim().is_empty() {
                return Err("Storage provider with empty id".to_string());
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(format!("Duplicate storage provider id: {}", provider.id));
            }
        }
        let primaries = self.storage.enabled_providers().filter(|p| p.primary).count();
        if primaries > 1 {
            return Err(format!("{} storage providers flagged primary, expected at most one", primaries));
        }
        Ok(())
    }
}

/// Get the config file path / 获取配置文件路径
pub fn get_config_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("config.json")
}

/// Load configuration from a file, or create default if not exists / 加载配置文件，不存在则创建默认配置
pub fn load_config_from(config_path: &Path) -> Result<AppConfig, String> {
    if config_path.exists() {
        // Load existing config / 加载现有配置
        let content = std::fs::read_to_string(config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config file: {}", e))?;
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", config_path);
        Ok(config)
    } else {
        // Create default config / 创建默认配置
        let config = AppConfig::default();
        save_config_to(&config, config_path)?;
        tracing::info!("Created default configuration at {:?}", config_path);
        Ok(config)
    }
}

/// Save configuration to file / 保存配置到文件
pub fn save_config_to(config: &AppConfig, config_path: &Path) -> Result<(), String> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    std::fs::write(config_path, content)
        .map_err(|e| format!("Failed to write config file: {}", e))?;

    Ok(())
}
