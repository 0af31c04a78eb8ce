use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use serde_json::Value;

use super::session::{SessionCache, DEFAULT_SESSION_TTL};
use super::StorageDriver;
use crate::config::{ProviderConfig, StorageSettings};
use crate::credentials::{Credential, CredentialProvider};
use crate::error::{Result, StorageError};

pub type DriverBox = Arc<dyn StorageDriver>;

/// Shared collaborators handed to every driver at construction / 驱动依赖
#[derive(Clone)]
pub struct DriverDeps {
    pub sessions: Option<Arc<dyn SessionCache>>,
    pub session_ttl: Duration,
    pub delete_visibility_timeout: Duration,
    pub delete_poll_interval: Duration,
}

impl DriverDeps {
    pub fn from_settings(settings: &StorageSettings, sessions: Option<Arc<dyn SessionCache>>) -> Self {
        Self {
            sessions,
            session_ttl: settings.session_ttl(),
            delete_visibility_timeout: settings.delete_visibility_timeout(),
            delete_poll_interval: settings.delete_poll_interval(),
        }
    }

    /// Session cache or a fatal error naming the driver / 获取会话缓存
    pub fn require_sessions(&self, driver_id: &str) -> Result<Arc<dyn SessionCache>> {
        self.sessions.clone().ok_or_else(|| {
            StorageError::NotConfigured(format!("driver {} needs an upload session cache", driver_id))
        })
    }
}

impl Default for DriverDeps {
    fn default() -> Self {
        Self {
            sessions: None,
            session_ttl: DEFAULT_SESSION_TTL,
            delete_visibility_timeout: Duration::from_secs(30),
            delete_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Driver factory trait / 驱动工厂 trait
pub trait DriverFactory: Send + Sync {
    /// Driver type name / 驱动类型名称
    fn driver_type(&self) -> &'static str;

    /// Create a driver instance with its own credential / 创建驱动实例
    fn create_driver(
        &self,
        id: &str,
        config: Value,
        credential: Option<Credential>,
        deps: &DriverDeps,
    ) -> Result<Box<dyn StorageDriver>>;
}

/// Storage manager (driver factories and instances) / 存储管理器
#[derive(Clone)]
pub struct StorageManager {
    factories: Arc<RwLock<HashMap<String, Arc<Box<dyn DriverFactory>>>>>,
    /// Driver error status (id -> error message) / 驱动错误状态
    driver_errors: Arc<RwLock<HashMap<String, String>>>,
}

impl StorageManager {
    pub fn new() -> Self {
        Self {
            factories: Arc::new(RwLock::new(HashMap::new())),
            driver_errors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register driver factory / 注册驱动工厂
    pub async fn register_factory(&self, factory: Box<dyn DriverFactory>) -> Result<()> {
        let driver_type = factory.driver_type().to_string();
        let factory_box = Arc::new(factory);

        let mut factories = self.factories.write().await;
        factories.insert(driver_type.clone(), factory_box);

        tracing::info!("Driver factory registered: {}", driver_type);
        Ok(())
    }

    /// List all available driver types / 列出所有可用的驱动类型
    pub async fn list_driver_types(&self) -> Vec<String> {
        let factories = self.factories.read().await;
        let mut types: Vec<String> = factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Create one driver from its provider entry / 创建驱动实例
    pub async fn create_driver(
        &self,
        provider: &ProviderConfig,
        credentials: &dyn CredentialProvider,
        deps: &DriverDeps,
    ) -> Result<DriverBox> {
        let factories = self.factories.read().await;
        let factory = factories.get(&provider.driver_type).ok_or_else(|| {
            StorageError::NotConfigured(format!("Driver type not found: {}", provider.driver_type))
        })?;

        let credential = match provider.credential {
            Some(ref name) => Some(credentials.credential(name).ok_or_else(|| {
                StorageError::Fatal(format!("credential '{}' for driver {} not found", name, provider.id))
            })?),
            None => None,
        };

        let driver = factory.create_driver(&provider.id, provider.config.clone(), credential, deps)?;
        Ok(Arc::from(driver))
    }

    /// Instantiate every enabled provider; failures are recorded and skipped / 创建所有驱动
    pub async fn build_drivers(
        &self,
        settings: &StorageSettings,
        credentials: &dyn CredentialProvider,
        deps: &DriverDeps,
    ) -> Vec<(ProviderConfig, DriverBox)> {
        let mut drivers = Vec::new();
        for provider in settings.enabled_providers() {
            match self.create_driver(provider, credentials, deps).await {
                Ok(driver) => {
                    self.clear_driver_error(&provider.id).await;
                    tracing::info!("Driver created: {} ({})", provider.id, provider.driver_type);
                    drivers.push((provider.clone(), driver));
                }
                Err(e) => {
                    let error_msg = e.to_string();
                    self.set_driver_error(&provider.id, error_msg.clone()).await;
                    tracing::error!("Driver creation failed: {} ({}) - {}", provider.id, provider.driver_type, error_msg);
                }
            }
        }
        drivers
    }

    /// Verify a driver by listing its root / 验证驱动有效性
    pub async fn verify_driver(&self, driver: &DriverBox) -> bool {
        match driver.list("").await {
            Ok(_) => {
                self.clear_driver_error(driver.id()).await;
                tracing::info!("Driver verified: {}", driver.id());
                true
            }
            Err(e) => {
                let error_msg = e.to_string();
                self.set_driver_error(driver.id(), error_msg.clone()).await;
                tracing::warn!("Driver verification failed: {} - {}", driver.id(), error_msg);
                false
            }
        }
    }

    /// Set driver error status / 设置驱动错误状态
    pub async fn set_driver_error(&self, id: &str, error: String) {
        let mut errors = self.driver_errors.write().await;
        errors.insert(id.to_string(), error);
    }

    /// Clear driver error status / 清除驱动错误状态
    pub async fn clear_driver_error(&self, id: &str) {
        let mut errors = self.driver_errors.write().await;
        errors.remove(id);
    }

    /// Get all driver error statuses / 获取所有驱动错误状态
    pub async fn get_all_driver_errors(&self) -> HashMap<String, String> {
        let errors = self.driver_errors.read().await;
        errors.clone()
    }
}

impl Default for StorageManager {
    fn default() -> Self {
        Self::new()
    }
}
