//! CDN cache invalidation / CDN缓存刷新
//!
//! Paths are normalized once, then every configured provider is asked to
//! purge them concurrently. A provider failure is reported in its
//! [`PurgeResult`] and never blocks the others.

pub mod cloudflare;
pub mod front_door;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{CdnProviderConfig, CdnSettings};
use crate::credentials::{Credential, CredentialProvider};
use crate::storage::TouchedPaths;

pub use cloudflare::{CloudflareConfig, CloudflareProvider};
pub use front_door::{FrontDoorConfig, FrontDoorProvider};

/// Purge everything / 全部刷新
pub const PURGE_ALL: &str = "/*";

/// Default path count above which a purge collapses to [`PURGE_ALL`] / 默认最大路径数
pub const DEFAULT_MAX_PATHS: usize = 100;

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Token acquisition failed / 获取令牌失败
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Provider answered with a non-success status / 服务端拒绝
    #[error("HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid CDN configuration: {0}")]
    Config(String),
}

/// Outcome of one provider's purge / 刷新结果
#[derive(Debug, Clone, Serialize)]
pub struct PurgeResult {
    pub provider: String,
    pub status: u16,
    pub reason_phrase: String,
    pub is_success: bool,
    pub client_request_id: Option<String>,
    pub estimated_flush_time: Option<String>,
    pub message: String,
}

impl PurgeResult {
    /// Failed result for a provider error / 失败结果
    pub fn failed(provider: &str, err: &PurgeError) -> Self {
        let status = match err {
            PurgeError::Rejected { status, .. } => *status,
            PurgeError::Http(e) => e.status().map(|s| s.as_u16()).unwrap_or(0),
            _ => 0,
        };
        Self {
            provider: provider.to_string(),
            status,
            reason_phrase: reason_phrase(status),
            is_success: false,
            client_request_id: None,
            estimated_flush_time: None,
            message: err.to_string(),
        }
    }
}

/// Canonical reason phrase for a status, empty when unknown / 状态描述
pub fn reason_phrase(status: u16) -> String {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
        .to_string()
}

/// One CDN provider / CDN提供者
#[async_trait]
pub trait CdnProvider: Send + Sync {
    fn id(&self) -> &str;

    fn provider_type(&self) -> &'static str;

    /// Purge already-normalized paths / 刷新规范化后的路径
    async fn purge(&self, paths: &[String]) -> Result<PurgeResult, PurgeError>;
}

/// Normalize purge paths / 规范化刷新路径
///
/// `root` becomes `/` (the site home), everything else gets exactly one
/// leading slash and no trailing one. A literal `/` or `/*` in the input, or
/// more than `max_paths` input paths (counted before duplicates are dropped),
/// collapse to a single `/*`.
pub fn normalize_paths<S: AsRef<str>>(paths: &[S], max_paths: usize) -> Vec<String> {
    if paths.len() > max_paths {
        return vec![PURGE_ALL.to_string()];
    }

    let mut normalized: Vec<String> = Vec::new();
    for path in paths {
        let raw = path.as_ref().trim();
        if raw == "/" || raw == PURGE_ALL {
            return vec![PURGE_ALL.to_string()];
        }
        let trimmed = raw.trim_matches('/');
        let path = if trimmed.eq_ignore_ascii_case("root") || trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", trimmed)
        };
        if !normalized.contains(&path) {
            normalized.push(path);
        }
    }
    normalized
}

/// Purge coordinator over every configured provider / CDN刷新服务
pub struct PurgeService {
    providers: Vec<Arc<dyn CdnProvider>>,
    max_paths: usize,
}

impl PurgeService {
    pub fn new(providers: Vec<Arc<dyn CdnProvider>>, max_paths: usize) -> Self {
        Self {
            providers,
            max_paths,
        }
    }

    /// Build enabled providers from configuration / 从配置创建
    pub fn from_config(settings: &CdnSettings, credentials: &dyn CredentialProvider) -> Result<Self, PurgeError> {
        let mut providers: Vec<Arc<dyn CdnProvider>> = Vec::new();
        for provider in settings.providers.iter().filter(|p| p.enabled) {
            providers.push(create_provider(provider, credentials)?);
            tracing::info!("CDN provider created: {} ({})", provider.id, provider.provider_type);
        }
        Ok(Self::new(providers, settings.max_paths))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Purge `paths` on every provider / 刷新所有CDN
    ///
    /// Empty input performs no provider call and returns no results.
    pub async fn purge<S: AsRef<str>>(&self, paths: &[S]) -> Vec<PurgeResult> {
        if paths.is_empty() {
            return Vec::new();
        }
        let normalized = normalize_paths(paths, self.max_paths);
        tracing::info!("CDN purge: {:?}", normalized);

        let normalized = &normalized;
        join_all(self.providers.iter().map(|provider| async move {
            match provider.purge(normalized).await {
                Ok(result) => {
                    tracing::debug!(
                        "CDN purge accepted by {}: {} {}",
                        provider.id(),
                        result.status,
                        result.message
                    );
                    result
                }
                Err(e) => {
                    tracing::error!("CDN purge failed on {}: {}", provider.id(), e);
                    PurgeResult::failed(provider.id(), &e)
                }
            }
        }))
        .await
    }

    /// Purge what a copy or rename changed / 刷新复制或重命名涉及的路径
    pub async fn purge_touched(&self, touched: &TouchedPaths) -> Vec<PurgeResult> {
        self.purge(&touched.purge_paths()).await
    }
}

fn create_provider(
    provider: &CdnProviderConfig,
    credentials: &dyn CredentialProvider,
) -> Result<Arc<dyn CdnProvider>, PurgeError> {
    let credential: Option<Credential> = match provider.credential {
        Some(ref name) => Some(credentials.credential(name).ok_or_else(|| {
            PurgeError::Config(format!("credential '{}' for CDN {} not found", name, provider.id))
        })?),
        None => None,
    };

    match provider.provider_type.as_str() {
        "front_door" => {
            let config: FrontDoorConfig = serde_json::from_value(provider.config.clone())
                .map_err(|e| PurgeError::Config(format!("{}: {}", provider.id, e)))?;
            Ok(Arc::new(FrontDoorProvider::new(&provider.id, config, credential)?))
        }
        "cloudflare" => {
            let config: CloudflareConfig = serde_json::from_value(provider.config.clone())
                .map_err(|e| PurgeError::Config(format!("{}: {}", provider.id, e)))?;
            Ok(Arc::new(CloudflareProvider::new(&provider.id, config, credential)?))
        }
        other => Err(PurgeError::Config(format!("unknown CDN provider type: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingProvider {
        id: String,
        fail: bool,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingProvider {
        fn new(id: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CdnProvider for RecordingProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn provider_type(&self) -> &'static str {
            "recording"
        }

        async fn purge(&self, paths: &[String]) -> Result<PurgeResult, PurgeError> {
            self.calls.lock().push(paths.to_vec());
            if self.fail {
                return Err(PurgeError::Rejected {
                    status: 403,
                    body: "forbidden".to_string(),
                });
            }
            Ok(PurgeResult {
                provider: self.id.clone(),
                status: 202,
                reason_phrase: reason_phrase(202),
                is_success: true,
                client_request_id: Some("req-1".to_string()),
                estimated_flush_time: None,
                message: String::new(),
            })
        }
    }

    #[test]
    fn test_normalize_paths() {
        assert_eq!(
            normalize_paths(&["root", "/about/", "contact"], DEFAULT_MAX_PATHS),
            vec!["/".to_string(), "/about".to_string(), "/contact".to_string()]
        );
        assert_eq!(normalize_paths(&["/", "about"], DEFAULT_MAX_PATHS), vec![PURGE_ALL.to_string()]);
        assert_eq!(
            normalize_paths(&["/about/", "contact", "about"], DEFAULT_MAX_PATHS),
            vec!["/about".to_string(), "/contact".to_string()]
        );
        assert_eq!(normalize_paths(&["/*"], DEFAULT_MAX_PATHS), vec![PURGE_ALL.to_string()]);
        assert_eq!(
            normalize_paths(&["docs/*", "img/a.png"], DEFAULT_MAX_PATHS),
            vec!["/docs/*".to_string(), "/img/a.png".to_string()]
        );

        let many: Vec<String> = (0..101).map(|i| format!("p{}", i)).collect();
        assert_eq!(normalize_paths(&many, DEFAULT_MAX_PATHS), vec![PURGE_ALL.to_string()]);
        assert_eq!(normalize_paths(&many[..100], DEFAULT_MAX_PATHS).len(), 100);
    }

    #[test]
    fn test_limit_counts_duplicates() {
        let repeated = vec!["/about"; 101];
        assert_eq!(normalize_paths(&repeated, DEFAULT_MAX_PATHS), vec![PURGE_ALL.to_string()]);
        assert_eq!(
            normalize_paths(&repeated[..100], DEFAULT_MAX_PATHS),
            vec!["/about".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failure_does_not_block_others() {
        let ok = RecordingProvider::new("cf", false);
        let bad = RecordingProvider::new("afd", true);
        let service = PurgeService::new(vec![bad.clone(), ok.clone()], DEFAULT_MAX_PATHS);

        let results = service.purge(&["/about/", "contact"]).await;
        assert_eq!(results.len(), 2);
        assert!(!results[0].is_success);
        assert_eq!(results[0].status, 403);
        assert_eq!(results[0].reason_phrase, "Forbidden");
        assert!(results[1].is_success);
        assert_eq!(ok.calls.lock()[0], vec!["/about".to_string(), "/contact".to_string()]);
        assert_eq!(bad.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_input_calls_nobody() {
        let ok = RecordingProvider::new("cf", false);
        let service = PurgeService::new(vec![ok.clone()], DEFAULT_MAX_PATHS);
        let empty: [&str; 0] = [];
        assert!(service.purge(&empty).await.is_empty());
        assert!(ok.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_purge_touched_rename() {
        let ok = RecordingProvider::new("cf", false);
        let service = PurgeService::new(vec![ok.clone()], DEFAULT_MAX_PATHS);
        let touched = TouchedPaths {
            destination: "new.html".to_string(),
            source: Some("old.html".to_string()),
            is_folder: false,
        };
        service.purge_touched(&touched).await;
        assert_eq!(ok.calls.lock()[0], vec!["/new.html".to_string(), "/old.html".to_string()]);
    }

    #[test]
    fn test_from_config_unknown_type() {
        let mut settings = CdnSettings::default();
        settings.providers.push(CdnProviderConfig {
            id: "x".to_string(),
            provider_type: "akamai".to_string(),
            enabled: true,
            credential: None,
            config: serde_json::Value::Null,
        });
        let creds = crate::credentials::StaticCredentials::default();
        assert!(matches!(
            PurgeService::from_config(&settings, &creds),
            Err(PurgeError::Config(_))
        ));
        settings.providers[0].enabled = false;
        assert!(PurgeService::from_config(&settings, &creds).unwrap().is_empty());
    }
}
