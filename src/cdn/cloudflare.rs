//! Cloudflare zone purge / Cloudflare缓存刷新
//!
//! `/*` purges everything, `/dir/*` is purged as a prefix and every other
//! path as an absolute URL on the site. Cloudflare caps a single request, so
//! long lists are split into several calls. A batch failing after earlier
//! ones went through yields a failed result counting the purged batches.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::{reason_phrase, CdnProvider, PurgeError, PurgeResult, PURGE_ALL};
use crate::credentials::Credential;

/// Files or prefixes per purge request / 单次请求最大条目数
pub const MAX_ITEMS_PER_REQUEST: usize = 30;

fn default_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudflareConfig {
    pub zone_id: String,
    /// Public site URL, e.g. `https://www.example.com`
    pub site_base_url: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    #[serde(default)]
    result: Option<PurgeId>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct PurgeId {
    id: String,
}

pub struct CloudflareProvider {
    id: String,
    config: CloudflareConfig,
    token: String,
    client: Client,
}

impl CloudflareProvider {
    pub fn new(id: &str, config: CloudflareConfig, credential: Option<Credential>) -> Result<Self, PurgeError> {
        let token = match credential {
            Some(Credential::BearerToken { token }) => token,
            Some(other) => {
                return Err(PurgeError::Config(format!(
                    "Cloudflare provider {} needs a bearer_token credential, got {}",
                    id,
                    other.kind()
                )))
            }
            None => {
                return Err(PurgeError::Config(format!(
                    "Cloudflare provider {} has no credential",
                    id
                )))
            }
        };
        if url::Url::parse(&config.site_base_url).is_err() {
            return Err(PurgeError::Config(format!(
                "Cloudflare provider {}: invalid site_base_url {}",
                id, config.site_base_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            id: id.to_string(),
            config,
            token,
            client,
        })
    }

    fn purge_url(&self) -> String {
        format!(
            "{}/zones/{}/purge_cache",
            self.config.api_base.trim_end_matches('/'),
            self.config.zone_id
        )
    }

    /// Request bodies for normalized paths / 构造请求体
    fn request_bodies(&self, paths: &[String]) -> Vec<Value> {
        if paths.iter().any(|p| p == PURGE_ALL) {
            return vec![json!({ "purge_everything": true })];
        }

        let base = self.config.site_base_url.trim_end_matches('/');
        // 前缀不带协议：www.example.com/docs
        let host_base = base
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(base);

        let mut files = Vec::new();
        let mut prefixes = Vec::new();
        for path in paths {
            match path.strip_suffix("/*") {
                Some(prefix) => prefixes.push(format!("{}{}", host_base, prefix)),
                None => files.push(format!("{}{}", base, path)),
            }
        }

        let mut bodies = Vec::new();
        for chunk in files.chunks(MAX_ITEMS_PER_REQUEST) {
            bodies.push(json!({ "files": chunk }));
        }
        for chunk in prefixes.chunks(MAX_ITEMS_PER_REQUEST) {
            bodies.push(json!({ "prefixes": chunk }));
        }
        bodies
    }

    async fn send(&self, body: &Value) -> Result<(u16, Option<String>), PurgeError> {
        let response = self
            .client
            .post(self.purge_url())
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let parsed: Option<ApiResponse> = serde_json::from_str(&text).ok();

        match parsed {
            Some(api) if api.success && (200..300).contains(&status) => {
                Ok((status, api.result.map(|r| r.id)))
            }
            Some(api) => {
                let errors: Vec<String> = api
                    .errors
                    .iter()
                    .map(|e| format!("{} {}", e.code, e.message))
                    .collect();
                Err(PurgeError::Rejected {
                    status,
                    body: errors.join("; "),
                })
            }
            None => Err(PurgeError::Rejected { status, body: text }),
        }
    }

    /// Result for a purge that stopped after `done` of `total` batches / 部分成功
    fn partial_result(
        &self,
        done: usize,
        total: usize,
        request_ids: &[String],
        err: &PurgeError,
    ) -> PurgeResult {
        let mut result = PurgeResult::failed(&self.id, err);
        result.client_request_id = (!request_ids.is_empty()).then(|| request_ids.join(","));
        result.message = format!("{} of {} batches purged, then: {}", done, total, err);
        result
    }
}

#[async_trait]
impl CdnProvider for CloudflareProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn provider_type(&self) -> &'static str {
        "cloudflare"
    }

    async fn purge(&self, paths: &[String]) -> Result<PurgeResult, PurgeError> {
        let bodies = self.request_bodies(paths);
        tracing::debug!(
            "Cloudflare {}: purging {} path(s) in {} request(s)",
            self.id,
            paths.len(),
            bodies.len()
        );

        let mut status = 200;
        let mut request_ids = Vec::new();
        for (done, body) in bodies.iter().enumerate() {
            match self.send(body).await {
                Ok((s, request_id)) => {
                    status = s;
                    request_ids.extend(request_id);
                }
                Err(e) if done == 0 => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "Cloudflare {}: batch {} of {} failed after earlier batches were purged",
                        self.id,
                        done + 1,
                        bodies.len()
                    );
                    return Ok(self.partial_result(done, bodies.len(), &request_ids, &e));
                }
            }
        }

        Ok(PurgeResult {
            provider: self.id.clone(),
            status,
            reason_phrase: reason_phrase(status),
            is_success: true,
            client_request_id: (!request_ids.is_empty()).then(|| request_ids.join(",")),
            estimated_flush_time: None,
            message: format!("purged {} path(s)", paths.len()),
        })
    }
}
