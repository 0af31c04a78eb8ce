//! Azure Front Door purge / Azure Front Door缓存刷新
//!
//! 设计原则：
//! - AAD client_credentials令牌，缓存到过期前一分钟
//! - 调用管理平面 afdEndpoints/{endpoint}/purge
//! - 202 Accepted 即视为成功，实际刷新由服务端异步完成

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::{reason_phrase, CdnProvider, PurgeError, PurgeResult};
use crate::credentials::Credential;

pub const API_VERSION: &str = "2023-05-01";

/// Refresh this long before the token expires / 提前刷新
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

fn default_management_endpoint() -> String {
    "https://management.azure.com".to_string()
}

fn default_authority() -> String {
    "https://login.microsoftonline.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontDoorConfig {
    pub subscription_id: String,
    pub resource_group: String,
    pub profile_name: String,
    pub endpoint_name: String,
    /// Custom domains to purge, empty for every domain of the endpoint
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,
    #[serde(default = "default_authority")]
    pub authority: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct PurgeBody<'a> {
    content_paths: &'a [String],
    #[serde(skip_serializing_if = "no_domains")]
    domains: &'a [String],
}

fn no_domains(domains: &&[String]) -> bool {
    domains.is_empty()
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct FrontDoorProvider {
    id: String,
    config: FrontDoorConfig,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    client: Client,
    token: Arc<RwLock<Option<CachedToken>>>,
}

impl FrontDoorProvider {
    pub fn new(id: &str, config: FrontDoorConfig, credential: Option<Credential>) -> Result<Self, PurgeError> {
        let (tenant_id, client_id, client_secret) = match credential {
            Some(Credential::AzureClientSecret {
                tenant_id,
                client_id,
                client_secret,
            }) => (tenant_id, client_id, client_secret),
            Some(other) => {
                return Err(PurgeError::Config(format!(
                    "Front Door provider {} needs an azure_client_secret credential, got {}",
                    id,
                    other.kind()
                )))
            }
            None => {
                return Err(PurgeError::Config(format!(
                    "Front Door provider {} has no credential",
                    id
                )))
            }
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            id: id.to_string(),
            config,
            tenant_id,
            client_id,
            client_secret,
            client,
            token: Arc::new(RwLock::new(None)),
        })
    }

    fn purge_url(&self) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Cdn/profiles/{}/afdEndpoints/{}/purge?api-version={}",
            self.config.management_endpoint.trim_end_matches('/'),
            self.config.subscription_id,
            self.config.resource_group,
            self.config.profile_name,
            self.config.endpoint_name,
            API_VERSION
        )
    }

    fn scope(&self) -> String {
        format!("{}/.default", self.config.management_endpoint.trim_end_matches('/'))
    }

    /// 获取访问令牌（带缓存）
    async fn access_token(&self) -> Result<String, PurgeError> {
        {
            let token = self.token.read().await;
            if let Some(ref t) = *token {
                if Instant::now() < t.expires_at {
                    return Ok(t.value.clone());
                }
            }
        }
        self.refresh_access_token().await
    }

    /// 使用client_credentials获取新令牌
    async fn refresh_access_token(&self) -> Result<String, PurgeError> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.authority.trim_end_matches('/'),
            self.tenant_id
        );
        let scope = self.scope();

        let mut params = HashMap::new();
        params.insert("grant_type", "client_credentials");
        params.insert("client_id", &self.client_id);
        params.insert("client_secret", &self.client_secret);
        params.insert("scope", &scope);

        tracing::debug!("Front Door {}: requesting AAD token", self.id);
        let response = self.client.post(&url).form(&params).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<TokenError>(&text) {
                Ok(err) => format!("{}: {}", err.error, err.error_description.unwrap_or_default()),
                Err(_) => format!("HTTP {}: {}", status, text),
            };
            return Err(PurgeError::Auth(message));
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let expires_at = Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN);

        let mut cached = self.token.write().await;
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }
}

#[async_trait]
impl CdnProvider for FrontDoorProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn provider_type(&self) -> &'static str {
        "front_door"
    }

    async fn purge(&self, paths: &[String]) -> Result<PurgeResult, PurgeError> {
        let token = self.access_token().await?;
        let client_request_id = uuid::Uuid::new_v4().to_string();
        let body = PurgeBody {
            content_paths: paths,
            domains: &self.config.domains,
        };

        tracing::debug!(
            "Front Door {}: purging {} path(s) on {}",
            self.id,
            paths.len(),
            self.config.endpoint_name
        );
        let response = self
            .client
            .post(self.purge_url())
            .bearer_auth(&token)
            .header("x-ms-client-request-id", &client_request_id)
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 401 {
            // 令牌失效，下次重新获取
            *self.token.write().await = None;
        }
        let request_id = response
            .headers()
            .get("x-ms-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or(client_request_id);
        let is_success = response.status().is_success();
        let text = response.text().await.unwrap_or_default();

        if !is_success {
            return Err(PurgeError::Rejected { status, body: text });
        }

        Ok(PurgeResult {
            provider: self.id.clone(),
            status,
            reason_phrase: reason_phrase(status),
            is_success,
            client_request_id: Some(request_id),
            estimated_flush_time: None,
            message: format!("purge of {} path(s) accepted", paths.len()),
        })
    }
}
