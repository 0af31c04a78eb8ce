//! Credential provider / 凭证提供者
//!
//! Every driver and CDN provider receives its own credential at
//! construction, looked up by the name in its configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Backend credential / 后端凭证
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    AzureSharedKey {
        account: String,
        key: String,
    },
    AwsAccessKey {
        access_key_id: String,
        secret_access_key: String,
        #[serde(default)]
        session_token: Option<String>,
    },
    AzureClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    BearerToken {
        token: String,
    },
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::AzureSharedKey { .. } => "azure_shared_key",
            Credential::AwsAccessKey { .. } => "aws_access_key",
            Credential::AzureClientSecret { .. } => "azure_client_secret",
            Credential::BearerToken { .. } => "bearer_token",
        }
    }
}

// Secrets never reach the logs
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::AzureSharedKey { account, .. } => f
                .debug_struct("AzureSharedKey")
                .field("account", account)
                .finish_non_exhaustive(),
            Credential::AwsAccessKey { access_key_id, .. } => f
                .debug_struct("AwsAccessKey")
                .field("access_key_id", access_key_id)
                .finish_non_exhaustive(),
            Credential::AzureClientSecret { tenant_id, client_id, .. } => f
                .debug_struct("AzureClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            Credential::BearerToken { .. } => f.debug_struct("BearerToken").finish_non_exhaustive(),
        }
    }
}

/// Credential lookup by name / 按名称获取凭证
pub trait CredentialProvider: Send + Sync {
    fn credential(&self, name: &str) -> Option<Credential>;
}

/// Credentials declared in the configuration file / 配置文件中的凭证
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    credentials: HashMap<String, Credential>,
}

impl StaticCredentials {
    pub fn new(credentials: HashMap<String, Credential>) -> Self {
        Self { credentials }
    }

    pub fn insert(&mut self, name: &str, credential: Credential) {
        self.credentials.insert(name.to_string(), credential);
    }
}

impl CredentialProvider for StaticCredentials {
    fn credential(&self, name: &str) -> Option<Credential> {
        self.credentials.get(name).cloned()
    }
}

/// Credentials read from `OMNISTORE_<NAME>_*` environment variables / 环境变量凭证
///
/// Recognised suffixes: `ACCOUNT` + `KEY`, `ACCESS_KEY_ID` +
/// `SECRET_ACCESS_KEY` (+ `SESSION_TOKEN`), `TENANT_ID` + `CLIENT_ID` +
/// `CLIENT_SECRET`, `TOKEN`.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    fn var(name: &str, suffix: &str) -> Option<String> {
        let key = format!(
            "OMNISTORE_{}_{}",
            name.to_uppercase().replace(['-', '.', ' '], "_"),
            suffix
        );
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl CredentialProvider for EnvCredentials {
    fn credential(&self, name: &str) -> Option<Credential> {
        if let (Some(account), Some(key)) = (Self::var(name, "ACCOUNT"), Self::var(name, "KEY")) {
            return Some(Credential::AzureSharedKey { account, key });
        }
        if let (Some(access_key_id), Some(secret_access_key)) = (
            Self::var(name, "ACCESS_KEY_ID"),
            Self::var(name, "SECRET_ACCESS_KEY"),
        ) {
            return Some(Credential::AwsAccessKey {
                access_key_id,
                secret_access_key,
                session_token: Self::var(name, "SESSION_TOKEN"),
            });
        }
        if let (Some(tenant_id), Some(client_id), Some(client_secret)) = (
            Self::var(name, "TENANT_ID"),
            Self::var(name, "CLIENT_ID"),
            Self::var(name, "CLIENT_SECRET"),
        ) {
            return Some(Credential::AzureClientSecret {
                tenant_id,
                client_id,
                client_secret,
            });
        }
        Self::var(name, "TOKEN").map(|token| Credential::BearerToken { token })
    }
}

/// Try several providers in order / 依次查找
pub struct ChainedCredentials {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl ChainedCredentials {
    pub fn new(providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }
}

impl CredentialProvider for ChainedCredentials {
    fn credential(&self, name: &str) -> Option<Credential> {
        self.providers.iter().find_map(|p| p.credential(name))
    }
}
