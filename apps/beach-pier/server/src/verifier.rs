use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Opaque account record returned by a successful lookup. Only `api_key` is
/// interpreted; everything else rides along to `/verifyApi` callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub api_key: String,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl AccountRecord {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            attributes: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("credential store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("corrupt account record for {api_key}: {source}")]
    CorruptRecord {
        api_key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to read accounts file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse accounts file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Account lookup used both by control-channel registration and `/verifyApi`.
/// `Ok(None)` means the key is unknown; `Err` means the store could not answer.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn lookup(&self, api_key: &str) -> Result<Option<AccountRecord>, VerifierError>;
}

#[derive(Debug, Default, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: Vec<AccountRecord>,
}

/// In-memory accounts, from a TOML file and/or keys given on the command line.
#[derive(Debug, Clone, Default)]
pub struct StaticVerifier {
    accounts: HashMap<String, AccountRecord>,
}

impl StaticVerifier {
    pub fn new(records: impl IntoIterator<Item = AccountRecord>) -> Self {
        Self {
            accounts: records
                .into_iter()
                .filter(|record| !record.api_key.is_empty())
                .map(|record| (record.api_key.clone(), record))
                .collect(),
        }
    }

    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(keys.into_iter().map(AccountRecord::new))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, VerifierError> {
        let file: AccountsFile = toml::from_str(raw)?;
        Ok(Self::new(file.accounts))
    }

    /// Reads `[[accounts]]` tables from `path` and adds `extra_keys` on top.
    pub fn load(path: Option<&Path>, extra_keys: &[String]) -> Result<Self, VerifierError> {
        let mut verifier = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        for key in extra_keys.iter().filter(|key| !key.is_empty()) {
            verifier
                .accounts
                .entry(key.clone())
                .or_insert_with(|| AccountRecord::new(key.clone()));
        }
        Ok(verifier)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[async_trait]
impl CredentialVerifier for StaticVerifier {
    async fn lookup(&self, api_key: &str) -> Result<Option<AccountRecord>, VerifierError> {
        Ok(self.accounts.get(api_key).cloned())
    }
}

/// Account records stored as JSON under `pier:account:<api_key>`.
#[derive(Clone)]
pub struct RedisVerifier {
    redis: ConnectionManager,
}

impl RedisVerifier {
    pub async fn connect(redis_url: &str) -> Result<Self, VerifierError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    fn key(api_key: &str) -> String {
        format!("pier:account:{api_key}")
    }
}

#[async_trait]
impl CredentialVerifier for RedisVerifier {
    async fn lookup(&self, api_key: &str) -> Result<Option<AccountRecord>, VerifierError> {
        if api_key.is_empty() {
            return Ok(None);
        }
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(Self::key(api_key)).await?;
        let Some(raw) = raw else {
            debug!(%api_key, "account not found in redis");
            return Ok(None);
        };
        let mut record: AccountRecord =
            serde_json::from_str(&raw).map_err(|source| VerifierError::CorruptRecord {
                api_key: api_key.to_string(),
                source,
            })?;
        // The storage key is authoritative.
        record.api_key = api_key.to_string();
        Ok(Some(record))
    }
}
