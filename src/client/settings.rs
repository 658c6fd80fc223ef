use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::LocalStorageError;
use super::local::LocalStorage;

const MODE_KEY: &str = "storage-mode";
const REMOTE_KEY: &str = "remote-settings";

/// Where the data manager keeps the authoritative copy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Local,
    Remote,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Local => f.write_str("local"),
            StorageMode::Remote => f.write_str("remote"),
        }
    }
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageMode::Local),
            "remote" => Ok(StorageMode::Remote),
            other => Err(format!("unknown storage mode '{other}'")),
        }
    }
}

/// How to reach the sync service and which tenant database to ask it for.
/// Unset database fields fall back to the server's own configuration.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSettings {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl fmt::Debug for RemoteSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSettings")
            .field("url", &self.url)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Client settings persisted next to the project data.
#[derive(Clone)]
pub struct ClientSettings {
    storage: Arc<dyn LocalStorage>,
}

impl ClientSettings {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage }
    }

    pub fn mode(&self) -> Result<StorageMode, LocalStorageError> {
        Ok(self.read(MODE_KEY)?.unwrap_or_default())
    }

    pub fn set_mode(&self, mode: StorageMode) -> Result<(), LocalStorageError> {
        self.storage.set(MODE_KEY, &serde_json::to_string(&mode)?)
    }

    pub fn remote(&self) -> Result<RemoteSettings, LocalStorageError> {
        Ok(self.read(REMOTE_KEY)?.unwrap_or_default())
    }

    pub fn set_remote(&self, remote: &RemoteSettings) -> Result<(), LocalStorageError> {
        self.storage.set(REMOTE_KEY, &serde_json::to_string(remote)?)
    }

    fn read<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>, LocalStorageError> {
        let Some(json) = self.storage.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(key, error = %err, "ignoring unreadable setting");
                Ok(None)
            }
        }
    }
}
