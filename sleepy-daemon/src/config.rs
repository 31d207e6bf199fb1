//! Configuration management
//!
//! Handles:
//! - Server endpoints and the shared auth token
//! - Reconnect delay
//! - Database and SMB credentials (separate file, optional)

use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub token: String,
    pub https: bool,
    pub daemon_host: String,
    pub api_host: String,
    pub data_host: String,
    /// Seconds to wait between two connection attempts
    pub reconnect_timeout: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            https: false,
            daemon_host: "localhost:9002".to_string(),
            api_host: "localhost:9001".to_string(),
            data_host: "localhost:455".to_string(),
            reconnect_timeout: 5,
        }
    }
}

impl DaemonConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout)
    }

    pub fn socket_url(&self) -> String {
        let scheme = if self.https { "wss" } else { "ws" };
        format!("{}://{}/socket", scheme, self.daemon_host)
    }

    pub fn upload_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://{}/daemon/upload", scheme, self.api_host)
    }

    pub fn archive_url(&self, version: &str) -> String {
        format!("https://{}/daemons/{}.zip", self.data_host, version)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub databases: Vec<DatabaseServer>,
    pub smb: Vec<SmbUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseServer {
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub databases: Vec<DatabaseEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmbUser {
    pub id: String,
    pub password: String,
}

impl Credentials {
    /// Ids of every database this agent can back up
    pub fn database_ids(&self) -> Vec<String> {
        self.databases
            .iter()
            .flat_map(|server| server.databases.iter().map(|db| db.id.clone()))
            .collect()
    }

    pub fn find_database(&self, id: &str) -> Option<(&DatabaseServer, &DatabaseEntry)> {
        self.databases.iter().find_map(|server| {
            server
                .databases
                .iter()
                .find(|db| db.id == id)
                .map(|db| (server, db))
        })
    }
}

/// Everything read from disk at startup
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: DaemonConfig,
    pub credentials: Credentials,
    pub config_path: PathBuf,
    /// Working directory holding temp/, containers/ and extracted updates
    pub directory: PathBuf,
}

impl Settings {
    /// Load config and the sibling credentials.toml
    pub async fn load(config_path: Option<PathBuf>) -> AgentResult<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => Self::default_config_path()?,
        };

        let content = tokio::fs::read_to_string(&config_path).await.map_err(|e| {
            AgentError::Config(format!(
                "failed to read {} (launched from the right folder?): {}",
                config_path.display(),
                e
            ))
        })?;
        let config: DaemonConfig = toml::from_str(&content)
            .map_err(|e| AgentError::Config(format!("failed to parse config: {}", e)))?;

        let credentials_path = Self::credentials_path(&config_path);
        let credentials = if credentials_path.exists() {
            let content = tokio::fs::read_to_string(&credentials_path).await?;
            toml::from_str(&content)
                .map_err(|e| AgentError::Config(format!("failed to parse credentials: {}", e)))?
        } else {
            Credentials::default()
        };

        Ok(Self {
            config,
            credentials,
            config_path,
            directory: std::env::current_dir()?,
        })
    }

    /// `config/default.toml` in the working directory, else the OS config dir
    pub fn default_config_path() -> AgentResult<PathBuf> {
        let local = PathBuf::from("config").join("default.toml");
        if local.exists() {
            return Ok(local);
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| AgentError::Config("could not find config directory".to_string()))?;
        path.push("sleepy-daemon");
        path.push("config.toml");
        Ok(path)
    }

    fn credentials_path(config_path: &Path) -> PathBuf {
        config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("credentials.toml")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.directory.join("temp")
    }
}
