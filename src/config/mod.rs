use std::time::Duration;

use anyhow::Result;
use dotenvy::dotenv;
use serde::Deserialize;

use crate::server::routing::ConnectionParams;

/// Configuration for the API server
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Interface the HTTP listener binds to
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Fallback database parameters, used field by field whenever a request
    /// does not carry its own.
    pub pghost: Option<String>,
    pub pgport: Option<String>,
    pub pgdatabase: Option<String>,
    pub pguser: Option<String>,
    pub pgpassword: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    3000
}

fn default_connect_timeout_secs() -> u64 {
    5
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// This function will:
    /// 1. Load variables from .env file if it exists
    /// 2. Deserialize environment variables into Config struct
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let config = envy::from_env::<Config>()?;

        Ok(config)
    }

    /// The process-wide fallback set for credential routing
    pub fn fallback_params(&self) -> ConnectionParams {
        ConnectionParams {
            host: self.pghost.clone(),
            port: self.pgport.clone(),
            database: self.pgdatabase.clone(),
            user: self.pguser.clone(),
            password: self.pgpassword.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.db_connect_timeout_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

/// Initialize environment variables and load configuration
pub fn init() -> Result<Config> {
    let config = Config::load()?;
    tracing::debug!(
        listen = %config.listen_addr(),
        fallback_host = ?config.pghost,
        fallback_database = ?config.pgdatabase,
        "configuration loaded"
    );
    Ok(config)
}
