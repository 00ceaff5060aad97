use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, ErrorDetails};
use crate::llm::LlmConfig;
use crate::rate_limit::RateLimitConfig;
use crate::session_memory::SessionMemoryConfig;
use crate::usage_limit::UsageLimitConfig;

pub const LLM_API_KEY_ENV: &str = "SCROLLGATE_LLM_API_KEY";
pub const ADMIN_API_KEY_ENV: &str = "SCROLLGATE_ADMIN_API_KEY";
pub const DATABASE_PATH_ENV: &str = "SCROLLGATE_DATABASE_PATH";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub usage_limits: UsageLimitConfig,
    #[serde(default)]
    pub session_memory: SessionMemoryConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    /// Loaded from `SCROLLGATE_ADMIN_API_KEY`. Admin routes reject every request when unset.
    #[serde(skip)]
    pub admin_api_key: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("scrollgate.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

impl Config {
    /// Read, parse and validate the config file, then apply environment overrides
    pub async fn load_and_verify_from_path(path: &Path) -> Result<Config, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let mut config = Self::load_from_toml(&contents)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn default_from_env() -> Result<Config, Error> {
        let mut config = Config::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_toml(contents: &str) -> Result<Config, Error> {
        let deserializer = toml::Deserializer::new(contents);
        serde_path_to_error::deserialize(deserializer).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file: {e}"),
            })
        })
    }

    /// Apply secrets and path overrides from `lookup`, which maps a variable name to its value
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty(LLM_API_KEY_ENV) {
            self.llm.api_key = Some(SecretString::from(key));
        }
        if let Some(key) = non_empty(ADMIN_API_KEY_ENV) {
            self.gateway.admin_api_key = Some(SecretString::from(key));
        }
        if let Some(path) = non_empty(DATABASE_PATH_ENV) {
            self.storage.database_path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.rate_limits.validate()?;
        self.usage_limits.validate()?;
        self.session_memory.validate()?;
        self.llm.validate()?;
        if self.storage.database_path.as_os_str().is_empty() {
            return Err(Error::new(ErrorDetails::Config {
                message: "`storage.database_path` must not be empty".to_string(),
            }));
        }
        Ok(())
    }
}
