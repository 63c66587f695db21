// Configuration file handling

use crate::error::{LotmapError, Result};
use crate::orchestrator::RetryPolicy;
use lotmap_scanner::FetchOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "~/.config/lotmap/lotmap.toml";
pub const DEFAULT_DB_PATH: &str = "~/.config/lotmap/lotmap.db";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub mapper: MapperConfig,
    pub run: RunConfig,
    pub validator: ValidatorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_DB_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    pub endpoint: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub limit: usize,
    pub timeout_ms: u64,
    pub locale: String,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.firecrawl.dev".to_string(),
            api_key_env: "FIRECRAWL_API_KEY".to_string(),
            limit: 5000,
            timeout_ms: 60_000,
            locale: "pt-BR".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub concurrency: usize,
    /// Requests per minute.
    pub rate_limit: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_limit: 60,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: 60_000,
        }
    }
}

/// Expand a leading `~` in a configured path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run.concurrency == 0 {
            return Err(LotmapError::Config(
                "run.concurrency must be at least 1".to_string(),
            ));
        }
        if self.run.backoff_initial_ms > self.run.backoff_max_ms {
            return Err(LotmapError::Config(
                "run.backoff_initial_ms cannot exceed run.backoff_max_ms".to_string(),
            ));
        }
        if self.mapper.limit == 0 {
            return Err(LotmapError::Config("mapper.limit must be positive".to_string()));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LotmapError::Config(e.to_string()))
    }

    /// Write the configuration, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        expand_path(&self.database.path)
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            limit: self.mapper.limit,
            timeout_ms: self.mapper.timeout_ms,
            locale: self.mapper.locale.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.run.backoff_initial_ms),
            max_interval: Duration::from_millis(self.run.backoff_max_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn mapper_api_key(&self) -> Option<String> {
        read_env(&self.mapper.api_key_env)
    }

    pub fn validator_api_key(&self) -> Option<String> {
        read_env(&self.validator.api_key_env)
    }

    pub fn validator_timeout(&self) -> Duration {
        Duration::from_millis(self.validator.timeout_ms)
    }
}
