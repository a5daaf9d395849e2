//! Configuration module for the transaction cache
//!
//! Configuration is loaded from a TOML file, then selected values can be
//! overridden from the environment (a `.env` file is honoured). Every
//! section and field has a default, so an empty file is a valid config.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::{ParseOptions, StackHeightCheck};

pub const ENV_CACHE_ROOT: &str = "TX_CACHE_ROOT";
pub const ENV_RPC_URL: &str = "TX_CACHE_RPC_URL";
pub const ENV_STRICT_STACK_HEIGHT: &str = "TX_CACHE_STRICT_STACK_HEIGHT";
pub const ENV_CONCURRENCY: &str = "TX_CACHE_CONCURRENCY";
pub const ENV_LOG_JSON: &str = "TX_CACHE_LOG_JSON";

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub parsing: ParsingConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache root; entries live in `<root>/transactions`
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_url")]
    pub url: String,

    /// Request timeout in seconds
    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub max_supported_transaction_version: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsingConfig {
    /// Enforce the inner instruction depth nesting rule
    #[serde(default)]
    pub strict_stack_height: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Signatures processed concurrently by `batch`
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive, `RUST_LOG` wins when set
    #[serde(default = "default_log_filter")]
    pub filter: String,

    #[serde(default)]
    pub json: bool,
}

fn default_cache_root() -> PathBuf { PathBuf::from("cache") }
fn default_rpc_url() -> String { "https://api.mainnet-beta.solana.com".to_string() }
fn default_rpc_timeout() -> u64 { 30 }
fn default_concurrency() -> usize { 8 }
fn default_log_filter() -> String { "info".to_string() }

impl Default for CacheConfig {
    fn default() -> Self {
        Self { root: default_cache_root() }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: default_rpc_url(),
            timeout_secs: default_rpc_timeout(),
            max_supported_transaction_version: 0,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { concurrency: default_concurrency() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(root) = lookup(ENV_CACHE_ROOT) {
            self.cache.root = PathBuf::from(root);
        }

        if let Some(url) = lookup(ENV_RPC_URL) {
            self.rpc.url = url;
        }

        if let Some(strict) = lookup(ENV_STRICT_STACK_HEIGHT) {
            self.parsing.strict_stack_height = parse_bool(ENV_STRICT_STACK_HEIGHT, &strict)?;
        }

        if let Some(concurrency) = lookup(ENV_CONCURRENCY) {
            self.batch.concurrency = concurrency
                .parse()
                .map_err(|e| anyhow!("Invalid {}: {}", ENV_CONCURRENCY, e))?;
        }

        if let Some(json) = lookup(ENV_LOG_JSON) {
            self.logging.json = parse_bool(ENV_LOG_JSON, &json)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.root.as_os_str().is_empty() {
            return Err(anyhow!("cache.root must not be empty"));
        }
        if self.rpc.url.trim().is_empty() {
            return Err(anyhow!("rpc.url must not be empty"));
        }
        if self.rpc.timeout_secs == 0 {
            return Err(anyhow!("rpc.timeout_secs must be > 0"));
        }
        if self.batch.concurrency == 0 {
            return Err(anyhow!("batch.concurrency must be > 0"));
        }
        Ok(())
    }

    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            stack_height_check: if self.parsing.strict_stack_height {
                StackHeightCheck::Strict
            } else {
                StackHeightCheck::Relaxed
            },
            max_supported_transaction_version: self.rpc.max_supported_transaction_version,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("Invalid {}: expected a boolean, got {:?}", key, other)),
    }
}
