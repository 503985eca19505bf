//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Seconds before an unanswered proxied call is failed back to the
    /// caller.
    #[serde(default = "default_proxy_timeout_secs")]
    pub proxy_timeout_secs: u64,
    #[serde(default)]
    pub defaults: SessionDefaults,
    #[serde(default)]
    pub engines: Vec<EngineConfig>,
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// Starting balances applied when a session does not specify its own.
#[derive(Debug, Deserialize, Clone)]
pub struct SessionDefaults {
    #[serde(default = "default_balance_base")]
    pub initial_balance_base: Decimal,
    #[serde(default)]
    pub initial_balance_comm: Decimal,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            initial_balance_base: default_balance_base(),
            initial_balance_comm: Decimal::ZERO,
        }
    }
}

/// One entry of the bot-engine catalog.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub name: String,
    pub executable: String,
}

/// One entry of the market-adapter catalog.
#[derive(Debug, Deserialize, Clone)]
pub struct AdapterConfig {
    pub name: String,
    pub executable: String,
    pub currency_base: String,
    pub currency_comm: String,
}

/// Provisioned account; key material is hex encoded in the files.
#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub name: String,
    pub key: String,
    pub secret: String,
}

impl UserConfig {
    pub fn key_bytes(&self) -> Result<[u8; 32]> {
        decode_key(&self.key).with_context(|| format!("invalid key for user '{}'", self.name))
    }

    pub fn secret_bytes(&self) -> Result<[u8; 32]> {
        decode_key(&self.secret)
            .with_context(|| format!("invalid secret for user '{}'", self.name))
    }
}

fn decode_key(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value).context("not valid hex")?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("expected 32 bytes of key material"))?;
    Ok(array)
}

fn default_listen_addr() -> String {
    "127.0.0.1:40124".into()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9100".into()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_proxy_timeout_secs() -> u64 {
    30
}

fn default_balance_base() -> Decimal {
    Decimal::new(100, 0)
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `ARBOR_`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    load_config_from(Path::new("config"), env)
}

/// Same as [`load_config`] with an explicit base directory; used by tests.
pub fn load_config_from(base_path: &Path, env: Option<&str>) -> Result<AppConfig> {
    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("ARBOR")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}
