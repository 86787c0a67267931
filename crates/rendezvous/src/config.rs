//! Configuration loading and management

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::{
    AnyVerifier, CachingVerifier, StaticTokenVerifier, TokenVerifier, UserInfoVerifier,
};

pub const CONFIG_FILE: &str = "config.json";

/// Main configuration for the rendezvous service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Reject joins without a valid token
    #[serde(default = "default_true")]
    pub require_token: bool,

    /// Static tokens accepted without asking the identity provider
    #[serde(default)]
    pub api_keys: Vec<ApiKey>,

    /// Identity provider configuration
    #[serde(default)]
    pub userinfo: UserInfoConfig,

    /// How long a successful verification is remembered (0 = never)
    #[serde(default = "default_token_cache_ttl")]
    pub token_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    /// The key value
    pub key: String,
    /// Human-readable name, logged as the identity
    pub name: String,
    /// Whether this key is active
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfoConfig {
    /// Ask the identity provider about tokens that are not API keys
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// OIDC userinfo endpoint; a token is valid if this returns 2xx
    #[serde(default = "default_userinfo_url")]
    pub url: String,

    /// Request timeout in seconds
    #[serde(default = "default_userinfo_timeout")]
    pub timeout_secs: u64,
}

impl Default for UserInfoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_userinfo_url(),
            timeout_secs: default_userinfo_timeout(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:10000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_userinfo_url() -> String {
    "https://www.googleapis.com/oauth2/v3/userinfo".to_string()
}

fn default_userinfo_timeout() -> u64 {
    10
}

fn default_token_cache_ttl() -> u64 {
    300 // 5 minutes
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            require_token: true,
            api_keys: Vec::new(),
            userinfo: UserInfoConfig::default(),
            token_cache_ttl_secs: default_token_cache_ttl(),
        }
    }
}

impl Config {
    /// Load `config.json` from the config directory, writing the defaults
    /// there for reference if it does not exist yet.
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let config_file = config_path.join(CONFIG_FILE);

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", config_file))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();

            std::fs::create_dir_all(config_path)
                .with_context(|| format!("Failed to create config directory: {:?}", config_path))?;

            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    /// Active API key values.
    pub fn active_keys(&self) -> impl Iterator<Item = &ApiKey> {
        self.api_keys.iter().filter(|k| k.active)
    }

    /// Build the token verifier this configuration describes.
    ///
    /// `None` means joins are accepted without a token. API keys are checked
    /// before the identity provider, whose answers are cached.
    pub fn build_verifier(&self) -> Result<Option<Arc<dyn TokenVerifier>>> {
        if !self.require_token {
            return Ok(None);
        }

        let mut chain: Vec<Arc<dyn TokenVerifier>> = Vec::new();

        let keys: Vec<(String, String)> = self
            .active_keys()
            .map(|k| (k.key.clone(), k.name.clone()))
            .collect();
        if !keys.is_empty() {
            chain.push(Arc::new(StaticTokenVerifier::new(keys)));
        }

        if self.userinfo.enabled {
            let userinfo = UserInfoVerifier::new(
                &self.userinfo.url,
                Duration::from_secs(self.userinfo.timeout_secs),
            )?;
            let ttl = Duration::from_secs(self.token_cache_ttl_secs);
            chain.push(Arc::new(CachingVerifier::new(userinfo, ttl)));
        }

        anyhow::ensure!(
            !chain.is_empty(),
            "require_token is set but no API keys are active and userinfo is disabled"
        );
        Ok(Some(Arc::new(AnyVerifier::new(chain))))
    }
}
