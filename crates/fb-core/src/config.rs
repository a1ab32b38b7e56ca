//! Configuration types and loading
//!
//! Configuration is layered: built-in defaults, then an optional YAML/TOML
//! file, then `FOGBOX__*` environment variables (`__` separates nesting, e.g.
//! `FOGBOX__STORAGE__DIRECTORY=uploads`). `FOGBOX_ENV` selects the
//! deployment environment used to scope credentials.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

pub const DEFAULT_ENVIRONMENT: &str = "development";
pub const DEFAULT_PATH_TEMPLATE: &str = ":class/:attachment/:id_partition/:style/:filename";
pub const DEFAULT_URL_TEMPLATE: &str = ":fog_public_url";

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Deployment environment name ("production", "staging", ...)
    pub environment: String,

    /// Attachment storage configuration
    pub storage: StorageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: DEFAULT_ENVIRONMENT.to_string(),
            storage: StorageConfig::default(),
        }
    }
}

/// Remote storage options held by an attachment
///
/// The `fog_*` spellings are accepted as aliases so existing option files
/// can be loaded unchanged.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Key template, e.g. `:class/:attachment/:id_partition/:style/:filename`
    pub path: String,
    /// URL template; `:fog_public_url` renders the public URL of the style
    pub url: String,
    /// Credentials: an inline map, or a path to a credentials document
    #[serde(alias = "fog_credentials")]
    pub credentials: Option<serde_json::Value>,
    /// Bucket / container name
    #[serde(alias = "fog_directory")]
    pub directory: String,
    #[serde(alias = "fog_public")]
    pub public: PublicSetting,
    /// Host override for public URLs; `%d` is replaced by a shard index
    #[serde(alias = "fog_host")]
    pub host: Option<String>,
    /// Extra options passed to the provider with every created object
    #[serde(alias = "fog_file")]
    pub file_options: BTreeMap<String, serde_json::Value>,
    pub cloudfront_host: Option<String>,
    /// PEM-encoded private key, or a path to a PEM file
    pub cloudfront_private_key: Option<String>,
    /// CloudFront key pair id
    pub cloudfront_access_key: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_PATH_TEMPLATE.to_string(),
            url: DEFAULT_URL_TEMPLATE.to_string(),
            credentials: None,
            directory: String::new(),
            public: PublicSetting::default(),
            host: None,
            file_options: BTreeMap::new(),
            cloudfront_host: None,
            cloudfront_private_key: None,
            cloudfront_access_key: None,
        }
    }
}

impl StorageConfig {
    /// Whether expiring URLs are signed for the CDN instead of the provider
    pub fn uses_cloudfront(&self) -> bool {
        self.cloudfront_host
            .as_deref()
            .is_some_and(|host| !host.is_empty())
    }
}

/// Object visibility, either global or per style
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PublicSetting {
    All(bool),
    PerStyle(BTreeMap<String, bool>),
}

impl Default for PublicSetting {
    fn default() -> Self {
        PublicSetting::All(true)
    }
}

impl PublicSetting {
    /// Visibility for a style; styles missing from a per-style map are public
    pub fn for_style(&self, style: &str) -> bool {
        match self {
            PublicSetting::All(public) => *public,
            PublicSetting::PerStyle(styles) => styles.get(style).copied().unwrap_or(true),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = file {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let mut config: AppConfig = builder
            .add_source(::config::Environment::with_prefix("FOGBOX").separator("__"))
            .build()?
            .try_deserialize()?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(environment) = std::env::var("FOGBOX_ENV") {
            if !environment.is_empty() {
                self.environment = environment;
            }
        }
    }
}
