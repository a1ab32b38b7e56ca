//! Provider Abstraction
//!
//! The seam between the attachment storage adapter and the object storage
//! client that actually moves bytes. A [`Connector`] turns resolved
//! credentials into a [`Connection`]; a connection hands out [`Directory`]
//! handles (buckets / containers) that create, read and destroy objects.

pub mod aws;
pub mod local;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fb_core::ConfigError;
use thiserror::Error;

use crate::credentials::Credentials;

pub use aws::{AwsConnection, AwsDirectory};
pub use local::{LocalConnection, LocalDirectory};
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryCall, MemoryConnector, StoredObject};

const SUPPORTED_PROVIDERS_HINT: &str =
    "supported providers are \"AWS\" and \"Local\"; set `provider` in the storage credentials";

/// Provider errors
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The directory (bucket) does not exist; recoverable by creating it
    #[error("Directory not found: {0}")]
    DirectoryNotFound(String),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: &'static str,
        operation: &'static str,
    },
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Provider error: {0}")]
    Backend(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Metadata returned by a head probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// An object to be created in a directory
#[derive(Debug, Clone)]
pub struct NewObject {
    pub key: String,
    pub body: Bytes,
    pub content_type: String,
    /// Whether the object should be publicly readable
    pub public: bool,
    /// Provider-specific creation options
    pub options: BTreeMap<String, serde_json::Value>,
}

/// Builds connections from resolved credentials
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> ProviderResult<Arc<dyn Connection>>;
}

/// A live connection to a storage provider
#[async_trait]
pub trait Connection: Send + Sync {
    /// Provider name for logging
    fn provider(&self) -> &'static str;

    /// Get a handle to a directory. No remote call is made.
    fn directory(&self, name: &str) -> ProviderResult<Arc<dyn Directory>>;

    /// Create a directory on the provider
    async fn create_directory(&self, name: &str, public: bool) -> ProviderResult<()>;
}

/// A directory (bucket / container) holding objects
#[async_trait]
pub trait Directory: Send + Sync {
    fn name(&self) -> &str;

    /// Existence probe; `None` when the object is absent
    async fn head(&self, key: &str) -> ProviderResult<Option<ObjectMeta>>;

    /// Create (or overwrite) an object.
    ///
    /// Fails with [`ProviderError::DirectoryNotFound`] when the directory
    /// itself is missing.
    async fn create(&self, object: &NewObject) -> ProviderResult<()>;

    /// Read an object body
    async fn get(&self, key: &str) -> ProviderResult<Bytes>;

    /// Remove an object
    async fn destroy(&self, key: &str) -> ProviderResult<()>;

    /// Canonical public URL of an object
    fn public_url(&self, key: &str) -> ProviderResult<String>;

    /// Provider-native time-limited URL
    async fn expiring_url(&self, key: &str, expires_at: DateTime<Utc>) -> ProviderResult<String>;
}

/// Connector that picks the provider named by the credentials
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, credentials: &Credentials) -> ProviderResult<Arc<dyn Connection>> {
        match credentials.provider() {
            Some(provider) if provider.eq_ignore_ascii_case("aws") => {
                Ok(Arc::new(AwsConnection::connect(credentials).await?))
            }
            Some(provider) if provider.eq_ignore_ascii_case("local") => {
                Ok(Arc::new(LocalConnection::from_credentials(credentials)?))
            }
            Some(other) => Err(ConfigError::missing_dependency(other, SUPPORTED_PROVIDERS_HINT).into()),
            None => Err(ConfigError::invalid("credentials do not name a provider").into()),
        }
    }
}

/// Reject keys that could escape the directory
pub(crate) fn validate_key(key: &str) -> ProviderResult<()> {
    if key.is_empty()
        || key.split('/').any(|segment| segment == "..")
        || key.starts_with('/')
        || key.starts_with('\\')
    {
        return Err(ProviderError::InvalidKey(key.to_string()));
    }
    Ok(())
}
