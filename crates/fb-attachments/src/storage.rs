//! Remote Storage Adapter
//!
//! Pushes queued attachment payloads to an object storage provider and builds
//! URLs for stored keys. Credentials, the connection and the directory handle
//! are resolved on first use and kept for the lifetime of the adapter.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use fb_core::{ConfigError, StorageConfig};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cloudfront::{CloudFrontSigner, SigningError};
use crate::credentials::{CredentialSource, Credentials};
use crate::model::{DeleteQueue, QueuedFile, WriteQueue};
use crate::provider::{
    Connection, Connector, DefaultConnector, Directory, NewObject, ProviderError,
};

/// Number of host shards selected by `%d` in a host template
pub const HOST_SHARDS: u64 = 4;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The directory was still missing after it was created once
    #[error("Directory {directory} not found while storing {key}")]
    DirectoryMissing { directory: String, key: String },
    #[error("Provider error: {0}")]
    Provider(ProviderError),
    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No file assigned for style {0}")]
    NoFile(String),
}

impl From<ProviderError> for StorageError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Config(e) => StorageError::Config(e),
            other => StorageError::Provider(other),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A local copy of a stored file
#[derive(Debug)]
pub enum LocalFile {
    /// Still queued for upload; no provider call was made
    Queued(QueuedFile),
    /// Downloaded into a temporary file, removed when dropped
    Downloaded(NamedTempFile),
}

impl LocalFile {
    /// Read the whole content
    pub async fn bytes(&self) -> StorageResult<Bytes> {
        match self {
            LocalFile::Queued(file) => Ok(file.body.clone()),
            LocalFile::Downloaded(temp) => Ok(Bytes::from(fs::read(temp.path()).await?)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            LocalFile::Queued(_) => None,
            LocalFile::Downloaded(temp) => Some(temp.path()),
        }
    }
}

/// Adapter between an attachment and a storage provider
pub struct RemoteStorage {
    config: StorageConfig,
    environment: String,
    connector: Arc<dyn Connector>,
    credential_source: Option<CredentialSource>,
    credentials: Option<Credentials>,
    connection: Option<Arc<dyn Connection>>,
    directory: Option<Arc<dyn Directory>>,
    signer: Option<CloudFrontSigner>,
}

impl std::fmt::Debug for RemoteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStorage")
            .field("directory", &self.config.directory)
            .field("environment", &self.environment)
            .field("connected", &self.connection.is_some())
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl RemoteStorage {
    /// Create an adapter using the provider named in the credentials
    pub fn new(config: StorageConfig, environment: impl Into<String>) -> StorageResult<Self> {
        Self::with_connector(config, environment, Arc::new(DefaultConnector))
    }

    /// Create an adapter with an explicit connector
    ///
    /// Fails when the credentials value has an unsupported shape, or when a
    /// CloudFront host is configured without a usable key pair.
    pub fn with_connector(
        config: StorageConfig,
        environment: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> StorageResult<Self> {
        let credential_source = config
            .credentials
            .clone()
            .map(CredentialSource::from_value)
            .transpose()?;

        let signer = if config.uses_cloudfront() {
            Some(build_signer(&config)?)
        } else {
            None
        };

        Ok(Self {
            config,
            environment: environment.into(),
            connector,
            credential_source,
            credentials: None,
            connection: None,
            directory: None,
            signer,
        })
    }

    /// Replace the configured credentials, e.g. with an already-open file
    pub fn with_credentials(mut self, source: CredentialSource) -> Self {
        self.credential_source = Some(source);
        self.credentials = None;
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Resolved, environment-scoped credentials
    pub fn credentials(&mut self) -> StorageResult<&Credentials> {
        if self.credentials.is_none() {
            let source = self
                .credential_source
                .as_ref()
                .ok_or_else(|| ConfigError::invalid("no storage credentials configured"))?
                .try_clone()?;
            self.credentials = Some(source.resolve(&self.environment)?);
        }

        self.credentials
            .as_ref()
            .ok_or_else(|| ConfigError::invalid("no storage credentials configured").into())
    }

    /// The provider connection, established on first use
    pub async fn connection(&mut self) -> StorageResult<Arc<dyn Connection>> {
        if let Some(ref connection) = self.connection {
            return Ok(connection.clone());
        }

        let connector = self.connector.clone();
        let credentials = self.credentials()?;
        let connection = connector.connect(credentials).await?;
        info!(
            provider = connection.provider(),
            directory = %self.config.directory,
            "Storage connection established"
        );

        self.connection = Some(connection.clone());
        Ok(connection)
    }

    /// The directory handle, obtained on first use
    pub async fn directory(&mut self) -> StorageResult<Arc<dyn Directory>> {
        if let Some(ref directory) = self.directory {
            return Ok(directory.clone());
        }

        if self.config.directory.is_empty() {
            return Err(ConfigError::invalid("no storage directory configured").into());
        }

        let connection = self.connection().await?;
        let directory = connection.directory(&self.config.directory)?;
        self.directory = Some(directory.clone());
        Ok(directory)
    }

    /// Store one payload, creating the directory and retrying once if the
    /// provider reports it missing
    #[instrument(skip(self, file), fields(size = file.len()))]
    pub async fn write(&mut self, key: &str, file: &QueuedFile, public: bool) -> StorageResult<()> {
        let directory = self.directory().await?;
        let object = NewObject {
            key: key.to_string(),
            body: file.body.clone(),
            content_type: file.content_type.clone(),
            public,
            options: self.config.file_options.clone(),
        };

        let mut retried = false;
        loop {
            match directory.create(&object).await {
                Ok(()) => return Ok(()),
                Err(ProviderError::DirectoryNotFound(name)) if !retried => {
                    warn!(directory = %name, "Directory not found, creating it");
                    let connection = self.connection().await?;
                    connection.create_directory(&name, public).await?;
                    retried = true;
                }
                Err(ProviderError::DirectoryNotFound(name)) => {
                    return Err(StorageError::DirectoryMissing {
                        directory: name,
                        key: key.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Upload every queued style in order, then clear the queue.
    ///
    /// `key_for` maps a style to its storage key. On error the queue is left
    /// as it was. Returns the written keys.
    pub async fn flush_writes<F>(
        &mut self,
        queue: &mut WriteQueue,
        key_for: F,
    ) -> StorageResult<Vec<String>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut written = Vec::with_capacity(queue.len());

        for (style, file) in queue.iter() {
            let key = key_for(style).ok_or_else(|| StorageError::NoFile(style.to_string()))?;
            let public = self.config.public.for_style(style);
            info!(key = %key, style = style, "Saving");
            self.write(&key, file, public).await?;
            written.push(key);
        }

        queue.clear();
        Ok(written)
    }

    /// Remove every queued key, then clear the queue. Returns the removed keys.
    pub async fn flush_deletes(&mut self, queue: &mut DeleteQueue) -> StorageResult<Vec<String>> {
        let mut deleted = Vec::with_capacity(queue.len());

        if !queue.is_empty() {
            let directory = self.directory().await?;
            for key in queue.iter() {
                info!(key = %key, "Deleting");
                directory.destroy(key).await?;
                deleted.push(key.to_string());
            }
        }

        queue.clear();
        Ok(deleted)
    }

    /// Whether an object exists at `key`
    pub async fn exists(&mut self, key: &str) -> StorageResult<bool> {
        let directory = self.directory().await?;
        Ok(directory.head(key).await?.is_some())
    }

    /// Public URL of `key`, through the host override when one is configured
    pub async fn public_url(&mut self, key: &str) -> StorageResult<String> {
        if let Some(ref host) = self.config.host {
            return Ok(format!("{}/{}", host_for_key(host, key), key));
        }

        let directory = self.directory().await?;
        Ok(directory.public_url(key)?)
    }

    /// Time-limited URL for `key`: CloudFront-signed when a CDN host is
    /// configured, provider-signed otherwise
    #[instrument(skip(self))]
    pub async fn expiring_url(&mut self, key: &str, ttl: Duration) -> StorageResult<String> {
        let expires_at = expiry_after(ttl)?;

        if let (Some(signer), Some(host)) = (&self.signer, &self.config.cloudfront_host) {
            let resource = format!("{}/{}", cdn_base(host)?, key);
            debug!(resource = %resource, "Signing CloudFront URL");
            return Ok(signer.signed_url(&resource, expires_at.timestamp())?);
        }

        let directory = self.directory().await?;
        Ok(directory.expiring_url(key, expires_at).await?)
    }

    /// Read the stored body of `key`
    pub async fn read(&mut self, key: &str) -> StorageResult<Bytes> {
        let directory = self.directory().await?;
        Ok(directory.get(key).await?)
    }

    /// A local copy of `key`. A queued payload is returned as is; otherwise
    /// the object is downloaded into a temporary file.
    pub async fn to_file(&mut self, key: &str, queued: Option<&QueuedFile>) -> StorageResult<LocalFile> {
        if let Some(file) = queued {
            return Ok(LocalFile::Queued(file.clone()));
        }

        let body = self.read(key).await?;
        let extension = Path::new(key)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();

        let temp = tempfile::Builder::new()
            .prefix("fogbox-")
            .suffix(&extension)
            .tempfile()?;
        fs::write(temp.path(), &body).await?;

        debug!(key = %key, path = ?temp.path(), size = body.len(), "Downloaded to temporary file");
        Ok(LocalFile::Downloaded(temp))
    }

    /// Download `key` to `destination`
    pub async fn copy_to_local_file(&mut self, key: &str, destination: &Path) -> StorageResult<()> {
        let body = self.read(key).await?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(destination, &body).await?;

        debug!(key = %key, destination = ?destination, "Copied to local file");
        Ok(())
    }
}

/// Absolute expiry `ttl` from now.
///
/// Fails with [`ConfigError::InvalidConfiguration`] when the result does not
/// fit a timestamp.
pub fn expiry_after(ttl: Duration) -> StorageResult<DateTime<Utc>> {
    let invalid = || ConfigError::invalid(format!("expiry of {}s is out of range", ttl.as_secs()));

    let seconds = i64::try_from(ttl.as_secs()).map_err(|_| invalid())?;
    let delta = chrono::TimeDelta::try_seconds(seconds).ok_or_else(invalid)?;
    Utc::now()
        .checked_add_signed(delta)
        .ok_or_else(|| invalid().into())
}

fn build_signer(config: &StorageConfig) -> StorageResult<CloudFrontSigner> {
    let key_pair_id = config
        .cloudfront_access_key
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ConfigError::invalid("cloudfront_host requires cloudfront_access_key"))?;
    let private_key = config
        .cloudfront_private_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ConfigError::invalid("cloudfront_host requires cloudfront_private_key"))?;

    Ok(CloudFrontSigner::from_setting(key_pair_id, private_key)?)
}

/// CDN base URL; `https://` is assumed when the host has no scheme
fn cdn_base(host: &str) -> StorageResult<String> {
    let host = host.trim_end_matches('/');
    let base = if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{host}")
    };

    Url::parse(&base)
        .map_err(|e| ConfigError::invalid(format!("invalid cloudfront_host {host:?}: {e}")))?;
    Ok(base)
}

/// Shard index for a key, stable across processes
pub fn shard_for_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % HOST_SHARDS
}

/// Expand the `%d` shard placeholder of a host template
pub fn host_for_key(template: &str, key: &str) -> String {
    if template.contains("%d") {
        template.replace("%d", &shard_for_key(key).to_string())
    } else {
        template.to_string()
    }
}
