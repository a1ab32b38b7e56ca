//! Local filesystem provider
//!
//! Directories are sub-directories of `local_root`. Public URLs are served
//! from `endpoint` when one is configured, otherwise they are file paths.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fb_core::ConfigError;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{
    validate_key, Connection, Directory, NewObject, ObjectMeta, ProviderError, ProviderResult,
};
use crate::credentials::Credentials;

/// Connection to a directory tree on local disk
#[derive(Debug, Clone)]
pub struct LocalConnection {
    root: PathBuf,
    endpoint: Option<String>,
}

impl LocalConnection {
    pub fn new(root: impl AsRef<Path>, endpoint: Option<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            endpoint,
        }
    }

    /// Build from `local_root` and optional `endpoint` credentials
    pub fn from_credentials(credentials: &Credentials) -> ProviderResult<Self> {
        let root = credentials
            .get_str("local_root")
            .filter(|root| !root.is_empty())
            .ok_or_else(|| ConfigError::invalid("Local provider requires `local_root`"))?;

        Ok(Self::new(
            root,
            credentials.get_str("endpoint").map(str::to_string),
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn provider(&self) -> &'static str {
        "Local"
    }

    fn directory(&self, name: &str) -> ProviderResult<Arc<dyn Directory>> {
        validate_key(name)?;
        Ok(Arc::new(LocalDirectory {
            name: name.to_string(),
            path: self.root.join(name),
            endpoint: self.endpoint.clone(),
        }))
    }

    async fn create_directory(&self, name: &str, _public: bool) -> ProviderResult<()> {
        validate_key(name)?;
        let path = self.root.join(name);
        fs::create_dir_all(&path).await?;
        debug!(path = ?path, "Directory created");
        Ok(())
    }
}

/// A directory on local disk
#[derive(Debug, Clone)]
pub struct LocalDirectory {
    name: String,
    path: PathBuf,
    endpoint: Option<String>,
}

impl LocalDirectory {
    /// Resolve a key to a full path
    fn resolve_path(&self, key: &str) -> ProviderResult<PathBuf> {
        validate_key(key)?;
        Ok(self.path.join(key))
    }

    async fn ensure_directory(&self) -> ProviderResult<()> {
        match fs::metadata(&self.path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ProviderError::DirectoryNotFound(self.name.clone())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ProviderError::DirectoryNotFound(self.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Directory for LocalDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn head(&self, key: &str) -> ProviderResult<Option<ObjectMeta>> {
        let path = self.resolve_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: meta.len(),
                content_type: Some(
                    mime_guess::from_path(key)
                        .first_or_octet_stream()
                        .to_string(),
                ),
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, object: &NewObject) -> ProviderResult<()> {
        let path = self.resolve_path(&object.key)?;
        self.ensure_directory().await?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&path).await?;
        file.write_all(&object.body).await?;
        file.sync_all().await?;

        debug!(path = ?path, size = object.body.len(), "File stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> ProviderResult<Bytes> {
        let path = self.resolve_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ProviderError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn destroy(&self, key: &str) -> ProviderResult<()> {
        let path = self.resolve_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = ?path, "File deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn public_url(&self, key: &str) -> ProviderResult<String> {
        match self.endpoint {
            Some(ref endpoint) => Ok(format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                self.name,
                key
            )),
            None => Ok(self.resolve_path(key)?.display().to_string()),
        }
    }

    async fn expiring_url(&self, _key: &str, _expires_at: DateTime<Utc>) -> ProviderResult<String> {
        Err(ProviderError::Unsupported {
            provider: "Local",
            operation: "expiring URLs",
        })
    }
}
