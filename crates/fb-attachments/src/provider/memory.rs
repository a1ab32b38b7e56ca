//! In-memory provider for testing, built under `cfg(test)` or the `testing` feature
//!
//! Every provider call is recorded so tests can assert exactly which remote
//! operations a flush performed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    validate_key, Connection, Connector, Directory, NewObject, ObjectMeta, ProviderError,
    ProviderResult,
};
use crate::credentials::Credentials;

/// A provider operation, as seen by the memory backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryCall {
    Connect,
    CreateDirectory(String),
    Head(String),
    Create(String),
    Get(String),
    Destroy(String),
    ExpiringUrl(String),
}

/// A stored object
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
    pub public: bool,
    pub options: BTreeMap<String, serde_json::Value>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    directories: HashMap<String, HashMap<String, StoredObject>>,
    calls: Vec<MemoryCall>,
    /// Directory creation "succeeds" without the directory ever appearing
    ignore_directory_creation: bool,
}

/// In-memory connector; clones share the same backing state
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing, empty directory
    pub fn with_directory(self, name: &str) -> Self {
        self.state
            .lock()
            .directories
            .entry(name.to_string())
            .or_default();
        self
    }

    /// Make directory creation a silent no-op, so writes keep failing
    pub fn ignore_directory_creation(self) -> Self {
        self.state.lock().ignore_directory_creation = true;
        self
    }

    /// Store an object directly, bypassing call recording
    pub fn insert(&self, directory: &str, key: &str, body: impl Into<Bytes>) {
        let object = StoredObject {
            body: body.into(),
            content_type: mime_guess::from_path(key)
                .first_or_octet_stream()
                .to_string(),
            public: true,
            options: BTreeMap::new(),
            last_modified: Utc::now(),
        };
        self.state
            .lock()
            .directories
            .entry(directory.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    pub fn object(&self, directory: &str, key: &str) -> Option<StoredObject> {
        self.state
            .lock()
            .directories
            .get(directory)
            .and_then(|objects| objects.get(key))
            .cloned()
    }

    pub fn has_directory(&self, name: &str) -> bool {
        self.state.lock().directories.contains_key(name)
    }

    /// All calls recorded so far
    pub fn calls(&self) -> Vec<MemoryCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _credentials: &Credentials) -> ProviderResult<Arc<dyn Connection>> {
        self.state.lock().calls.push(MemoryCall::Connect);
        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn provider(&self) -> &'static str {
        "Memory"
    }

    fn directory(&self, name: &str) -> ProviderResult<Arc<dyn Directory>> {
        Ok(Arc::new(MemoryDirectory {
            name: name.to_string(),
            state: self.state.clone(),
        }))
    }

    async fn create_directory(&self, name: &str, _public: bool) -> ProviderResult<()> {
        let mut state = self.state.lock();
        state.calls.push(MemoryCall::CreateDirectory(name.to_string()));
        if !state.ignore_directory_creation {
            state.directories.entry(name.to_string()).or_default();
        }
        Ok(())
    }
}

struct MemoryDirectory {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl Directory for MemoryDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn head(&self, key: &str) -> ProviderResult<Option<ObjectMeta>> {
        let mut state = self.state.lock();
        state.calls.push(MemoryCall::Head(key.to_string()));
        let objects = state
            .directories
            .get(&self.name)
            .ok_or_else(|| ProviderError::DirectoryNotFound(self.name.clone()))?;

        Ok(objects.get(key).map(|object| ObjectMeta {
            key: key.to_string(),
            size: object.body.len() as u64,
            content_type: Some(object.content_type.clone()),
            last_modified: Some(object.last_modified),
        }))
    }

    async fn create(&self, object: &NewObject) -> ProviderResult<()> {
        validate_key(&object.key)?;
        let mut state = self.state.lock();
        state.calls.push(MemoryCall::Create(object.key.clone()));
        let objects = state
            .directories
            .get_mut(&self.name)
            .ok_or_else(|| ProviderError::DirectoryNotFound(self.name.clone()))?;

        objects.insert(
            object.key.clone(),
            StoredObject {
                body: object.body.clone(),
                content_type: object.content_type.clone(),
                public: object.public,
                options: object.options.clone(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> ProviderResult<Bytes> {
        let mut state = self.state.lock();
        state.calls.push(MemoryCall::Get(key.to_string()));
        state
            .directories
            .get(&self.name)
            .ok_or_else(|| ProviderError::DirectoryNotFound(self.name.clone()))?
            .get(key)
            .map(|object| object.body.clone())
            .ok_or_else(|| ProviderError::NotFound(key.to_string()))
    }

    async fn destroy(&self, key: &str) -> ProviderResult<()> {
        let mut state = self.state.lock();
        state.calls.push(MemoryCall::Destroy(key.to_string()));
        if let Some(objects) = state.directories.get_mut(&self.name) {
            objects.remove(key);
        }
        Ok(())
    }

    fn public_url(&self, key: &str) -> ProviderResult<String> {
        Ok(format!("memory://{}/{}", self.name, key))
    }

    async fn expiring_url(&self, key: &str, expires_at: DateTime<Utc>) -> ProviderResult<String> {
        self.state
            .lock()
            .calls
            .push(MemoryCall::ExpiringUrl(key.to_string()));
        Ok(format!(
            "memory://{}/{}?expires={}",
            self.name,
            key,
            expires_at.timestamp()
        ))
    }
}
