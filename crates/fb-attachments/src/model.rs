//! Attachment Model
//!
//! Queues of pending writes and deletes, and the metadata an attachment
//! needs to compute its storage keys.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use fb_core::StorageConfig;
use serde::{Deserialize, Serialize};

/// Primary key of the record owning an attachment
pub type RecordId = i64;

/// Name of the unprocessed upload
pub const ORIGINAL_STYLE: &str = "original";

/// The record an attachment belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    /// Underscored, pluralized class name (e.g. "users")
    pub class_name: String,
    pub id: Option<RecordId>,
}

impl RecordRef {
    pub fn new(class_name: impl Into<String>, id: RecordId) -> Self {
        Self {
            class_name: class_name.into(),
            id: Some(id),
        }
    }
}

/// Metadata of the file currently assigned to an attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Original filename
    pub filename: String,
    /// MIME content type
    pub content_type: String,
    /// File size in bytes
    pub size: u64,
    pub updated_at: DateTime<Utc>,
}

/// An in-memory payload waiting to be uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFile {
    pub body: Bytes,
    pub content_type: String,
    pub original_filename: String,
}

impl QueuedFile {
    /// Create a queued file, guessing the content type from the filename
    pub fn new(filename: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let original_filename = filename.into();
        let content_type = mime_guess::from_path(&original_filename)
            .first_or_octet_stream()
            .to_string();
        Self {
            body: body.into(),
            content_type,
            original_filename,
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Pending uploads, keyed by style, in the order they were queued
#[derive(Debug, Clone, Default)]
pub struct WriteQueue {
    entries: Vec<(String, QueuedFile)>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a payload; a style queued twice keeps its position but takes
    /// the newer payload
    pub fn insert(&mut self, style: impl Into<String>, file: QueuedFile) {
        let style = style.into();
        match self.entries.iter_mut().find(|(s, _)| *s == style) {
            Some((_, existing)) => *existing = file,
            None => self.entries.push((style, file)),
        }
    }

    pub fn get(&self, style: &str) -> Option<&QueuedFile> {
        self.entries
            .iter()
            .find(|(s, _)| s == style)
            .map(|(_, file)| file)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &QueuedFile)> {
        self.entries.iter().map(|(style, file)| (style.as_str(), file))
    }

    pub fn styles(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(style, _)| style.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Storage keys waiting to be removed, in the order they were queued
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteQueue {
    keys: Vec<String>,
}

impl DeleteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a key; duplicates are ignored
    pub fn push(&mut self, key: impl Into<String>) {
        let key = key.into();
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    pub fn extend<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for key in keys {
            self.push(key);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

/// Options an attachment is declared with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentOptions {
    /// Attachment name, pluralized for paths (e.g. "avatars")
    pub name: String,
    /// Rendition names besides the original
    #[serde(default)]
    pub styles: Vec<String>,
    #[serde(default = "default_style")]
    pub default_style: String,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_style() -> String {
    ORIGINAL_STYLE.to_string()
}

impl AttachmentOptions {
    pub fn new(name: impl Into<String>, storage: StorageConfig) -> Self {
        Self {
            name: name.into(),
            styles: Vec::new(),
            default_style: default_style(),
            storage,
        }
    }

    pub fn styles<I, S>(mut self, styles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.styles = styles.into_iter().map(Into::into).collect();
        self
    }

    /// The default style followed by every declared style, each once
    pub fn all_styles(&self) -> Vec<&str> {
        let mut all = vec![self.default_style.as_str()];
        for style in &self.styles {
            if !all.contains(&style.as_str()) {
                all.push(style);
            }
        }
        all
    }
}
