//! Attachment
//!
//! A file attached to a record. Assigning a file queues its payload for
//! upload and the previous file's keys for deletion; nothing reaches the
//! provider until [`Attachment::save`] or [`Attachment::destroy`].

use std::fmt;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::interpolation::{interpolate, interpolate_with, InterpolationContext};
use crate::model::{AttachmentOptions, DeleteQueue, FileInfo, QueuedFile, RecordRef, WriteQueue};
use crate::storage::{LocalFile, RemoteStorage, StorageError, StorageResult};

/// Token in the url template replaced by the public URL of the style
pub const PUBLIC_URL_TOKEN: &str = "fog_public_url";

/// Runs with the keys written by a successful flush
pub type AfterFlushWrites = Box<dyn FnMut(&[String]) + Send>;

/// A file attached to a record and stored remotely
pub struct Attachment {
    options: AttachmentOptions,
    record: RecordRef,
    file: Option<FileInfo>,
    queued_for_write: WriteQueue,
    queued_for_delete: DeleteQueue,
    storage: RemoteStorage,
    after_flush_writes: Option<AfterFlushWrites>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("name", &self.options.name)
            .field("record", &self.record)
            .field("file", &self.file)
            .field("queued_for_write", &self.queued_for_write.len())
            .field("queued_for_delete", &self.queued_for_delete.len())
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl Attachment {
    /// Create an attachment whose storage adapter is built from its options
    pub fn new(
        options: AttachmentOptions,
        record: RecordRef,
        environment: impl Into<String>,
    ) -> StorageResult<Self> {
        let storage = RemoteStorage::new(options.storage.clone(), environment)?;
        Ok(Self::with_storage(options, record, storage))
    }

    pub fn with_storage(options: AttachmentOptions, record: RecordRef, storage: RemoteStorage) -> Self {
        Self {
            options,
            record,
            file: None,
            queued_for_write: WriteQueue::new(),
            queued_for_delete: DeleteQueue::new(),
            storage,
            after_flush_writes: None,
        }
    }

    /// Point at a file that is already stored
    pub fn with_file(mut self, file: FileInfo) -> Self {
        self.file = Some(file);
        self
    }

    pub fn on_after_flush_writes<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&[String]) + Send + 'static,
    {
        self.after_flush_writes = Some(Box::new(hook));
        self
    }

    pub fn options(&self) -> &AttachmentOptions {
        &self.options
    }

    pub fn record(&self) -> &RecordRef {
        &self.record
    }

    pub fn file(&self) -> Option<&FileInfo> {
        self.file.as_ref()
    }

    pub fn storage(&self) -> &RemoteStorage {
        &self.storage
    }

    pub fn queued_for_write(&self) -> &WriteQueue {
        &self.queued_for_write
    }

    pub fn queued_for_delete(&self) -> &DeleteQueue {
        &self.queued_for_delete
    }

    /// Assign a new upload as the default style.
    ///
    /// Keys of the previously stored file are queued for deletion and any
    /// pending writes are discarded.
    pub fn assign(&mut self, filename: impl Into<String>, body: impl Into<Bytes>) {
        self.queue_all_for_delete();
        self.queued_for_write.clear();

        let upload = QueuedFile::new(filename, body);
        self.file = Some(FileInfo {
            filename: upload.original_filename.clone(),
            content_type: upload.content_type.clone(),
            size: upload.len() as u64,
            updated_at: Utc::now(),
        });

        debug!(filename = %upload.original_filename, size = upload.len(), "File assigned");
        self.queued_for_write
            .insert(self.options.default_style.clone(), upload);
    }

    /// Queue a processed rendition for upload
    pub fn queue_style(&mut self, style: impl Into<String>, file: QueuedFile) {
        self.queued_for_write.insert(style, file);
    }

    /// Storage key of a style; `None` when no file is assigned
    pub fn path(&self, style: Option<&str>) -> Option<String> {
        let style = style.unwrap_or(&self.options.default_style);
        build_path(&self.options, &self.record, self.file.as_ref(), style)
    }

    fn require_path(&self, style: Option<&str>) -> StorageResult<String> {
        self.path(style).ok_or_else(|| {
            StorageError::NoFile(style.unwrap_or(&self.options.default_style).to_string())
        })
    }

    /// Interpolated url template; `:fog_public_url` is the public URL
    pub async fn url(&mut self, style: Option<&str>) -> StorageResult<String> {
        let style = style.unwrap_or(&self.options.default_style).to_string();
        let public_url = self.public_url(Some(&style)).await?;
        let Some(ref file) = self.file else {
            return Err(StorageError::NoFile(style));
        };

        let ctx = InterpolationContext {
            record: &self.record,
            attachment: &self.options.name,
            file,
            style: &style,
        };
        Ok(interpolate_with(&self.options.storage.url, &ctx, |token| {
            (token == PUBLIC_URL_TOKEN).then(|| public_url.clone())
        }))
    }

    pub async fn public_url(&mut self, style: Option<&str>) -> StorageResult<String> {
        let key = self.require_path(style)?;
        self.storage.public_url(&key).await
    }

    #[instrument(skip(self), fields(attachment = %self.options.name))]
    pub async fn expiring_url(&mut self, ttl: Duration, style: Option<&str>) -> StorageResult<String> {
        let key = self.require_path(style)?;
        self.storage.expiring_url(&key, ttl).await
    }

    /// Time-limited URL for an arbitrary key in the directory
    #[instrument(skip(self), fields(attachment = %self.options.name))]
    pub async fn filename_expiring_url(&mut self, filename: &str, ttl: Duration) -> StorageResult<String> {
        self.storage.expiring_url(filename, ttl).await
    }

    pub async fn exists(&mut self, style: Option<&str>) -> StorageResult<bool> {
        let key = self.require_path(style)?;
        self.storage.exists(&key).await
    }

    /// Local copy of a style; a queued payload is returned without a download
    pub async fn to_file(&mut self, style: Option<&str>) -> StorageResult<LocalFile> {
        let key = self.require_path(style)?;
        let style = style.unwrap_or(&self.options.default_style);
        let queued = self.queued_for_write.get(style);
        self.storage.to_file(&key, queued).await
    }

    pub async fn copy_to_local_file(&mut self, style: Option<&str>, destination: &Path) -> StorageResult<()> {
        let key = self.require_path(style)?;
        self.storage.copy_to_local_file(&key, destination).await
    }

    /// Upload every queued style, then run the post-write hook
    pub async fn flush_writes(&mut self) -> StorageResult<Vec<String>> {
        let options = &self.options;
        let record = &self.record;
        let file = self.file.as_ref();

        let written = self
            .storage
            .flush_writes(&mut self.queued_for_write, |style| {
                build_path(options, record, file, style)
            })
            .await?;

        if let Some(ref mut hook) = self.after_flush_writes {
            hook(written.as_slice());
        }
        Ok(written)
    }

    pub async fn flush_deletes(&mut self) -> StorageResult<Vec<String>> {
        self.storage.flush_deletes(&mut self.queued_for_delete).await
    }

    /// Apply pending deletions, then pending uploads
    #[instrument(skip(self), fields(attachment = %self.options.name, record = ?self.record.id))]
    pub async fn save(&mut self) -> StorageResult<()> {
        let deleted = self.flush_deletes().await?;
        let written = self.flush_writes().await?;

        if !deleted.is_empty() || !written.is_empty() {
            info!(deleted = deleted.len(), written = written.len(), "Attachment saved");
        }
        Ok(())
    }

    /// Remove every stored style and forget the file
    #[instrument(skip(self), fields(attachment = %self.options.name, record = ?self.record.id))]
    pub async fn destroy(&mut self) -> StorageResult<()> {
        self.queue_all_for_delete();
        self.queued_for_write.clear();
        self.file = None;

        let deleted = self.flush_deletes().await?;
        info!(deleted = deleted.len(), "Attachment destroyed");
        Ok(())
    }

    fn queue_all_for_delete(&mut self) {
        let Some(ref file) = self.file else {
            return;
        };

        for style in self.options.all_styles() {
            if let Some(key) = build_path(&self.options, &self.record, Some(file), style) {
                self.queued_for_delete.push(key);
            }
        }
    }
}

fn build_path(
    options: &AttachmentOptions,
    record: &RecordRef,
    file: Option<&FileInfo>,
    style: &str,
) -> Option<String> {
    let file = file?;
    let ctx = InterpolationContext {
        record,
        attachment: &options.name,
        file,
        style,
    };
    Some(interpolate(&options.storage.path, &ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::provider::{MemoryCall, MemoryConnector};
    use fb_core::{PublicSetting, StorageConfig};
    use serde_json::json;

    fn storage_config() -> StorageConfig {
        StorageConfig {
            path: ":class/:attachment/:id/:style/:filename".to_string(),
            directory: "uploads".to_string(),
            credentials: Some(json!({ "provider": "Memory" })),
            ..Default::default()
        }
    }

    fn attachment(connector: &MemoryConnector, config: StorageConfig) -> Attachment {
        let options = AttachmentOptions::new("avatars", config.clone()).styles(["thumb"]);
        let storage =
            RemoteStorage::with_connector(config, "test", Arc::new(connector.clone())).unwrap();
        Attachment::with_storage(options, RecordRef::new("users", 7), storage)
    }

    #[test]
    fn test_path_requires_file() {
        let connector = MemoryConnector::new();
        let mut attachment = attachment(&connector, storage_config());
        assert_eq!(attachment.path(None), None);

        attachment.assign("me.png", "png");
        assert_eq!(
            attachment.path(None).as_deref(),
            Some("users/avatars/7/original/me.png")
        );
        assert_eq!(
            attachment.path(Some("thumb")).as_deref(),
            Some("users/avatars/7/thumb/me.png")
        );
    }

    #[tokio::test]
    async fn test_save_uploads_queued_styles_and_runs_hook() {
        let connector = MemoryConnector::new().with_directory("uploads");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = seen.clone();
        let mut attachment = attachment(&connector, storage_config())
            .on_after_flush_writes(move |keys| hook_seen.lock().unwrap().extend_from_slice(keys));

        attachment.assign("me.png", "original");
        attachment.queue_style("thumb", QueuedFile::new("me.png", "small"));
        attachment.save().await.unwrap();

        assert!(attachment.queued_for_write().is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "users/avatars/7/original/me.png".to_string(),
                "users/avatars/7/thumb/me.png".to_string(),
            ]
        );
        assert_eq!(
            connector
                .object("uploads", "users/avatars/7/thumb/me.png")
                .unwrap()
                .body,
            Bytes::from("small")
        );
    }

    #[tokio::test]
    async fn test_save_with_nothing_queued_makes_no_calls() {
        let connector = MemoryConnector::new();
        let mut attachment = attachment(&connector, storage_config());

        attachment.save().await.unwrap();
        assert!(connector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reassign_deletes_previous_keys_before_writing() {
        let connector = MemoryConnector::new().with_directory("uploads");
        let mut attachment = attachment(&connector, storage_config());
        attachment.assign("old.png", "old");
        attachment.save().await.unwrap();
        connector.clear_calls();

        attachment.assign("new.png", "new");
        attachment.save().await.unwrap();

        assert_eq!(
            connector.calls(),
            vec![
                MemoryCall::Destroy("users/avatars/7/original/old.png".to_string()),
                MemoryCall::Destroy("users/avatars/7/thumb/old.png".to_string()),
                MemoryCall::Create("users/avatars/7/original/new.png".to_string()),
            ]
        );
        assert!(connector
            .object("uploads", "users/avatars/7/original/old.png")
            .is_none());
        assert!(attachment.queued_for_delete().is_empty());
    }

    #[tokio::test]
    async fn test_per_style_visibility() {
        let connector = MemoryConnector::new().with_directory("uploads");
        let mut config = storage_config();
        config.public = PublicSetting::PerStyle(
            [("original".to_string(), false)].into_iter().collect(),
        );
        let mut attachment = attachment(&connector, config);

        attachment.assign("me.png", "original");
        attachment.queue_style("thumb", QueuedFile::new("me.png", "small"));
        attachment.save().await.unwrap();

        assert!(!connector
            .object("uploads", "users/avatars/7/original/me.png")
            .unwrap()
            .public);
        assert!(connector
            .object("uploads", "users/avatars/7/thumb/me.png")
            .unwrap()
            .public);
    }

    #[tokio::test]
    async fn test_url_interpolates_public_url() {
        let connector = MemoryConnector::new();
        let mut config = storage_config();
        config.url = ":fog_public_url?style=:style".to_string();
        let mut attachment = attachment(&connector, config);
        attachment.assign("me.png", "png");

        assert_eq!(
            attachment.url(Some("thumb")).await.unwrap(),
            "memory://uploads/users/avatars/7/thumb/me.png?style=thumb"
        );
    }

    #[tokio::test]
    async fn test_url_without_file() {
        let connector = MemoryConnector::new();
        let mut attachment = attachment(&connector, storage_config());

        let result = attachment.url(None).await;
        assert!(matches!(result, Err(StorageError::NoFile(ref style)) if style == "original"));
    }

    #[tokio::test]
    async fn test_filename_expiring_url_uses_the_same_branch() {
        let connector = MemoryConnector::new();
        let mut attachment = attachment(&connector, storage_config());
        attachment.assign("me.png", "png");

        let by_style = attachment
            .expiring_url(Duration::from_secs(60), None)
            .await
            .unwrap();
        let by_name = attachment
            .filename_expiring_url("exports/report.csv", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(by_style.starts_with("memory://uploads/users/avatars/7/original/me.png?expires="));
        assert!(by_name.starts_with("memory://uploads/exports/report.csv?expires="));
    }

    #[tokio::test]
    async fn test_to_file_for_queued_style_skips_provider() {
        let connector = MemoryConnector::new();
        let mut attachment = attachment(&connector, storage_config());
        attachment.assign("me.png", "pending");

        let file = attachment.to_file(None).await.unwrap();

        assert_eq!(file.bytes().await.unwrap(), Bytes::from("pending"));
        assert!(connector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_exists_and_copy_after_save() {
        let connector = MemoryConnector::new().with_directory("uploads");
        let mut attachment = attachment(&connector, storage_config());
        attachment.assign("me.txt", "hello");
        attachment.save().await.unwrap();

        assert!(attachment.exists(None).await.unwrap());
        assert!(!attachment.exists(Some("thumb")).await.unwrap());

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("me.txt");
        attachment
            .copy_to_local_file(None, &destination)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_destroy_removes_every_style() {
        let connector = MemoryConnector::new().with_directory("uploads");
        let mut attachment = attachment(&connector, storage_config());
        attachment.assign("me.png", "original");
        attachment.queue_style("thumb", QueuedFile::new("me.png", "small"));
        attachment.save().await.unwrap();

        attachment.destroy().await.unwrap();

        assert!(attachment.file().is_none());
        assert!(connector
            .object("uploads", "users/avatars/7/original/me.png")
            .is_none());
        assert!(connector
            .object("uploads", "users/avatars/7/thumb/me.png")
            .is_none());
    }

    #[tokio::test]
    async fn test_destroy_removes_custom_default_style() {
        let connector = MemoryConnector::new().with_directory("uploads");
        let mut options = AttachmentOptions::new("avatars", storage_config()).styles(["thumb"]);
        options.default_style = "large".to_string();
        let storage =
            RemoteStorage::with_connector(storage_config(), "test", Arc::new(connector.clone()))
                .unwrap();
        let mut attachment = Attachment::with_storage(options, RecordRef::new("users", 7), storage);

        attachment.assign("me.png", "large");
        attachment.save().await.unwrap();
        assert!(connector
            .object("uploads", "users/avatars/7/large/me.png")
            .is_some());

        attachment.destroy().await.unwrap();

        assert!(connector
            .object("uploads", "users/avatars/7/large/me.png")
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_queue_and_skips_hook() {
        let connector = MemoryConnector::new().ignore_directory_creation();
        let calls = Arc::new(Mutex::new(0));
        let hook_calls = calls.clone();
        let mut attachment = attachment(&connector, storage_config())
            .on_after_flush_writes(move |_| *hook_calls.lock().unwrap() += 1);
        attachment.assign("me.png", "png");

        let result = attachment.save().await;

        assert!(matches!(result, Err(StorageError::DirectoryMissing { .. })));
        assert_eq!(attachment.queued_for_write().len(), 1);
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
