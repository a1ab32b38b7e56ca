//! # fb-attachments
//!
//! Remote object storage for file attachments.
//!
//! ## Features
//!
//! - Credential resolution (inline map, credentials file, open file handle)
//! - Provider abstraction (AWS S3 via `aws-sdk-s3`, local filesystem, memory)
//! - Write/delete queues flushed on save, with one create-directory retry
//! - Public, provider-signed and CloudFront-signed URLs
//!
//! ## Example
//!
//! ```rust,ignore
//! use fb_attachments::{Attachment, AttachmentOptions, RecordRef};
//! use std::time::Duration;
//!
//! let options = AttachmentOptions::new("avatars", config.storage.clone()).styles(["thumb"]);
//! let mut avatar = Attachment::new(options, RecordRef::new("users", 42), &config.environment)?;
//!
//! avatar.assign("me.png", bytes);
//! avatar.save().await?;
//!
//! let url = avatar.expiring_url(Duration::from_secs(300), Some("thumb")).await?;
//! ```

pub mod attachment;
pub mod cloudfront;
pub mod credentials;
pub mod interpolation;
pub mod model;
pub mod provider;
pub mod storage;

pub use attachment::{AfterFlushWrites, Attachment, PUBLIC_URL_TOKEN};
pub use cloudfront::{CloudFrontSigner, SignedUrlGrant, SigningError};
pub use credentials::{expand_template, CredentialSource, Credentials};
pub use interpolation::{id_partition, interpolate, interpolate_with, InterpolationContext};
pub use model::{
    AttachmentOptions, DeleteQueue, FileInfo, QueuedFile, RecordId, RecordRef, WriteQueue,
    ORIGINAL_STYLE,
};
pub use provider::{
    Connection, Connector, DefaultConnector, Directory, NewObject, ObjectMeta, ProviderError,
    ProviderResult,
};
#[cfg(any(test, feature = "testing"))]
pub use provider::MemoryConnector;
pub use storage::{
    expiry_after, host_for_key, shard_for_key, LocalFile, RemoteStorage, StorageError, StorageResult,
    HOST_SHARDS,
};
