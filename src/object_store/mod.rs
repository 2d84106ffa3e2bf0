/// Object Store
///
/// Path-addressed binary storage for uploaded photos and files. Objects live
/// under `(bucket, path)`; callers resolve public or time-limited signed URLs
/// for delivery. Supports multiple backend implementations behind the
/// [`ObjectStore`] trait.

pub mod disk;

pub use disk::DiskObjectStore;

use crate::error::{HubError, HubResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known buckets
pub mod buckets {
    pub const EVENT_PHOTOS: &str = "event-photos";
    pub const AVATARS: &str = "avatars";
    pub const DOCUMENTS: &str = "documents";
    pub const CHAT_ATTACHMENTS: &str = "chat-attachments";
}

/// Options for a single upload
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    /// Overwrite an existing object instead of failing
    pub upsert: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            content_type: None,
            cache_control: Some("3600".to_string()),
            upsert: false,
        }
    }
}

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub bucket: String,
    pub path: String,
    pub size: u64,
    pub content_type: String,
    /// Hex SHA-256 of the stored bytes
    pub etag: String,
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Pagination for `list`
#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Object storage backend trait
///
/// Implementations handle the actual storage and retrieval of object data.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes at `(bucket, path)`
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Vec<u8>,
        options: UploadOptions,
    ) -> HubResult<StoredObject>;

    /// Public delivery URL for an object
    fn public_url(&self, bucket: &str, path: &str) -> String;

    /// Time-limited URL for a private object
    async fn signed_url(&self, bucket: &str, path: &str, ttl_secs: u64) -> HubResult<String>;

    /// Remove objects; missing paths are ignored
    async fn remove(&self, bucket: &str, paths: &[String]) -> HubResult<()>;

    /// List objects directly under `prefix`, sorted by name
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        options: ListOptions,
    ) -> HubResult<Vec<ObjectMetadata>>;
}

/// Bucket names are lowercase alphanumerics and `-`
pub fn validate_bucket(bucket: &str) -> HubResult<()> {
    let valid = !bucket.is_empty()
        && bucket
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(HubError::Validation(format!("Invalid bucket name: {:?}", bucket)))
    }
}

/// Object paths are relative, `/`-separated, with no empty or `..` segments
pub fn validate_path(path: &str) -> HubResult<()> {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return Err(HubError::Validation(format!("Invalid object path: {:?}", path)));
    }
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(HubError::Validation(format!("Invalid object path: {:?}", path)));
    }
    Ok(())
}

/// Extension for a MIME type, used when naming uploaded objects
pub fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/heic" => "heic",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        _ => "bin",
    }
}
