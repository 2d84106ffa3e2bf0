/// Disk-based object storage backend
use crate::{
    error::{HubError, HubResult},
    object_store::{
        validate_bucket, validate_path, ListOptions, ObjectMetadata, ObjectStore, StoredObject,
        UploadOptions,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Disk storage backend
///
/// Stores objects at `{base}/{bucket}/{path}` and serves them under
/// `{public_url}/storage/{bucket}/{path}`. Signed URLs carry an expiry and
/// an HMAC-SHA256 token over `bucket/path:expires`.
#[derive(Clone)]
pub struct DiskObjectStore {
    base_path: PathBuf,
    public_url: String,
    signing_secret: String,
}

impl DiskObjectStore {
    /// Create a new disk storage backend
    pub fn new(base_path: PathBuf, public_url: impl Into<String>, signing_secret: impl Into<String>) -> Self {
        Self {
            base_path,
            public_url: public_url.into().trim_end_matches('/').to_string(),
            signing_secret: signing_secret.into(),
        }
    }

    /// Get the file path for an object
    fn object_path(&self, bucket: &str, path: &str) -> HubResult<PathBuf> {
        validate_bucket(bucket)?;
        validate_path(path)?;
        Ok(self.base_path.join(bucket).join(path))
    }

    fn sign(&self, bucket: &str, path: &str, expires: i64) -> HubResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .map_err(|e| HubError::Internal(format!("Invalid signing key: {}", e)))?;
        mac.update(format!("{}/{}:{}", bucket, path, expires).as_bytes());
        Ok(mac)
    }

    /// Check a signed URL's token against its expiry
    pub fn verify_signature(&self, bucket: &str, path: &str, expires: i64, token: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(expected) = hex::decode(token) else {
            return false;
        };
        match self.sign(bucket, path, expires) {
            Ok(mac) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }

    fn encoded_path(path: &str) -> String {
        path.split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[async_trait]
impl ObjectStore for DiskObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Vec<u8>,
        options: UploadOptions,
    ) -> HubResult<StoredObject> {
        let object_path = self.object_path(bucket, path)?;
        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let etag = hex::encode(Sha256::digest(&data));
        let size = data.len() as u64;

        if options.upsert {
            fs::write(&object_path, &data).await?;
        } else {
            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&object_path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(HubError::Constraint(format!(
                        "Object {}/{} already exists",
                        bucket, path
                    )));
                }
                Err(e) => return Err(e.into()),
            };
            file.write_all(&data).await?;
            file.flush().await?;
        }

        debug!(bucket, path, size, "Stored object");

        Ok(StoredObject {
            bucket: bucket.to_string(),
            path: path.to_string(),
            size,
            content_type: options
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            etag,
        })
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/{}/{}",
            self.public_url,
            bucket,
            Self::encoded_path(path)
        )
    }

    async fn signed_url(&self, bucket: &str, path: &str, ttl_secs: u64) -> HubResult<String> {
        let object_path = self.object_path(bucket, path)?;
        if fs::metadata(&object_path).await.is_err() {
            return Err(HubError::NotFound(format!("Object {}/{} not found", bucket, path)));
        }

        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX / 2);
        let expires = Utc::now().timestamp().saturating_add(ttl);
        let token = hex::encode(self.sign(bucket, path, expires)?.finalize().into_bytes());

        Ok(format!(
            "{}?expires={}&token={}",
            self.public_url(bucket, path),
            expires,
            token
        ))
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> HubResult<()> {
        for path in paths {
            let object_path = self.object_path(bucket, path)?;
            match fs::remove_file(&object_path).await {
                Ok(()) => debug!(bucket, path = %path, "Removed object"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        options: ListOptions,
    ) -> HubResult<Vec<ObjectMetadata>> {
        validate_bucket(bucket)?;
        let prefix = prefix.trim_matches('/');
        let dir = if prefix.is_empty() {
            self.base_path.join(bucket)
        } else {
            validate_path(prefix)?;
            self.base_path.join(bucket).join(prefix)
        };

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            objects.push(ObjectMetadata {
                name,
                path,
                size: metadata.len(),
                last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .collect())
    }
}
