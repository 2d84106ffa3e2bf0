/// Upload pipeline
///
/// Validates files locally, optionally recompresses images, writes the
/// binary to the object store and then creates the record that points at
/// it. A record failure removes the just-uploaded object again.

pub mod compress;
pub mod validation;

pub use validation::{validate_batch_size, validate_file, UploadConstraints};

use crate::{
    config::UploadConfig,
    error::{HubError, HubResult},
    events::EventManager,
    matching::{MatchQueue, MatchQueueEntry},
    metrics,
    object_store::{buckets, extension_for, ObjectStore, UploadOptions},
    photos::{NewPhoto, Photo, PhotoManager},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A file selected for upload
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// Result of a single successful upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub url: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub bucket: String,
    pub path: String,
}

/// Metadata applied to event photos
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PhotoUploadOptions {
    pub title: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub is_public: bool,
    /// Event user credited with the upload
    pub uploaded_by: Option<String>,
    /// Match queue priority, default from configuration when absent
    pub priority: Option<i32>,
}

impl Default for PhotoUploadOptions {
    fn default() -> Self {
        Self {
            title: None,
            taken_at: None,
            tags: Vec::new(),
            is_public: true,
            uploaded_by: None,
            priority: None,
        }
    }
}

/// An uploaded event photo
#[derive(Debug, Clone)]
pub struct PhotoUpload {
    pub photo: Photo,
    pub file: UploadedFile,
    /// `None` when queueing for face matching failed
    pub queue_entry: Option<MatchQueueEntry>,
}

/// Per-item outcome of a batch upload
#[derive(Debug)]
pub struct BatchItemResult {
    pub index: usize,
    pub name: String,
    pub outcome: HubResult<PhotoUpload>,
}

impl BatchItemResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Coordinates object writes with photo records and the match queue
#[derive(Clone)]
pub struct UploadPipeline {
    objects: Arc<dyn ObjectStore>,
    photos: PhotoManager,
    events: EventManager,
    queue: MatchQueue,
    config: UploadConfig,
}

impl UploadPipeline {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        photos: PhotoManager,
        events: EventManager,
        queue: MatchQueue,
        config: UploadConfig,
    ) -> Self {
        Self {
            objects,
            photos,
            events,
            queue,
            config,
        }
    }

    pub fn event_photo_constraints(&self) -> UploadConstraints {
        UploadConstraints::event_photos(&self.config)
    }

    /// Validate, compress and store one file at `(bucket, path)`
    pub async fn upload(
        &self,
        file: UploadFile,
        bucket: &str,
        path: &str,
        constraints: &UploadConstraints,
        cancel: &CancellationToken,
    ) -> HubResult<UploadedFile> {
        validate_file(&file, constraints)?;
        let file = self.prepare(file, constraints, cancel).await?;
        self.store_object(file, bucket, path, cancel).await
    }

    /// Upload a photo into an event, create its record and queue it for
    /// face matching
    pub async fn upload_event_photo(
        &self,
        event_id: &str,
        file: UploadFile,
        options: PhotoUploadOptions,
        cancel: &CancellationToken,
    ) -> HubResult<PhotoUpload> {
        let constraints = self.event_photo_constraints();
        validate_file(&file, &constraints)?;

        if cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }
        self.events.get_event(event_id).await?;

        let file = self.prepare(file, &constraints, cancel).await?;
        let path = format!(
            "{}/{}.{}",
            event_id,
            Uuid::new_v4(),
            extension_for(&file.mime_type)
        );
        let uploaded = self
            .store_object(file, buckets::EVENT_PHOTOS, &path, cancel)
            .await?;

        let new_photo = NewPhoto {
            event_id: event_id.to_string(),
            url: uploaded.url.clone(),
            bucket: uploaded.bucket.clone(),
            storage_path: uploaded.path.clone(),
            title: options.title.clone(),
            taken_at: options.taken_at,
            tags: options.tags.clone(),
            is_public: options.is_public,
            file_size: uploaded.size as i64,
            mime_type: uploaded.mime_type.clone(),
            uploaded_by: options.uploaded_by.clone(),
        };

        let photo = match self.photos.create(new_photo).await {
            Ok(photo) => photo,
            Err(e) => {
                warn!(path = %uploaded.path, error = %e, "Photo record failed, removing uploaded object");
                if let Err(remove_err) = self
                    .objects
                    .remove(&uploaded.bucket, &[uploaded.path.clone()])
                    .await
                {
                    warn!(path = %uploaded.path, error = %remove_err, "Failed to remove orphaned object");
                }
                metrics::record_upload(&uploaded.bucket, "record_failed", 0);
                return Err(e);
            }
        };

        // Queueing is best-effort; the photo stays uploaded either way
        let queue_entry = match self
            .queue
            .enqueue(&photo.id, options.priority, options.uploaded_by.as_deref())
            .await
        {
            Ok(enqueued) => Some(enqueued.entry),
            Err(e) => {
                warn!(photo_id = %photo.id, error = %e, "Failed to queue photo for face matching");
                None
            }
        };

        if let Some(uploader) = options.uploaded_by.as_deref() {
            if let Err(e) = self.events.record_photo_uploaded(uploader).await {
                warn!(uploader, error = %e, "Failed to update uploader photo count");
            }
        }

        info!(event_id, photo_id = %photo.id, size = uploaded.size, "Uploaded event photo");

        Ok(PhotoUpload {
            photo,
            file: uploaded,
            queue_entry,
        })
    }

    /// Upload several photos; one failure does not stop the rest
    ///
    /// The file count is checked before anything is sent. Once `cancel`
    /// fires, the remaining items report `Cancelled`.
    pub async fn upload_event_photos(
        &self,
        event_id: &str,
        files: Vec<UploadFile>,
        options: PhotoUploadOptions,
        cancel: &CancellationToken,
    ) -> HubResult<Vec<BatchItemResult>> {
        validate_batch_size(files.len(), &self.event_photo_constraints())?;

        let mut results = Vec::with_capacity(files.len());
        for (index, file) in files.into_iter().enumerate() {
            let name = file.name.clone();
            let outcome = if cancel.is_cancelled() {
                Err(HubError::Cancelled)
            } else {
                self.upload_event_photo(event_id, file, options.clone(), cancel)
                    .await
            };

            if let Err(e) = &outcome {
                warn!(event_id, index, name = %name, error = %e, "Batch item failed");
            }
            results.push(BatchItemResult {
                index,
                name,
                outcome,
            });
        }

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        info!(
            event_id,
            succeeded,
            failed = results.len() - succeeded,
            "Batch upload finished"
        );
        Ok(results)
    }

    async fn prepare(
        &self,
        file: UploadFile,
        constraints: &UploadConstraints,
        cancel: &CancellationToken,
    ) -> HubResult<UploadFile> {
        if !constraints.compress
            || !self.config.compress_images
            || !compress::is_compressible(&file.mime_type)
        {
            return Ok(file);
        }

        let max_dimension = self.config.max_image_dimension;
        let quality = self.config.jpeg_quality;
        let data = file.data.clone();
        let mime_type = file.mime_type.clone();
        let task = tokio::task::spawn_blocking(move || {
            compress::compress_image(&data, &mime_type, max_dimension, quality)
        });

        let compressed = tokio::select! {
            _ = cancel.cancelled() => return Err(HubError::Cancelled),
            joined = task => joined.map_err(|e| HubError::Internal(format!("Compression task failed: {}", e)))?,
        };

        match compressed {
            Some(compressed) => {
                debug!(
                    name = %file.name,
                    before = file.data.len(),
                    after = compressed.data.len(),
                    "Compressed image"
                );
                Ok(UploadFile {
                    name: file.name,
                    mime_type: compressed.mime_type,
                    data: compressed.data,
                })
            }
            None => Ok(file),
        }
    }

    async fn store_object(
        &self,
        file: UploadFile,
        bucket: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> HubResult<UploadedFile> {
        if cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }

        let size = file.data.len() as u64;
        let options = UploadOptions {
            content_type: Some(file.mime_type.clone()),
            ..UploadOptions::default()
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.objects.upload(bucket, path, file.data, options) => Some(result),
        };

        let stored = match result {
            Some(Ok(stored)) => stored,
            Some(Err(e)) => {
                metrics::record_upload(bucket, "failed", 0);
                return Err(e);
            }
            None => {
                // The write may have partially landed
                if let Err(e) = self.objects.remove(bucket, &[path.to_string()]).await {
                    debug!(bucket, path, error = %e, "Cleanup after cancelled upload failed");
                }
                metrics::record_upload(bucket, "cancelled", 0);
                return Err(HubError::Cancelled);
            }
        };

        metrics::record_upload(bucket, "success", size);
        Ok(UploadedFile {
            url: self.objects.public_url(bucket, path),
            name: file.name,
            size: stored.size,
            mime_type: stored.content_type,
            bucket: stored.bucket,
            path: stored.path,
        })
    }
}
