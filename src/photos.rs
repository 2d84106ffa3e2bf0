/// Event photos
///
/// Photo rows are created by the upload pipeline after the binary is
/// durable in the object store. Derived counters (people, downloads) are
/// mutated by downstream match and download activity.
use crate::{
    error::{HubError, HubResult},
    matching::{
        verification::{adjust_matches_found, withdraw_photo_matches},
        CandidateStatus, MatchCandidate,
    },
    object_store::ObjectStore,
    store::{self, patch, tables, timestamp, Direction, Filter, Query, Record, RecordStore},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: String,
    pub event_id: String,
    /// Public object store URL
    pub url: String,
    pub bucket: String,
    pub storage_path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, with = "timestamp::option")]
    pub taken_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub people_count: i64,
    #[serde(default)]
    pub download_count: i64,
    pub is_public: bool,
    pub file_size: i64,
    pub mime_type: String,
    #[serde(default)]
    pub uploaded_by: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Record for Photo {
    const TABLE: &'static str = tables::PHOTOS;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Fields supplied when registering an uploaded photo
#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub event_id: String,
    pub url: String,
    pub bucket: String,
    pub storage_path: String,
    pub title: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub is_public: bool,
    pub file_size: i64,
    pub mime_type: String,
    pub uploaded_by: Option<String>,
}

/// What an operator delete removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhotoDeletion {
    pub candidates_removed: u64,
    pub queue_entries_removed: u64,
}

/// Photo record management
#[derive(Clone)]
pub struct PhotoManager {
    store: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
}

impl PhotoManager {
    pub fn new(store: Arc<dyn RecordStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { store, objects }
    }

    pub async fn create(&self, photo: NewPhoto) -> HubResult<Photo> {
        if photo.event_id.is_empty() {
            return Err(HubError::Validation("Photo must belong to an event".to_string()));
        }
        if photo.url.is_empty() {
            return Err(HubError::Validation("Photo URL is required".to_string()));
        }

        let mut tags = photo.tags;
        tags.sort();
        tags.dedup();

        let record = Photo {
            id: Uuid::new_v4().to_string(),
            event_id: photo.event_id,
            url: photo.url,
            bucket: photo.bucket,
            storage_path: photo.storage_path,
            title: photo.title,
            taken_at: photo.taken_at,
            tags,
            people_count: 0,
            download_count: 0,
            is_public: photo.is_public,
            file_size: photo.file_size,
            mime_type: photo.mime_type,
            uploaded_by: photo.uploaded_by,
            created_at: timestamp::now(),
        };
        store::insert(self.store.as_ref(), &record).await
    }

    pub async fn get(&self, id: &str) -> HubResult<Photo> {
        store::fetch(self.store.as_ref(), id).await
    }

    /// Photos of an event, newest first
    pub async fn list_for_event(&self, event_id: &str, public_only: bool) -> HubResult<Vec<Photo>> {
        let mut filter = Filter::new().eq("event_id", event_id);
        if public_only {
            filter = filter.eq("is_public", true);
        }
        let query = Query::filtered(filter).order_by("created_at", Direction::Desc);
        store::select(self.store.as_ref(), &query).await
    }

    pub async fn record_download(&self, id: &str) -> HubResult<Photo> {
        let row = self
            .store
            .increment(tables::PHOTOS, id, "download_count", 1)
            .await?;
        store::from_row(row)
    }

    pub async fn set_people_count(&self, id: &str, count: i64) -> HubResult<Photo> {
        if count < 0 {
            return Err(HubError::Validation("People count cannot be negative".to_string()));
        }
        let row = self
            .store
            .update(tables::PHOTOS, id, patch(json!({ "people_count": count })))
            .await?;
        store::from_row(row)
    }

    /// Operator delete: removes match candidates, queue entries, the photo
    /// row and finally the stored object
    ///
    /// Verified matches are withdrawn first so every attendee's
    /// `matches_found` drops with them.
    pub async fn delete_photo(&self, id: &str) -> HubResult<PhotoDeletion> {
        let photo = self.get(id).await?;
        let by_photo = Filter::new().eq("photo_id", id);

        let matches_withdrawn = withdraw_photo_matches(self.store.as_ref(), id).await?;
        let candidates = self
            .store
            .delete_where(tables::MATCH_CANDIDATES, &by_photo)
            .await?;
        // Verified after the withdrawal but before the delete
        for row in candidates.iter().cloned() {
            match store::from_row::<MatchCandidate>(row) {
                Ok(candidate) if candidate.disposition() == CandidateStatus::Verified => {
                    adjust_matches_found(self.store.as_ref(), &candidate.user_id, -1).await?;
                }
                Ok(_) => {}
                Err(e) => warn!(photo_id = %id, error = %e, "Skipping undecodable match candidate"),
            }
        }
        let queue_entries_removed = self
            .store
            .delete_where(tables::MATCH_QUEUE, &by_photo)
            .await?
            .len() as u64;
        self.store.delete(tables::PHOTOS, id).await?;
        let candidates_removed = candidates.len() as u64;

        if let Err(e) = self
            .objects
            .remove(&photo.bucket, &[photo.storage_path.clone()])
            .await
        {
            warn!(photo_id = %id, path = %photo.storage_path, error = %e, "Failed to remove photo object");
        }

        info!(
            photo_id = %id,
            candidates_removed,
            matches_withdrawn,
            queue_entries_removed,
            "Deleted photo"
        );

        Ok(PhotoDeletion {
            candidates_removed,
            queue_entries_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::matching::MatchVerifier;
    use crate::notify::{FanOut, Notifier};
    use crate::object_store::{buckets, DiskObjectStore, ListOptions, UploadOptions};
    use crate::store::SqliteRecordStore;
    use tempfile::tempdir;

    fn new_photo(event_id: &str, path: &str, is_public: bool) -> NewPhoto {
        NewPhoto {
            event_id: event_id.to_string(),
            url: format!("http://localhost/storage/event-photos/{}", path),
            bucket: buckets::EVENT_PHOTOS.to_string(),
            storage_path: path.to_string(),
            title: None,
            taken_at: None,
            tags: vec!["b".to_string(), "a".to_string(), "a".to_string()],
            is_public,
            file_size: 3,
            mime_type: "image/jpeg".to_string(),
            uploaded_by: None,
        }
    }

    async fn setup(dir: &std::path::Path) -> (PhotoManager, Arc<SqliteRecordStore>, Arc<DiskObjectStore>) {
        let store = Arc::new(SqliteRecordStore::new(db::connect_in_memory().await.unwrap()));
        let objects = Arc::new(DiskObjectStore::new(
            dir.to_path_buf(),
            "http://localhost",
            "0123456789abcdef0123456789abcdef",
        ));
        (
            PhotoManager::new(store.clone(), objects.clone()),
            store,
            objects,
        )
    }

    #[tokio::test]
    async fn test_create_and_list_public() {
        let dir = tempdir().unwrap();
        let (photos, _, _) = setup(dir.path()).await;

        let public = photos.create(new_photo("e1", "e1/a.jpg", true)).await.unwrap();
        photos.create(new_photo("e1", "e1/b.jpg", false)).await.unwrap();
        photos.create(new_photo("e2", "e2/c.jpg", true)).await.unwrap();

        assert_eq!(public.tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(photos.list_for_event("e1", false).await.unwrap().len(), 2);

        let visible = photos.list_for_event("e1", true).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, public.id);
    }

    #[tokio::test]
    async fn test_counters() {
        let dir = tempdir().unwrap();
        let (photos, _, _) = setup(dir.path()).await;
        let photo = photos.create(new_photo("e1", "e1/a.jpg", true)).await.unwrap();

        photos.record_download(&photo.id).await.unwrap();
        let photo = photos.record_download(&photo.id).await.unwrap();
        assert_eq!(photo.download_count, 2);

        let photo = photos.set_people_count(&photo.id, 4).await.unwrap();
        assert_eq!(photo.people_count, 4);
        assert!(photos.set_people_count(&photo.id, -1).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_photo_cascades() {
        let dir = tempdir().unwrap();
        let (photos, store, objects) = setup(dir.path()).await;

        objects
            .upload(buckets::EVENT_PHOTOS, "e1/a.jpg", b"abc".to_vec(), UploadOptions::default())
            .await
            .unwrap();
        let photo = photos.create(new_photo("e1", "e1/a.jpg", true)).await.unwrap();

        store
            .insert(
                tables::MATCH_CANDIDATES,
                patch(json!({"photo_id": photo.id, "user_id": "u1", "confidence_score": 0.7})),
            )
            .await
            .unwrap();
        store
            .insert(
                tables::MATCH_QUEUE,
                patch(json!({"photo_id": photo.id, "status": "completed"})),
            )
            .await
            .unwrap();

        let deletion = photos.delete_photo(&photo.id).await.unwrap();
        assert_eq!(
            deletion,
            PhotoDeletion {
                candidates_removed: 1,
                queue_entries_removed: 1
            }
        );
        assert!(matches!(
            photos.get(&photo.id).await.unwrap_err(),
            HubError::NotFound(_)
        ));
        assert!(objects
            .list(buckets::EVENT_PHOTOS, "e1", ListOptions::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_photo_gives_back_verified_matches() {
        let dir = tempdir().unwrap();
        let (photos, store, _) = setup(dir.path()).await;
        let fanout = FanOut::new(Notifier::new(store.clone(), 30));
        let verifier = MatchVerifier::new(store.clone(), fanout);
        let photo = photos.create(new_photo("e1", "e1/a.jpg", true)).await.unwrap();

        store
            .insert(
                tables::EVENT_USERS,
                patch(json!({"id": "u1", "event_id": "e1", "matches_found": 0})),
            )
            .await
            .unwrap();
        for (id, user) in [("c1", "u1"), ("c2", "u2")] {
            store
                .insert(
                    tables::MATCH_CANDIDATES,
                    patch(json!({"id": id, "photo_id": photo.id, "user_id": user,
                                 "confidence_score": 0.9})),
                )
                .await
                .unwrap();
        }
        verifier.verify("c1", "op-1").await.unwrap();

        let deletion = photos.delete_photo(&photo.id).await.unwrap();
        assert_eq!(deletion.candidates_removed, 2);

        let user = store.get(tables::EVENT_USERS, "u1").await.unwrap().unwrap();
        assert_eq!(user.get("matches_found"), Some(&json!(0)));
        assert_eq!(
            store
                .count(tables::MATCH_CANDIDATES, &Filter::new().eq("photo_id", photo.id.as_str()))
                .await
                .unwrap(),
            0
        );
    }
}
