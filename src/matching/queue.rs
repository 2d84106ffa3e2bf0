/// Match Queue Coordinator
///
/// Requests face detection for photos. Claiming and status transitions
/// belong to the external detection capability; this side only creates
/// entries and reads the backlog.
///
/// Ordering of the backlog is strict priority, then FIFO within a priority
/// band. Low priorities can starve under sustained high-priority load.
use crate::{
    error::{HubError, HubResult},
    matching::{MatchQueueEntry, QueueStats, QueueStatus},
    metrics,
    store::{self, tables, timestamp, to_row, Direction, Filter, Query, RecordStore},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Priority bump applied by `reprocess` over the default
const REPROCESS_PRIORITY_BUMP: i32 = 5;

/// Outcome of an enqueue request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enqueued {
    pub entry: MatchQueueEntry,
    /// False when an active entry already existed for the photo
    pub created: bool,
}

/// Face-match queue
#[derive(Clone)]
pub struct MatchQueue {
    store: Arc<dyn RecordStore>,
    default_priority: i32,
    pending_limit: i64,
}

impl MatchQueue {
    pub fn new(store: Arc<dyn RecordStore>, default_priority: i32, pending_limit: i64) -> Self {
        Self {
            store,
            default_priority,
            pending_limit: pending_limit.max(1),
        }
    }

    pub fn default_priority(&self) -> i32 {
        self.default_priority
    }

    fn active_filter(photo_id: &str) -> Filter {
        Filter::new()
            .eq("photo_id", photo_id)
            .is_in("status", QueueStatus::ACTIVE.iter().map(|s| s.as_str()))
    }

    /// Queue a photo for face detection
    ///
    /// At most one pending or processing entry exists per photo; a second
    /// request returns the active entry unchanged.
    pub async fn enqueue(
        &self,
        photo_id: &str,
        priority: Option<i32>,
        requested_by: Option<&str>,
    ) -> HubResult<Enqueued> {
        let priority = priority.unwrap_or(self.default_priority);
        if photo_id.trim().is_empty() {
            return Err(HubError::Validation("Photo id is required".to_string()));
        }
        if priority < 0 {
            return Err(HubError::Validation("Priority cannot be negative".to_string()));
        }

        if self.store.get(tables::PHOTOS, photo_id).await?.is_none() {
            return Err(HubError::NotFound(format!("Photo {} not found", photo_id)));
        }

        // An active entry can finish between the conflict and the lookup;
        // the second attempt then inserts normally.
        for _ in 0..2 {
            let entry = MatchQueueEntry {
                id: Uuid::new_v4().to_string(),
                photo_id: photo_id.to_string(),
                priority,
                status: QueueStatus::Pending,
                requested_by: requested_by.map(str::to_string),
                created_at: timestamp::now(),
            };

            match self
                .store
                .insert_unique(tables::MATCH_QUEUE, to_row(&entry)?, &Self::active_filter(photo_id))
                .await
            {
                Ok(row) => {
                    let entry: MatchQueueEntry = store::from_row(row)?;
                    metrics::record_enqueue("created");
                    info!(photo_id, entry_id = %entry.id, priority, "Queued photo for face matching");
                    return Ok(Enqueued {
                        entry,
                        created: true,
                    });
                }
                Err(HubError::Constraint(_)) => {
                    if let Some(existing) = self.active_entry(photo_id).await? {
                        metrics::record_enqueue("existing");
                        debug!(photo_id, entry_id = %existing.id, "Photo already queued");
                        return Ok(Enqueued {
                            entry: existing,
                            created: false,
                        });
                    }
                }
                Err(e) => {
                    metrics::record_enqueue("failed");
                    return Err(e);
                }
            }
        }

        metrics::record_enqueue("failed");
        warn!(photo_id, "Queue entry for photo kept changing during enqueue");
        Err(HubError::Constraint(format!(
            "Queue entry for photo {} changed concurrently",
            photo_id
        )))
    }

    /// Manual reprocess request at a bumped priority
    pub async fn reprocess(&self, photo_id: &str, requested_by: Option<&str>) -> HubResult<Enqueued> {
        let priority = self.default_priority.saturating_add(REPROCESS_PRIORITY_BUMP);
        self.enqueue(photo_id, Some(priority), requested_by).await
    }

    pub async fn get(&self, id: &str) -> HubResult<MatchQueueEntry> {
        store::fetch(self.store.as_ref(), id).await
    }

    /// Pending and processing entries, highest priority first, oldest first
    /// within a priority
    pub async fn list_pending(&self, limit: Option<i64>) -> HubResult<Vec<MatchQueueEntry>> {
        let limit = limit.unwrap_or(self.pending_limit);
        if limit <= 0 {
            return Err(HubError::Validation("Limit must be positive".to_string()));
        }

        let query = Query::filtered(
            Filter::new().is_in("status", QueueStatus::ACTIVE.iter().map(|s| s.as_str())),
        )
        .order_by("priority", Direction::Desc)
        .order_by("created_at", Direction::Asc)
        .limit(limit);

        store::select(self.store.as_ref(), &query).await
    }

    /// Every entry ever created for a photo, newest first
    pub async fn list_for_photo(&self, photo_id: &str) -> HubResult<Vec<MatchQueueEntry>> {
        let query = Query::filtered(Filter::new().eq("photo_id", photo_id))
            .order_by("created_at", Direction::Desc);
        store::select(self.store.as_ref(), &query).await
    }

    async fn active_entry(&self, photo_id: &str) -> HubResult<Option<MatchQueueEntry>> {
        let query = Query::filtered(Self::active_filter(photo_id))
            .order_by("created_at", Direction::Asc)
            .limit(1);
        Ok(store::select(self.store.as_ref(), &query).await?.into_iter().next())
    }

    /// Entry counts per status
    pub async fn stats(&self) -> HubResult<QueueStats> {
        let count = |status: QueueStatus| {
            let store = Arc::clone(&self.store);
            async move {
                store
                    .count(tables::MATCH_QUEUE, &Filter::new().eq("status", status.as_str()))
                    .await
            }
        };

        Ok(QueueStats {
            pending: count(QueueStatus::Pending).await?,
            processing: count(QueueStatus::Processing).await?,
            completed: count(QueueStatus::Completed).await?,
            failed: count(QueueStatus::Failed).await?,
        })
    }
}
