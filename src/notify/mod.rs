/// Notifications
///
/// Notification records are plain creates against the record store; there
/// is no dedup key and no delivery confirmation. The structured payload is a
/// tagged enum and the notification `type` is always derived from it.

pub mod fanout;

pub use fanout::{Booking, Delivery, FanOut, MessageNotice};

use crate::{
    error::{HubError, HubResult},
    metrics,
    realtime::{LiveList, SyncHandle, ViewOrder, ViewSync},
    store::{self, patch, tables, timestamp, Direction, Filter, Query, Record, RecordStore},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Booking,
    Message,
    PhotoMatch,
    EventUpdate,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Booking => "booking",
            NotificationType::Message => "message",
            NotificationType::PhotoMatch => "photo_match",
            NotificationType::EventUpdate => "event_update",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Type-specific notification context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationPayload {
    Booking {
        booking_id: String,
        customer_id: String,
        photographer_id: String,
        #[serde(default)]
        event_date: Option<String>,
    },
    Message {
        chat_id: String,
        message_id: String,
        sender_id: String,
    },
    PhotoMatch {
        photo_id: String,
        #[serde(default)]
        event_id: Option<String>,
        /// Confidence as a percentage
        confidence: f64,
    },
    EventUpdate {
        event_id: String,
    },
}

impl NotificationPayload {
    pub fn notification_type(&self) -> NotificationType {
        match self {
            NotificationPayload::Booking { .. } => NotificationType::Booking,
            NotificationPayload::Message { .. } => NotificationType::Message,
            NotificationPayload::PhotoMatch { .. } => NotificationType::PhotoMatch,
            NotificationPayload::EventUpdate { .. } => NotificationType::EventUpdate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub data: NotificationPayload,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub priority: NotificationPriority,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, with = "timestamp::option")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Record for Notification {
    const TABLE: &'static str = tables::NOTIFICATIONS;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Notification create request
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub payload: NotificationPayload,
    pub action_url: Option<String>,
    pub priority: NotificationPriority,
    /// Defaults to the configured retention when absent
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewNotification {
    pub fn new(
        user_id: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        payload: NotificationPayload,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            title: title.into(),
            message: message.into(),
            payload,
            action_url: None,
            priority: NotificationPriority::Normal,
            expires_at: None,
        }
    }

    pub fn action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }

    pub fn priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// Notification store operations
#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn RecordStore>,
    default_ttl: Duration,
}

impl Notifier {
    pub fn new(store: Arc<dyn RecordStore>, default_ttl_days: i64) -> Self {
        Self {
            store,
            default_ttl: Duration::days(default_ttl_days.max(1)),
        }
    }

    /// Create one notification
    pub async fn notify(&self, request: NewNotification) -> HubResult<Notification> {
        if request.user_id.trim().is_empty() {
            return Err(HubError::Validation("Notification target user is required".to_string()));
        }
        if request.title.trim().is_empty() {
            return Err(HubError::Validation("Notification title is required".to_string()));
        }

        let now = timestamp::now();
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id,
            kind: request.payload.notification_type(),
            title: request.title,
            message: request.message,
            data: request.payload,
            action_url: request.action_url,
            priority: request.priority,
            is_read: false,
            read_at: None,
            expires_at: Some(request.expires_at.unwrap_or(now + self.default_ttl)),
            created_at: now,
        };

        let notification = store::insert(self.store.as_ref(), &notification).await?;
        metrics::record_notification(notification.kind.as_str());
        debug!(
            user_id = %notification.user_id,
            kind = notification.kind.as_str(),
            "Created notification"
        );
        Ok(notification)
    }

    pub async fn get(&self, id: &str) -> HubResult<Notification> {
        store::fetch(self.store.as_ref(), id).await
    }

    fn user_filter(user_id: &str, unread_only: bool) -> Filter {
        let filter = Filter::new().eq("user_id", user_id);
        if unread_only {
            filter.eq("is_read", false)
        } else {
            filter
        }
    }

    /// A user's notifications, newest first
    pub async fn list_for_user(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: Option<i64>,
    ) -> HubResult<Vec<Notification>> {
        let mut query = Query::filtered(Self::user_filter(user_id, unread_only))
            .order_by("created_at", Direction::Desc);
        if let Some(limit) = limit {
            if limit <= 0 {
                return Err(HubError::Validation("Limit must be positive".to_string()));
            }
            query = query.limit(limit);
        }
        store::select(self.store.as_ref(), &query).await
    }

    pub async fn unread_count(&self, user_id: &str) -> HubResult<i64> {
        self.store
            .count(tables::NOTIFICATIONS, &Self::user_filter(user_id, true))
            .await
    }

    /// Mark one notification read; already-read notifications are returned unchanged
    pub async fn mark_read(&self, id: &str) -> HubResult<Notification> {
        let guard = Filter::new().eq("is_read", false);
        let read = patch(json!({
            "is_read": true,
            "read_at": timestamp::value(&timestamp::now()),
        }));

        match self
            .store
            .update_where(tables::NOTIFICATIONS, id, &guard, read)
            .await?
        {
            Some(row) => store::from_row(row),
            None => self.get(id).await,
        }
    }

    /// Mark every unread notification of a user read
    pub async fn mark_all_read(&self, user_id: &str) -> HubResult<u64> {
        let unread: Vec<Notification> = store::select(
            self.store.as_ref(),
            &Query::filtered(Self::user_filter(user_id, true)),
        )
        .await?;

        let guard = Filter::new().eq("is_read", false);
        let read_at = timestamp::value(&timestamp::now());
        let mut marked = 0;
        for notification in unread {
            let read = patch(json!({ "is_read": true, "read_at": read_at.clone() }));
            if self
                .store
                .update_where(tables::NOTIFICATIONS, &notification.id, &guard, read)
                .await?
                .is_some()
            {
                marked += 1;
            }
        }
        Ok(marked)
    }

    pub async fn delete(&self, id: &str) -> HubResult<bool> {
        Ok(self.store.delete(tables::NOTIFICATIONS, id).await?.is_some())
    }

    /// Remove notifications whose expiry is before `now`
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> HubResult<u64> {
        let expired = Filter::new().lt("expires_at", timestamp::value(&now));
        let removed = self
            .store
            .delete_where(tables::NOTIFICATIONS, &expired)
            .await?
            .len() as u64;
        if removed > 0 {
            info!(removed, "Pruned expired notifications");
        }
        Ok(removed)
    }

    /// Live inbox for a user, kept current by the change feed
    ///
    /// Changes committed during the initial fetch are applied after it.
    pub async fn watch_inbox(
        &self,
        sync: &ViewSync,
        user_id: &str,
    ) -> HubResult<(LiveList<Notification>, SyncHandle)> {
        let list = LiveList::new(ViewOrder::NewestFirst);
        let handle = sync
            .bind_list_seeded(Filter::new().eq("user_id", user_id), list.clone(), || {
                self.list_for_user(user_id, false, None)
            })
            .await?;
        Ok((list, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::realtime::LocalChangeFeed;
    use crate::store::testing::{HookedStore, StoreHooks};
    use crate::store::{Row, SqliteRecordStore};

    async fn notifier() -> Notifier {
        let pool = db::connect_in_memory().await.unwrap();
        Notifier::new(Arc::new(SqliteRecordStore::new(pool)), 30)
    }

    fn event_update(user: &str) -> NewNotification {
        NewNotification::new(
            user,
            "Event updated",
            "The venue changed",
            NotificationPayload::EventUpdate {
                event_id: "e1".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_type_derived_from_payload() {
        let notifier = notifier().await;
        let notification = notifier.notify(event_update("u1")).await.unwrap();

        assert_eq!(notification.kind, NotificationType::EventUpdate);
        assert_eq!(notification.priority, NotificationPriority::Normal);
        assert!(notification.expires_at.unwrap() > notification.created_at);

        let stored = notifier.get(&notification.id).await.unwrap();
        assert_eq!(stored, notification);
    }

    #[tokio::test]
    async fn test_stored_shape() {
        let notification = Notification {
            id: "n1".to_string(),
            user_id: "u1".to_string(),
            kind: NotificationType::PhotoMatch,
            title: "t".to_string(),
            message: "m".to_string(),
            data: NotificationPayload::PhotoMatch {
                photo_id: "p1".to_string(),
                event_id: None,
                confidence: 92.0,
            },
            action_url: Some("/gallery".to_string()),
            priority: NotificationPriority::High,
            is_read: false,
            read_at: None,
            expires_at: None,
            created_at: timestamp::now(),
        };
        let row = store::to_row(&notification).unwrap();
        assert_eq!(row.get("type"), Some(&json!("photo_match")));
        assert_eq!(row["data"]["kind"], json!("photo_match"));
        assert_eq!(row.get("priority"), Some(&json!("high")));
    }

    #[tokio::test]
    async fn test_rejects_missing_target() {
        let notifier = notifier().await;
        let err = notifier.notify(event_update(" ")).await.unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
    }

    #[tokio::test]
    async fn test_read_tracking() {
        let notifier = notifier().await;
        let first = notifier.notify(event_update("u1")).await.unwrap();
        notifier.notify(event_update("u1")).await.unwrap();
        notifier.notify(event_update("u1")).await.unwrap();
        notifier.notify(event_update("u2")).await.unwrap();

        assert_eq!(notifier.unread_count("u1").await.unwrap(), 3);

        let read = notifier.mark_read(&first.id).await.unwrap();
        assert!(read.is_read);
        assert!(read.read_at.is_some());
        let again = notifier.mark_read(&first.id).await.unwrap();
        assert_eq!(again.read_at, read.read_at);

        assert_eq!(notifier.mark_all_read("u1").await.unwrap(), 2);
        assert_eq!(notifier.unread_count("u1").await.unwrap(), 0);
        assert_eq!(notifier.unread_count("u2").await.unwrap(), 1);

        assert!(matches!(
            notifier.mark_read("missing").await.unwrap_err(),
            HubError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_list_newest_first_with_limit() {
        let notifier = notifier().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(notifier.notify(event_update("u1")).await.unwrap().id);
        }

        let listed = notifier.list_for_user("u1", false, Some(2)).await.unwrap();
        let listed: Vec<_> = listed.into_iter().map(|n| n.id).collect();
        assert_eq!(listed, vec![ids[2].clone(), ids[1].clone()]);

        assert!(notifier.list_for_user("u1", false, Some(0)).await.is_err());
    }

    /// Commits one more notification right after the first fetch has read
    struct CommitAfterRead(std::sync::Mutex<Option<Row>>);

    #[async_trait::async_trait]
    impl StoreHooks for CommitAfterRead {
        async fn after_select(&self, inner: &dyn RecordStore, table: &str) -> HubResult<()> {
            if table != tables::NOTIFICATIONS {
                return Ok(());
            }
            let pending = self.0.lock().unwrap().take();
            if let Some(row) = pending {
                inner.insert(table, row).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_watch_inbox_keeps_notification_committed_during_fetch() {
        let feed = Arc::new(LocalChangeFeed::new(16));
        let inner: Arc<dyn RecordStore> = Arc::new(
            SqliteRecordStore::new(db::connect_in_memory().await.unwrap())
                .with_change_feed(feed.clone()),
        );
        let earlier = Notifier::new(inner.clone(), 30)
            .notify(event_update("u1"))
            .await
            .unwrap();

        let late = Notification {
            id: "late-1".to_string(),
            user_id: "u1".to_string(),
            kind: NotificationType::EventUpdate,
            title: "Event updated".to_string(),
            message: "Doors open at 6".to_string(),
            data: NotificationPayload::EventUpdate {
                event_id: "e1".to_string(),
            },
            action_url: None,
            priority: NotificationPriority::Normal,
            is_read: false,
            read_at: None,
            expires_at: None,
            created_at: timestamp::now(),
        };
        let hooks = CommitAfterRead(std::sync::Mutex::new(Some(store::to_row(&late).unwrap())));
        let notifier = Notifier::new(Arc::new(HookedStore::new(inner, hooks)), 30);
        let sync = ViewSync::new(feed.clone());

        let (inbox, _handle) = notifier.watch_inbox(&sync, "u1").await.unwrap();

        for _ in 0..100 {
            if inbox.len().await == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(inbox.contains(&earlier.id).await);
        assert!(inbox.contains("late-1").await);
        assert_eq!(notifier.list_for_user("u1", false, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_prune_expired() {
        let notifier = notifier().await;
        let now = timestamp::now();
        notifier
            .notify(event_update("u1").expires_at(now - Duration::hours(1)))
            .await
            .unwrap();
        let kept = notifier.notify(event_update("u1")).await.unwrap();

        assert_eq!(notifier.prune_expired(now).await.unwrap(), 1);
        let remaining = notifier.list_for_user("u1", false, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, kept.id);

        assert!(notifier.delete(&kept.id).await.unwrap());
        assert!(!notifier.delete(&kept.id).await.unwrap());
    }
}
