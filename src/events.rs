/// Events and registered event users
///
/// An event owns photos and the attendees who registered to be matched in
/// them. Attendee counters are denormalized caches maintained through the
/// record store's atomic increment.
use crate::{
    error::{HubError, HubResult},
    store::{
        self, patch, tables, timestamp, Direction, Filter, Query, Record, RecordStore,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A photography event (wedding, conference, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    /// Calendar date of the event, `YYYY-MM-DD`
    pub date: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub photographer_id: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Record for Event {
    const TABLE: &'static str = tables::EVENTS;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventUserStatus {
    Active,
    Completed,
    Pending,
}

impl EventUserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventUserStatus::Active => "active",
            EventUserStatus::Completed => "completed",
            EventUserStatus::Pending => "pending",
        }
    }
}

/// Attendee registered for face matching at an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventUser {
    pub id: String,
    pub event_id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// Incremented once per verified match
    #[serde(default)]
    pub matches_found: i64,
    #[serde(default)]
    pub photos_uploaded: i64,
    pub status: EventUserStatus,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Record for EventUser {
    const TABLE: &'static str = tables::EVENT_USERS;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Registration request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewEventUser {
    pub event_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Event and attendee management
#[derive(Clone)]
pub struct EventManager {
    store: Arc<dyn RecordStore>,
}

impl EventManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn create_event(
        &self,
        name: &str,
        date: &str,
        location: Option<String>,
        photographer_id: Option<String>,
    ) -> HubResult<Event> {
        if name.trim().is_empty() {
            return Err(HubError::Validation("Event name is required".to_string()));
        }
        chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
            HubError::Validation(format!("Event date must be YYYY-MM-DD, got {:?}", date))
        })?;

        let event = Event {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            date: date.to_string(),
            location,
            photographer_id,
            created_at: timestamp::now(),
        };
        let event = store::insert(self.store.as_ref(), &event).await?;
        info!(event_id = %event.id, "Created event");
        Ok(event)
    }

    pub async fn get_event(&self, id: &str) -> HubResult<Event> {
        store::fetch(self.store.as_ref(), id).await
    }

    /// Register an attendee for matching
    pub async fn register_user(&self, request: NewEventUser) -> HubResult<EventUser> {
        if request.name.trim().is_empty() {
            return Err(HubError::Validation("Attendee name is required".to_string()));
        }
        if let Some(email) = &request.email {
            if !email.contains('@') {
                return Err(HubError::Validation(format!("Invalid email: {}", email)));
            }
        }

        // Referenced event must exist
        self.get_event(&request.event_id).await?;

        let user = EventUser {
            id: Uuid::new_v4().to_string(),
            event_id: request.event_id,
            name: request.name.trim().to_string(),
            email: request.email,
            phone: request.phone,
            matches_found: 0,
            photos_uploaded: 0,
            status: EventUserStatus::Active,
            created_at: timestamp::now(),
        };
        let user = store::insert(self.store.as_ref(), &user).await?;
        info!(event_id = %user.event_id, user_id = %user.id, "Registered event user");
        Ok(user)
    }

    pub async fn get_user(&self, id: &str) -> HubResult<EventUser> {
        store::fetch(self.store.as_ref(), id).await
    }

    /// Attendees of an event in registration order
    pub async fn list_users(&self, event_id: &str) -> HubResult<Vec<EventUser>> {
        let query = Query::filtered(Filter::new().eq("event_id", event_id))
            .order_by("created_at", Direction::Asc);
        store::select(self.store.as_ref(), &query).await
    }

    pub async fn set_user_status(&self, id: &str, status: EventUserStatus) -> HubResult<EventUser> {
        let row = self
            .store
            .update(tables::EVENT_USERS, id, patch(json!({ "status": status })))
            .await?;
        store::from_row(row)
    }

    /// Count one more photo contributed by an attendee
    pub async fn record_photo_uploaded(&self, id: &str) -> HubResult<EventUser> {
        let row = self
            .store
            .increment(tables::EVENT_USERS, id, "photos_uploaded", 1)
            .await?;
        store::from_row(row)
    }
}
