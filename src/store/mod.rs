/// Record Store
///
/// Table-scoped row storage used by every coordinator. Rows are JSON
/// objects keyed by a string `id`; typed models convert through
/// [`to_row`] / [`from_row`]. Coordinators only ever hold an
/// `Arc<dyn RecordStore>`, so tests can inject any implementation.

pub mod query;
pub mod sqlite;
pub mod timestamp;

#[cfg(test)]
pub(crate) mod testing;

pub use query::{Condition, Direction, Filter, OrderBy, Query};
pub use sqlite::SqliteRecordStore;

use crate::error::{HubError, HubResult};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

/// A stored row
pub type Row = Map<String, Value>;

/// Table names shared with the external face-detection capability
pub mod tables {
    pub const EVENTS: &str = "events";
    pub const EVENT_USERS: &str = "event_users";
    pub const PHOTOS: &str = "photos";
    pub const MATCH_QUEUE: &str = "face_match_queue";
    pub const MATCH_CANDIDATES: &str = "face_recognition_results";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const CHATS: &str = "chats";
    pub const CHAT_PARTICIPANTS: &str = "chat_participants";
    pub const CHAT_MESSAGES: &str = "chat_messages";
}

/// Typed row living in a known table
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: &'static str;

    fn id(&self) -> &str;
}

/// Numeric field adjusted alongside a guarded update
#[derive(Debug, Clone, Copy)]
pub struct CounterDelta<'a> {
    pub table: &'a str,
    pub id: &'a str,
    pub field: &'a str,
    pub delta: i64,
}

/// Rows written by [`RecordStore::update_where_counted`]
#[derive(Debug, Clone)]
pub struct CountedUpdate {
    pub row: Row,
    /// `None` when the counter row does not exist
    pub counter: Option<Row>,
}

/// Record store backend trait
///
/// Implementations must report a missing row as `NotFound`, uniqueness
/// failures as `Constraint` and connectivity failures as `Transport`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch rows matching a query
    async fn select(&self, table: &str, query: &Query) -> HubResult<Vec<Row>>;

    /// Fetch a single row by id
    async fn get(&self, table: &str, id: &str) -> HubResult<Option<Row>>;

    /// Insert a row, assigning an id when absent
    async fn insert(&self, table: &str, row: Row) -> HubResult<Row>;

    /// Insert a row unless any row matches `conflict`, atomically
    async fn insert_unique(&self, table: &str, row: Row, conflict: &Filter) -> HubResult<Row>;

    /// Merge `patch` into an existing row
    async fn update(&self, table: &str, id: &str, patch: Row) -> HubResult<Row>;

    /// Merge `patch` only if the row still satisfies `guard`
    ///
    /// Returns `None` when the row is missing or the guard fails.
    async fn update_where(
        &self,
        table: &str,
        id: &str,
        guard: &Filter,
        patch: Row,
    ) -> HubResult<Option<Row>>;

    /// Atomically add `delta` to a numeric field (missing counts as 0)
    async fn increment(&self, table: &str, id: &str, field: &str, delta: i64) -> HubResult<Row>;

    /// `update_where` and a counter adjustment committed together
    ///
    /// Returns `None` when the row is missing or the guard fails, and then
    /// the counter is left alone. A missing counter row does not block the
    /// update; any other failure rolls both writes back.
    async fn update_where_counted(
        &self,
        table: &str,
        id: &str,
        guard: &Filter,
        patch: Row,
        counter: CounterDelta<'_>,
    ) -> HubResult<Option<CountedUpdate>>;

    /// Delete a row if it exists, returning the removed row
    async fn delete(&self, table: &str, id: &str) -> HubResult<Option<Row>>;

    /// Delete every row matching `filter`, returning the removed rows
    async fn delete_where(&self, table: &str, filter: &Filter) -> HubResult<Vec<Row>>;

    /// Count rows matching `filter`
    async fn count(&self, table: &str, filter: &Filter) -> HubResult<i64>;
}

/// Serialize a model into a row
pub fn to_row<T: Serialize>(value: &T) -> HubResult<Row> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(HubError::Internal(format!(
            "Record must serialize to an object, got {}",
            other
        ))),
    }
}

/// Deserialize a row into a model
pub fn from_row<T: DeserializeOwned>(row: Row) -> HubResult<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

pub fn from_rows<T: DeserializeOwned>(rows: Vec<Row>) -> HubResult<Vec<T>> {
    rows.into_iter().map(from_row).collect()
}

/// Build a patch row from a `json!` object literal
pub fn patch(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

pub fn row_id(row: &Row) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

/// Typed fetch helper: `NotFound` when absent
pub async fn fetch<T: Record>(store: &dyn RecordStore, id: &str) -> HubResult<T> {
    match store.get(T::TABLE, id).await? {
        Some(row) => from_row(row),
        None => Err(HubError::NotFound(format!("{} {} not found", T::TABLE, id))),
    }
}

/// Typed optional fetch helper
pub async fn find<T: Record>(store: &dyn RecordStore, id: &str) -> HubResult<Option<T>> {
    store.get(T::TABLE, id).await?.map(from_row).transpose()
}

/// Typed select helper
pub async fn select<T: Record>(store: &dyn RecordStore, query: &Query) -> HubResult<Vec<T>> {
    from_rows(store.select(T::TABLE, query).await?)
}

/// Typed insert helper
pub async fn insert<T: Record>(store: &dyn RecordStore, record: &T) -> HubResult<T> {
    from_row(store.insert(T::TABLE, to_row(record)?).await?)
}
