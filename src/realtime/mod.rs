/// Change Feed and Realtime View Sync
///
/// The change feed emits row-level insert/update/delete events per table;
/// view sync keeps in-memory lists coherent with the record store by
/// applying those events by identifier.

pub mod feed;
pub mod view;

pub use feed::LocalChangeFeed;
pub use view::{ChangeHandlers, LiveList, SyncHandle, ViewOrder, ViewSync};

use crate::{
    error::HubResult,
    store::{query::Filter, row_id, timestamp, Row},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Row-level change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// A committed change to one row
///
/// For deletes `record` holds the last state of the removed row.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub record: Row,
    pub committed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(table: &str, kind: ChangeKind, record: Row) -> Self {
        Self {
            table: table.to_string(),
            kind,
            record,
            committed_at: timestamp::now(),
        }
    }

    pub fn record_id(&self) -> Option<&str> {
        row_id(&self.record)
    }
}

/// Identifier of an open channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

/// One logical channel per (table, filter) pair
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub table: String,
    pub filter: Filter,
}

impl ChannelSpec {
    pub fn new(table: &str, filter: Filter) -> Self {
        Self {
            name: format!("{}:{:?}", table, filter.conditions()),
            table: table.to_string(),
            filter,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// An open channel and its event stream
pub struct Subscription {
    pub id: ChannelId,
    pub receiver: mpsc::Receiver<ChangeEvent>,
}

/// Publish/subscribe transport for row changes
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a channel; events committed after this returns are delivered
    async fn subscribe(&self, spec: ChannelSpec) -> HubResult<Subscription>;

    /// Close a channel. Idempotent: returns false if it was already closed.
    fn unsubscribe(&self, id: ChannelId) -> bool;

    /// Number of open channels
    fn active_channels(&self) -> usize;
}
