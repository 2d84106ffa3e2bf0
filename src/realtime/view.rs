/// Realtime View Sync
///
/// Applies change feed events to view-owned caches. Every handler is
/// idempotent and tolerates out-of-order delivery: an update or delete for
/// an id that is not materialized locally is dropped, since the next full
/// refetch reconciles it.
use crate::{
    error::HubResult,
    realtime::{ChangeEvent, ChangeFeed, ChangeKind, ChannelId, ChannelSpec, Subscription},
    store::{from_row, query::Filter, Record, Row},
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where inserts land in a cached list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewOrder {
    /// Prepend (notification inboxes)
    NewestFirst,
    /// Append (chat transcripts)
    Chronological,
}

/// In-memory list mirroring store rows of one table
#[derive(Clone)]
pub struct LiveList<T: Record> {
    items: Arc<RwLock<Vec<T>>>,
    order: ViewOrder,
}

impl<T: Record> LiveList<T> {
    pub fn new(order: ViewOrder) -> Self {
        Self::with_items(order, Vec::new())
    }

    /// Seed the cache from an initial fetch
    pub fn with_items(order: ViewOrder, items: Vec<T>) -> Self {
        Self {
            items: Arc::new(RwLock::new(items)),
            order,
        }
    }

    pub fn order(&self) -> ViewOrder {
        self.order
    }

    pub async fn snapshot(&self) -> Vec<T> {
        self.items.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.items.read().await.iter().any(|item| item.id() == id)
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        self.items
            .read()
            .await
            .iter()
            .find(|item| item.id() == id)
            .cloned()
    }

    /// Replace the whole cache after a full refetch
    pub async fn replace_all(&self, items: Vec<T>) {
        *self.items.write().await = items;
    }

    /// Insert, or replace in place when the id is already present
    pub async fn apply_insert(&self, item: T) {
        let mut items = self.items.write().await;
        if let Some(pos) = items.iter().position(|i| i.id() == item.id()) {
            items[pos] = item;
            return;
        }
        match self.order {
            ViewOrder::NewestFirst => items.insert(0, item),
            ViewOrder::Chronological => items.push(item),
        }
    }

    /// Replace by id; returns false when the id is not materialized
    pub async fn apply_update(&self, item: T) -> bool {
        let mut items = self.items.write().await;
        match items.iter().position(|i| i.id() == item.id()) {
            Some(pos) => {
                items[pos] = item;
                true
            }
            None => {
                debug!(table = T::TABLE, id = item.id(), "Dropping update for unmaterialized row");
                false
            }
        }
    }

    /// Remove by id; returns false when nothing was removed
    pub async fn apply_delete(&self, id: &str) -> bool {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|i| i.id() != id);
        items.len() != before
    }

    /// Apply one change event
    pub async fn apply(&self, event: &ChangeEvent) -> HubResult<()> {
        match event.kind {
            ChangeKind::Insert => self.apply_insert(from_row(event.record.clone())?).await,
            ChangeKind::Update => {
                self.apply_update(from_row(event.record.clone())?).await;
            }
            ChangeKind::Delete => {
                if let Some(id) = event.record_id() {
                    self.apply_delete(id).await;
                }
            }
        }
        Ok(())
    }
}

pub type RowHandler = Box<dyn Fn(Row) + Send + Sync>;

/// Callbacks for raw row changes
#[derive(Default)]
pub struct ChangeHandlers {
    on_insert: Option<RowHandler>,
    on_update: Option<RowHandler>,
    on_delete: Option<RowHandler>,
}

impl ChangeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert(mut self, handler: impl Fn(Row) + Send + Sync + 'static) -> Self {
        self.on_insert = Some(Box::new(handler));
        self
    }

    pub fn on_update(mut self, handler: impl Fn(Row) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Box::new(handler));
        self
    }

    pub fn on_delete(mut self, handler: impl Fn(Row) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Box::new(handler));
        self
    }

    fn dispatch(&self, event: ChangeEvent) {
        let handler = match event.kind {
            ChangeKind::Insert => &self.on_insert,
            ChangeKind::Update => &self.on_update,
            ChangeKind::Delete => &self.on_delete,
        };
        if let Some(handler) = handler {
            handler(event.record);
        }
    }
}

/// Binds views to change feed channels
#[derive(Clone)]
pub struct ViewSync {
    feed: Arc<dyn ChangeFeed>,
}

impl ViewSync {
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self { feed }
    }

    /// Subscribe raw handlers to a (table, filter) channel
    pub async fn subscribe(
        &self,
        table: &str,
        filter: Filter,
        handlers: ChangeHandlers,
    ) -> HubResult<SyncHandle> {
        let Subscription { id, mut receiver } =
            self.feed.subscribe(ChannelSpec::new(table, filter)).await?;

        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                handlers.dispatch(event);
            }
        });

        Ok(SyncHandle::new(id, Arc::clone(&self.feed), task))
    }

    /// Keep a `LiveList` coherent with the rows matching `filter`
    pub async fn bind_list<T: Record>(
        &self,
        filter: Filter,
        list: LiveList<T>,
    ) -> HubResult<SyncHandle> {
        let subscription = self.feed.subscribe(ChannelSpec::new(T::TABLE, filter)).await?;
        Ok(self.drain_into(subscription, list))
    }

    /// Subscribe, seed the list from `fetch`, then start applying events
    ///
    /// Events committed while `fetch` runs stay buffered in the channel and
    /// are applied on top of the seed, so the initial snapshot can never
    /// overwrite a newer row.
    pub async fn bind_list_seeded<T, F, Fut>(
        &self,
        filter: Filter,
        list: LiveList<T>,
        fetch: F,
    ) -> HubResult<SyncHandle>
    where
        T: Record,
        F: FnOnce() -> Fut,
        Fut: Future<Output = HubResult<Vec<T>>>,
    {
        let subscription = self.feed.subscribe(ChannelSpec::new(T::TABLE, filter)).await?;

        match fetch().await {
            Ok(items) => {
                list.replace_all(items).await;
                Ok(self.drain_into(subscription, list))
            }
            Err(e) => {
                self.feed.unsubscribe(subscription.id);
                Err(e)
            }
        }
    }

    fn drain_into<T: Record>(&self, subscription: Subscription, list: LiveList<T>) -> SyncHandle {
        let Subscription { id, mut receiver } = subscription;

        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(e) = list.apply(&event).await {
                    warn!(table = T::TABLE, error = %e, "Skipping undecodable change event");
                }
            }
        });

        SyncHandle::new(id, Arc::clone(&self.feed), task)
    }
}

/// Owner of one live subscription
///
/// Dropping the handle unsubscribes, so a view that goes away on any exit
/// path never leaks its channel.
pub struct SyncHandle {
    id: ChannelId,
    feed: Arc<dyn ChangeFeed>,
    task: JoinHandle<()>,
    closed: AtomicBool,
}

impl SyncHandle {
    fn new(id: ChannelId, feed: Arc<dyn ChangeFeed>, task: JoinHandle<()>) -> Self {
        Self {
            id,
            feed,
            task,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Close the channel. Safe to call any number of times.
    pub fn unsubscribe(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.task.abort();
        self.feed.unsubscribe(self.id);
        true
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
