/// Record store wrapper for tests that need to interleave writes with a
/// coordinator's own calls, or fail specific ones
use crate::{
    error::HubResult,
    store::{CountedUpdate, CounterDelta, Filter, Query, RecordStore, Row},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Interception points; every default lets the call through untouched
#[async_trait]
pub trait StoreHooks: Send + Sync {
    /// Runs before the insert reaches the inner store; an error aborts it
    async fn before_insert(
        &self,
        _inner: &dyn RecordStore,
        _table: &str,
        _row: &Row,
    ) -> HubResult<()> {
        Ok(())
    }

    /// Runs after the inner select has read its rows
    async fn after_select(&self, _inner: &dyn RecordStore, _table: &str) -> HubResult<()> {
        Ok(())
    }

    /// Runs before the delete reaches the inner store
    async fn before_delete(
        &self,
        _inner: &dyn RecordStore,
        _table: &str,
        _id: &str,
    ) -> HubResult<()> {
        Ok(())
    }
}

pub struct HookedStore<H> {
    inner: Arc<dyn RecordStore>,
    hooks: H,
}

impl<H: StoreHooks> HookedStore<H> {
    pub fn new(inner: Arc<dyn RecordStore>, hooks: H) -> Self {
        Self { inner, hooks }
    }
}

#[async_trait]
impl<H: StoreHooks> RecordStore for HookedStore<H> {
    async fn select(&self, table: &str, query: &Query) -> HubResult<Vec<Row>> {
        let rows = self.inner.select(table, query).await?;
        self.hooks.after_select(self.inner.as_ref(), table).await?;
        Ok(rows)
    }

    async fn get(&self, table: &str, id: &str) -> HubResult<Option<Row>> {
        self.inner.get(table, id).await
    }

    async fn insert(&self, table: &str, row: Row) -> HubResult<Row> {
        self.hooks.before_insert(self.inner.as_ref(), table, &row).await?;
        self.inner.insert(table, row).await
    }

    async fn insert_unique(&self, table: &str, row: Row, conflict: &Filter) -> HubResult<Row> {
        self.hooks.before_insert(self.inner.as_ref(), table, &row).await?;
        self.inner.insert_unique(table, row, conflict).await
    }

    async fn update(&self, table: &str, id: &str, patch: Row) -> HubResult<Row> {
        self.inner.update(table, id, patch).await
    }

    async fn update_where(
        &self,
        table: &str,
        id: &str,
        guard: &Filter,
        patch: Row,
    ) -> HubResult<Option<Row>> {
        self.inner.update_where(table, id, guard, patch).await
    }

    async fn increment(&self, table: &str, id: &str, field: &str, delta: i64) -> HubResult<Row> {
        self.inner.increment(table, id, field, delta).await
    }

    async fn update_where_counted(
        &self,
        table: &str,
        id: &str,
        guard: &Filter,
        patch: Row,
        counter: CounterDelta<'_>,
    ) -> HubResult<Option<CountedUpdate>> {
        self.inner
            .update_where_counted(table, id, guard, patch, counter)
            .await
    }

    async fn delete(&self, table: &str, id: &str) -> HubResult<Option<Row>> {
        self.hooks.before_delete(self.inner.as_ref(), table, id).await?;
        self.inner.delete(table, id).await
    }

    async fn delete_where(&self, table: &str, filter: &Filter) -> HubResult<Vec<Row>> {
        self.inner.delete_where(table, filter).await
    }

    async fn count(&self, table: &str, filter: &Filter) -> HubResult<i64> {
        self.inner.count(table, filter).await
    }
}
