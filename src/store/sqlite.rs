/// SQLite-backed record store
///
/// All tables share one `records` table; row data lives in a JSON column
/// and filters are compiled to JSON1 expressions. Every committed write is
/// published to the attached change feed.
use crate::{
    error::{HubError, HubResult},
    realtime::{ChangeEvent, ChangeKind, LocalChangeFeed},
    store::{
        query::{validate_field, Condition, Direction, Filter, Query},
        row_id, timestamp, CountedUpdate, CounterDelta, RecordStore, Row,
    },
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteArguments, SqliteConnection, SqliteRow},
    Row as _, Sqlite, SqlitePool,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Bind parameter compiled from a JSON value
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            // json_extract yields 1/0 for JSON booleans
            Value::Bool(b) => SqlValue::Int(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => SqlValue::Real(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_values(mut query: SqliteQuery<'_>, values: Vec<SqlValue>) -> SqliteQuery<'_> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Int(i) => query.bind(i),
            SqlValue::Real(f) => query.bind(f),
            SqlValue::Text(s) => query.bind(s),
        };
    }
    query
}

fn json_path(field: &str) -> HubResult<String> {
    validate_field(field)?;
    Ok(format!("json_extract(data, '$.{}')", field))
}

/// Compile a filter into `AND`-joined SQL fragments, pushing bind values
fn compile_filter(filter: &Filter, binds: &mut Vec<SqlValue>) -> HubResult<String> {
    let mut clauses = Vec::with_capacity(filter.conditions().len());

    for condition in filter.conditions() {
        let column = json_path(condition.field())?;
        let clause = match condition {
            Condition::Eq(_, Value::Null) | Condition::IsNull(_) => format!("{} IS NULL", column),
            Condition::Eq(_, value) => {
                binds.push(value.into());
                format!("{} = ?", column)
            }
            Condition::Neq(_, Value::Null) => format!("{} IS NOT NULL", column),
            Condition::Neq(_, value) => {
                binds.push(value.into());
                format!("({col} IS NULL OR {col} != ?)", col = column)
            }
            Condition::In(_, values) if values.is_empty() => "0".to_string(),
            Condition::In(_, values) => {
                binds.extend(values.iter().map(SqlValue::from));
                let placeholders = vec!["?"; values.len()].join(", ");
                format!("{} IN ({})", column, placeholders)
            }
            Condition::Gt(_, value) => {
                binds.push(value.into());
                format!("{} > ?", column)
            }
            Condition::Gte(_, value) => {
                binds.push(value.into());
                format!("{} >= ?", column)
            }
            Condition::Lt(_, value) => {
                binds.push(value.into());
                format!("{} < ?", column)
            }
            Condition::Lte(_, value) => {
                binds.push(value.into());
                format!("{} <= ?", column)
            }
        };
        clauses.push(clause);
    }

    Ok(clauses
        .into_iter()
        .map(|c| format!(" AND {}", c))
        .collect::<String>())
}

fn compile_order(query: &Query) -> HubResult<String> {
    let mut terms = Vec::with_capacity(query.order.len() + 1);
    for order in &query.order {
        let direction = match order.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        terms.push(format!("{} {}", json_path(&order.field)?, direction));
    }
    // Equal sort keys fall back to insertion order
    terms.push("seq ASC".to_string());
    Ok(format!(" ORDER BY {}", terms.join(", ")))
}

fn compile_page(query: &Query, binds: &mut Vec<SqlValue>) -> String {
    match (query.limit, query.offset) {
        (None, None) => String::new(),
        (limit, offset) => {
            binds.push(SqlValue::Int(limit.unwrap_or(-1)));
            binds.push(SqlValue::Int(offset.unwrap_or(0)));
            " LIMIT ? OFFSET ?".to_string()
        }
    }
}

fn decode_row(row: &SqliteRow) -> HubResult<Row> {
    let data: String = row.try_get("data").map_err(map_sqlx_error)?;
    match serde_json::from_str(&data)? {
        Value::Object(map) => Ok(map),
        _ => Err(HubError::Internal("Stored record is not an object".to_string())),
    }
}

/// Translate driver errors into the store's error kinds
pub fn map_sqlx_error(e: sqlx::Error) -> HubError {
    match &e {
        sqlx::Error::RowNotFound => HubError::NotFound("Record not found".to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            HubError::Constraint(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            HubError::Transport(e.to_string())
        }
        _ => HubError::Database(e),
    }
}

/// Record store over a SQLite pool
#[derive(Clone)]
pub struct SqliteRecordStore {
    db: SqlitePool,
    feed: Option<Arc<LocalChangeFeed>>,
}

impl SqliteRecordStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db, feed: None }
    }

    /// Publish committed writes to `feed`
    pub fn with_change_feed(mut self, feed: Arc<LocalChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    fn publish(&self, table: &str, kind: ChangeKind, record: &Row) {
        if let Some(feed) = &self.feed {
            feed.publish(ChangeEvent::new(table, kind, record.clone()));
        }
    }

    fn prepare_insert(row: Row) -> HubResult<(String, Row)> {
        let mut row = row;
        let id = match row_id(&row) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        row.insert("id".to_string(), Value::String(id.clone()));
        Ok((id, row))
    }

    async fn patch_row(
        &self,
        table: &str,
        id: &str,
        guard: &Filter,
        patch: Row,
    ) -> HubResult<Option<Row>> {
        let mut conn = self.db.acquire().await.map_err(map_sqlx_error)?;
        let record = patch_in(&mut conn, table, id, guard, patch).await?;
        if let Some(record) = &record {
            self.publish(table, ChangeKind::Update, record);
        }
        Ok(record)
    }
}

/// Guarded JSON merge on one row; `None` when missing or the guard fails
async fn patch_in(
    conn: &mut SqliteConnection,
    table: &str,
    id: &str,
    guard: &Filter,
    mut patch: Row,
) -> HubResult<Option<Row>> {
    patch.remove("id");
    let patch = serde_json::to_string(&Value::Object(patch))?;
    let now = timestamp::format(&timestamp::now());

    let mut binds = vec![
        SqlValue::Text(patch),
        SqlValue::Text(now),
        SqlValue::Text(table.to_string()),
        SqlValue::Text(id.to_string()),
    ];
    let conditions = compile_filter(guard, &mut binds)?;
    let sql = format!(
        "UPDATE records SET data = json_patch(data, ?), updated_at = ?
         WHERE table_name = ? AND id = ?{} RETURNING data",
        conditions
    );

    let row = bind_values(sqlx::query(&sql), binds)
        .fetch_optional(conn)
        .await
        .map_err(map_sqlx_error)?;

    row.as_ref().map(decode_row).transpose()
}

/// Add `delta` to a numeric field; `None` when the row is missing
async fn increment_in(
    conn: &mut SqliteConnection,
    table: &str,
    id: &str,
    field: &str,
    delta: i64,
) -> HubResult<Option<Row>> {
    validate_field(field)?;
    let path = format!("$.{}", field);
    let now = timestamp::format(&timestamp::now());

    let row = sqlx::query(
        "UPDATE records
         SET data = json_set(data, ?, COALESCE(json_extract(data, ?), 0) + ?), updated_at = ?
         WHERE table_name = ? AND id = ? RETURNING data",
    )
    .bind(&path)
    .bind(&path)
    .bind(delta)
    .bind(&now)
    .bind(table)
    .bind(id)
    .fetch_optional(conn)
    .await
    .map_err(map_sqlx_error)?;

    row.as_ref().map(decode_row).transpose()
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn select(&self, table: &str, query: &Query) -> HubResult<Vec<Row>> {
        let mut binds = vec![SqlValue::Text(table.to_string())];
        let conditions = compile_filter(&query.filter, &mut binds)?;
        let order = compile_order(query)?;
        let page = compile_page(query, &mut binds);
        let sql = format!(
            "SELECT data FROM records WHERE table_name = ?{}{}{}",
            conditions, order, page
        );

        let rows = bind_values(sqlx::query(&sql), binds)
            .fetch_all(&self.db)
            .await
            .map_err(map_sqlx_error)?;

        rows.iter().map(decode_row).collect()
    }

    async fn get(&self, table: &str, id: &str) -> HubResult<Option<Row>> {
        let row = sqlx::query("SELECT data FROM records WHERE table_name = ? AND id = ?")
            .bind(table)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn insert(&self, table: &str, row: Row) -> HubResult<Row> {
        let (id, row) = Self::prepare_insert(row)?;
        let data = serde_json::to_string(&row)?;
        let now = timestamp::format(&timestamp::now());

        sqlx::query(
            "INSERT INTO records (table_name, id, data, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(table)
        .bind(&id)
        .bind(&data)
        .bind(&now)
        .bind(&now)
        .execute(&self.db)
        .await
        .map_err(map_sqlx_error)?;

        debug!(table, id = %id, "Inserted record");
        self.publish(table, ChangeKind::Insert, &row);
        Ok(row)
    }

    async fn insert_unique(&self, table: &str, row: Row, conflict: &Filter) -> HubResult<Row> {
        let (id, row) = Self::prepare_insert(row)?;
        let data = serde_json::to_string(&row)?;
        let now = timestamp::format(&timestamp::now());

        let mut binds = vec![
            SqlValue::Text(table.to_string()),
            SqlValue::Text(id.clone()),
            SqlValue::Text(data),
            SqlValue::Text(now.clone()),
            SqlValue::Text(now),
            SqlValue::Text(table.to_string()),
        ];
        let conditions = compile_filter(conflict, &mut binds)?;
        let sql = format!(
            "INSERT INTO records (table_name, id, data, created_at, updated_at)
             SELECT ?, ?, ?, ?, ?
             WHERE NOT EXISTS (SELECT 1 FROM records WHERE table_name = ?{})",
            conditions
        );

        let result = bind_values(sqlx::query(&sql), binds)
            .execute(&self.db)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(HubError::Constraint(format!(
                "A conflicting {} record already exists",
                table
            )));
        }

        debug!(table, id = %id, "Inserted unique record");
        self.publish(table, ChangeKind::Insert, &row);
        Ok(row)
    }

    async fn update(&self, table: &str, id: &str, patch: Row) -> HubResult<Row> {
        self.patch_row(table, id, &Filter::new(), patch)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("{} {} not found", table, id)))
    }

    async fn update_where(
        &self,
        table: &str,
        id: &str,
        guard: &Filter,
        patch: Row,
    ) -> HubResult<Option<Row>> {
        self.patch_row(table, id, guard, patch).await
    }

    async fn increment(&self, table: &str, id: &str, field: &str, delta: i64) -> HubResult<Row> {
        let mut conn = self.db.acquire().await.map_err(map_sqlx_error)?;
        let record = increment_in(&mut conn, table, id, field, delta)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("{} {} not found", table, id)))?;

        self.publish(table, ChangeKind::Update, &record);
        Ok(record)
    }

    async fn update_where_counted(
        &self,
        table: &str,
        id: &str,
        guard: &Filter,
        patch: Row,
        counter: CounterDelta<'_>,
    ) -> HubResult<Option<CountedUpdate>> {
        let mut tx = self.db.begin().await.map_err(map_sqlx_error)?;

        let Some(row) = patch_in(&mut tx, table, id, guard, patch).await? else {
            return Ok(None);
        };
        let counter_row = increment_in(
            &mut tx,
            counter.table,
            counter.id,
            counter.field,
            counter.delta,
        )
        .await?;

        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(
            table,
            id,
            counter_table = counter.table,
            counter_id = counter.id,
            delta = counter.delta,
            "Committed counted update"
        );
        self.publish(table, ChangeKind::Update, &row);
        if let Some(counter_row) = &counter_row {
            self.publish(counter.table, ChangeKind::Update, counter_row);
        }
        Ok(Some(CountedUpdate {
            row,
            counter: counter_row,
        }))
    }

    async fn delete(&self, table: &str, id: &str) -> HubResult<Option<Row>> {
        let row = sqlx::query("DELETE FROM records WHERE table_name = ? AND id = ? RETURNING data")
            .bind(table)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .map_err(map_sqlx_error)?;

        let record = row.as_ref().map(decode_row).transpose()?;
        if let Some(record) = &record {
            self.publish(table, ChangeKind::Delete, record);
        }
        Ok(record)
    }

    async fn delete_where(&self, table: &str, filter: &Filter) -> HubResult<Vec<Row>> {
        let mut binds = vec![SqlValue::Text(table.to_string())];
        let conditions = compile_filter(filter, &mut binds)?;
        let sql = format!(
            "DELETE FROM records WHERE table_name = ?{} RETURNING data",
            conditions
        );

        let rows = bind_values(sqlx::query(&sql), binds)
            .fetch_all(&self.db)
            .await
            .map_err(map_sqlx_error)?;

        let records = rows.iter().map(decode_row).collect::<HubResult<Vec<_>>>()?;
        for record in &records {
            self.publish(table, ChangeKind::Delete, record);
        }
        Ok(records)
    }

    async fn count(&self, table: &str, filter: &Filter) -> HubResult<i64> {
        let mut binds = vec![SqlValue::Text(table.to_string())];
        let conditions = compile_filter(filter, &mut binds)?;
        let sql = format!(
            "SELECT COUNT(*) AS total FROM records WHERE table_name = ?{}",
            conditions
        );

        let row = bind_values(sqlx::query(&sql), binds)
            .fetch_one(&self.db)
            .await
            .map_err(map_sqlx_error)?;

        row.try_get::<i64, _>("total").map_err(map_sqlx_error)
    }
}
