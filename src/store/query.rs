/// Filters, ordering and pagination for record store queries
use crate::{
    error::{HubError, HubResult},
    store::Row,
};
use serde_json::Value;
use std::cmp::Ordering;

/// Single predicate on a row field
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    /// NULL-safe: a missing field is "not equal" to any non-null value
    Neq(String, Value),
    In(String, Vec<Value>),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    IsNull(String),
}

impl Condition {
    pub fn field(&self) -> &str {
        match self {
            Condition::Eq(f, _)
            | Condition::Neq(f, _)
            | Condition::In(f, _)
            | Condition::Gt(f, _)
            | Condition::Gte(f, _)
            | Condition::Lt(f, _)
            | Condition::Lte(f, _)
            | Condition::IsNull(f) => f,
        }
    }

    fn matches(&self, row: &Row) -> bool {
        let actual = lookup(row, self.field());
        match self {
            Condition::Eq(_, expected) => values_equal(actual, expected),
            Condition::Neq(_, expected) => !values_equal(actual, expected),
            Condition::In(_, options) => options.iter().any(|v| values_equal(actual, v)),
            Condition::Gt(_, bound) => compare(actual, bound) == Some(Ordering::Greater),
            Condition::Gte(_, bound) => matches!(
                compare(actual, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Condition::Lt(_, bound) => compare(actual, bound) == Some(Ordering::Less),
            Condition::Lte(_, bound) => {
                matches!(compare(actual, bound), Some(Ordering::Less | Ordering::Equal))
            }
            Condition::IsNull(_) => actual.is_null(),
        }
    }
}

/// Conjunction of conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field.to_string(), value.into()));
        self
    }

    pub fn neq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Neq(field.to_string(), value.into()));
        self
    }

    pub fn is_in<V: Into<Value>>(mut self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.conditions.push(Condition::In(
            field.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn gt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Gt(field.to_string(), value.into()));
        self
    }

    pub fn gte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Gte(field.to_string(), value.into()));
        self
    }

    pub fn lt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Lt(field.to_string(), value.into()));
        self
    }

    pub fn lte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Lte(field.to_string(), value.into()));
        self
    }

    pub fn is_null(mut self, field: &str) -> Self {
        self.conditions.push(Condition::IsNull(field.to_string()));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate the filter against an in-memory row
    ///
    /// Mirrors the SQL semantics of the record store so change feed
    /// subscribers see exactly the rows a select would return.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Select request: filter, ordering, pagination
///
/// Rows with equal sort keys come back in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub order: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order.push(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Field names may only contain ASCII alphanumerics, `_` and `.` (nesting)
pub fn validate_field(field: &str) -> HubResult<()> {
    let valid = !field.is_empty()
        && !field.starts_with('.')
        && !field.ends_with('.')
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(HubError::Validation(format!("Invalid field name: {:?}", field)))
    }
}

fn lookup<'a>(row: &'a Row, field: &str) -> &'a Value {
    static NULL: Value = Value::Null;

    let mut parts = field.split('.');
    let first = parts.next().unwrap_or_default();
    let mut current = match row.get(first) {
        Some(v) => v,
        None => return &NULL,
    };
    for part in parts {
        current = match current.get(part) {
            Some(v) => v,
            None => return &NULL,
        };
    }
    current
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
