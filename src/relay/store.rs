//! Backing store seam
//! An ordered, queryable, appendable record store with change subscriptions.
//! Rows are JSON objects; tables are named. The relay only needs column equality
//! filters and single-column ordering.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::events::Subscription;

/// One stored record.
pub type Row = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed row in {table}: {reason}")]
    Malformed { table: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Conjunction of column equality tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }

    /// Total order over JSON values: nulls first, then numbers, strings, everything else.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        let ordering = compare_values(a.get(&self.column), b.get(&self.column));
        if self.ascending { ordering } else { ordering.reverse() }
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeEvent {
    Insert,
    Update,
    Delete,
}

/// Receives the event and the affected row (the new row for updates).
pub type ChangeListener = Arc<dyn Fn(ChangeEvent, &Row) + Send + Sync>;

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Appends a row. The store assigns `id` when missing and always assigns a
    /// strictly increasing `created_at`. Returns the stored row.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError>;

    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<&Order>,
    ) -> Result<Vec<Row>, StoreError>;

    /// Merges `patch` into every matching row. Returns the number of rows changed.
    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<usize, StoreError>;

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError>;

    /// Push notifications for rows matching `filter`. `event = None` means every kind.
    /// Listeners are called after the mutation is committed, outside any store lock.
    fn subscribe(
        &self,
        table: &str,
        filter: Filter,
        event: Option<ChangeEvent>,
        listener: ChangeListener,
    ) -> Result<Subscription, StoreError>;
}

/// Serializes a record into a row.
pub fn to_row<T: Serialize>(table: &str, record: &T) -> Result<Row, StoreError> {
    match serde_json::to_value(record)? {
        Value::Object(row) => Ok(row),
        other => Err(StoreError::Malformed {
            table: table.to_string(),
            reason: format!("expected an object, got {}", other),
        }),
    }
}

/// Deserializes a row into a record.
pub fn from_row<T: DeserializeOwned>(table: &str, row: Row) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(row)).map_err(|e| StoreError::Malformed {
        table: table.to_string(),
        reason: e.to_string(),
    })
}
