//! In-process record store
//! Backs the test suite and the binary's `--simulate` mode. Both sides of a relay
//! session share one instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use log::{debug, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::core::events::Subscription;
use crate::relay::store::{ChangeEvent, ChangeListener, Filter, Order, RecordStore, Row, StoreError};

struct Watch {
    table: String,
    filter: Filter,
    event: Option<ChangeEvent>,
    listener: ChangeListener,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<Row>>,
    watches: Vec<(u64, Watch)>,
    next_watch: u64,
    last_created: Option<DateTime<Utc>>,
    fail_writes: bool,
}

impl Tables {
    /// Strictly increasing, microsecond precision, fixed width so that string
    /// order equals time order.
    fn next_timestamp(&mut self) -> String {
        let now = Utc::now().trunc_subsecs(6);
        let stamp = match self.last_created {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_created = Some(stamp);
        stamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn listeners_for(&self, table: &str, event: ChangeEvent, row: &Row) -> Vec<ChangeListener> {
        self.watches
            .iter()
            .filter(|(_, watch)| {
                watch.table == table
                    && watch.event.is_none_or(|wanted| wanted == event)
                    && watch.filter.matches(row)
            })
            .map(|(_, watch)| watch.listener.clone())
            .collect()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Unavailable("writes are disabled".to_string()));
        }
        Ok(())
    }
}

/// Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

fn notify(deliveries: Vec<(ChangeListener, ChangeEvent, Row)>) {
    for (listener, event, row) in deliveries {
        listener(event, &row);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every insert, update and delete fail with `StoreError::Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().rows.get(table).map_or(0, Vec::len)
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, StoreError> {
        let deliveries = {
            let mut tables = self.lock();
            tables.check_writable()?;
            if !matches!(row.get("id"), Some(Value::String(_))) {
                row.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
            }
            let created_at = tables.next_timestamp();
            row.insert("created_at".to_string(), Value::String(created_at));
            tables
                .rows
                .entry(table.to_string())
                .or_default()
                .push(row.clone());
            debug!("Inserted row into {}: {:?}", table, row.get("id"));
            tables
                .listeners_for(table, ChangeEvent::Insert, &row)
                .into_iter()
                .map(|listener| (listener, ChangeEvent::Insert, row.clone()))
                .collect()
        };
        notify(deliveries);
        Ok(row)
    }

    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<&Order>,
    ) -> Result<Vec<Row>, StoreError> {
        let tables = self.lock();
        let mut rows: Vec<Row> = tables
            .rows
            .get(table)
            .map(|rows| rows.iter().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default();
        if let Some(order) = order {
            rows.sort_by(|a, b| order.compare(a, b));
        }
        Ok(rows)
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<usize, StoreError> {
        let (count, deliveries) = {
            let mut tables = self.lock();
            tables.check_writable()?;
            let mut changed = Vec::new();
            if let Some(rows) = tables.rows.get_mut(table) {
                for row in rows.iter_mut().filter(|row| filter.matches(row)) {
                    for (column, value) in &patch {
                        row.insert(column.clone(), value.clone());
                    }
                    changed.push(row.clone());
                }
            }
            let deliveries: Vec<_> = changed
                .iter()
                .flat_map(|row| {
                    tables
                        .listeners_for(table, ChangeEvent::Update, row)
                        .into_iter()
                        .map(move |listener| (listener, ChangeEvent::Update, row.clone()))
                        .collect::<Vec<_>>()
                })
                .collect();
            (changed.len(), deliveries)
        };
        notify(deliveries);
        Ok(count)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError> {
        let (count, deliveries) = {
            let mut tables = self.lock();
            tables.check_writable()?;
            let removed: Vec<Row> = match tables.rows.get_mut(table) {
                Some(rows) => {
                    let (removed, kept): (Vec<Row>, Vec<Row>) = std::mem::take(rows)
                        .into_iter()
                        .partition(|row| filter.matches(row));
                    *rows = kept;
                    removed
                }
                None => Vec::new(),
            };
            let deliveries: Vec<_> = removed
                .iter()
                .flat_map(|row| {
                    tables
                        .listeners_for(table, ChangeEvent::Delete, row)
                        .into_iter()
                        .map(move |listener| (listener, ChangeEvent::Delete, row.clone()))
                        .collect::<Vec<_>>()
                })
                .collect();
            (removed.len(), deliveries)
        };
        if count > 0 {
            debug!("Deleted {} rows from {}", count, table);
        }
        notify(deliveries);
        Ok(count)
    }

    fn subscribe(
        &self,
        table: &str,
        filter: Filter,
        event: Option<ChangeEvent>,
        listener: ChangeListener,
    ) -> Result<Subscription, StoreError> {
        let id = {
            let mut tables = self.lock();
            let id = tables.next_watch;
            tables.next_watch += 1;
            tables.watches.push((
                id,
                Watch {
                    table: table.to_string(),
                    filter,
                    event,
                    listener,
                },
            ));
            id
        };

        let tables = Arc::downgrade(&self.tables);
        Ok(Subscription::new(move || match tables.upgrade() {
            Some(tables) => tables
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .watches
                .retain(|(watch_id, _)| *watch_id != id),
            None => warn!("Store dropped before subscription {} was released", id),
        }))
    }
}
