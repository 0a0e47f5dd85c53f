//! In-process store
//!
//! Same upsert and delete semantics as the database backends. Used by the
//! test suites and by `--dry-run`.

use async_trait::async_trait;
use chrono::DateTime;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};

use super::{DeleteCondition, RecordStore};
use crate::error::StoreError;
use crate::models::StoreRow;

type Table = BTreeMap<String, StoreRow>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
    upsert_calls: AtomicU64,
    delete_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, Table>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a row directly, bypassing upsert bookkeeping
    pub fn seed(&self, table: &str, key: &str, row: StoreRow) {
        self.tables()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), row);
    }

    pub fn get(&self, table: &str, key: &str) -> Option<StoreRow> {
        self.tables().get(table).and_then(|t| t.get(key)).cloned()
    }

    /// Rows ordered by key
    pub fn rows(&self, table: &str) -> Vec<StoreRow> {
        self.tables()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn keys(&self, table: &str) -> Vec<String> {
        self.tables()
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, table: &str) -> usize {
        self.tables().get(table).map(Table::len).unwrap_or(0)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(AtomicOrdering::SeqCst)
    }
}

fn key_text(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Order two stored values: timestamps chronologically, numbers
/// numerically, other strings lexically
fn compare(a: &serde_json::Value, b: &serde_json::Value) -> Option<Ordering> {
    use serde_json::Value;
    match (a, b) {
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(dx), Ok(dy)) => Some(dx.cmp(&dy)),
                _ => Some(x.cmp(y)),
            }
        },
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        _ => None,
    }
}

fn is_match(row: &StoreRow, field: &str, condition: &DeleteCondition) -> bool {
    let current = row.get(field).filter(|v| !v.is_null());
    match (condition, current) {
        (DeleteCondition::Any, _) => true,
        (_, None) => true,
        (DeleteCondition::LessThan(bound), Some(v)) => compare(v, bound) == Some(Ordering::Less),
        (DeleteCondition::NotEqual(bound), Some(v)) => match compare(v, bound) {
            Some(ord) => ord != Ordering::Equal,
            None => v != bound,
        },
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(
        &self,
        table: &str,
        rows: &[StoreRow],
        conflict_key: &str,
    ) -> Result<u64, StoreError> {
        self.upsert_calls.fetch_add(1, AtomicOrdering::SeqCst);

        // validate the whole call before touching the table
        let mut seen = HashSet::with_capacity(rows.len());
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key = key_text(row.get(conflict_key)).ok_or_else(|| {
                StoreError::rejected(format!("null value in column \"{}\"", conflict_key))
            })?;
            if !seen.insert(key.clone()) {
                return Err(StoreError::rejected(format!(
                    "ON CONFLICT command cannot affect row a second time (key {})",
                    key
                )));
            }
            keyed.push((key, row));
        }

        let mut tables = self.tables();
        let target = tables.entry(table.to_string()).or_default();
        for (key, row) in keyed {
            let existing = target.entry(key).or_default();
            for (column, value) in row {
                existing.insert(column.clone(), value.clone());
            }
        }

        Ok(rows.len() as u64)
    }

    async fn delete_where(
        &self,
        table: &str,
        field: &str,
        condition: &DeleteCondition,
    ) -> Result<u64, StoreError> {
        self.delete_calls.fetch_add(1, AtomicOrdering::SeqCst);

        let mut tables = self.tables();
        let Some(target) = tables.get_mut(table) else {
            return Ok(0);
        };

        let before = target.len();
        target.retain(|_, row| !is_match(row, field, condition));
        Ok((before - target.len()) as u64)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
