//! In-memory tables that publish a mutation event per affected row.

mod records;

pub use records::by_list;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::RwLock;

use thiserror::Error;
use tracing::trace;

use crate::cache::{Action, Fields, MutationPublisher, Signals, rw_read, rw_write};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DbError {
    #[error("{model} doesn't exist")]
    NotFound { model: &'static str },
    #[error("duplicate {model} record `{key}`")]
    Duplicate { model: &'static str, key: String },
}

/// A row type stored in a [`MemoryTable`].
pub trait Record: Clone + Send + Sync + 'static {
    type Key: Clone + Ord + Debug + Send + Sync;

    /// Model name; also names the invalidation registry mutations go to.
    const MODEL: &'static str;

    fn key(&self) -> Self::Key;

    /// Full column set as seen by invalidation filters.
    fn fields(&self) -> Fields;
}

/// Keyed rows of one model.
///
/// Every write publishes through the model's [`MutationPublisher`] once per
/// affected row, after the table lock is released.
pub struct MemoryTable<R: Record> {
    rows: RwLock<BTreeMap<R::Key, R>>,
    publisher: MutationPublisher,
}

impl<R: Record> MemoryTable<R> {
    pub fn new(signals: &Signals) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            publisher: signals.publisher(R::MODEL),
        }
    }

    pub fn get(&self, key: &R::Key) -> Result<R, DbError> {
        trace!(model = R::MODEL, ?key, "select one");
        rw_read(&self.rows, R::MODEL, "get")
            .get(key)
            .cloned()
            .ok_or(DbError::NotFound { model: R::MODEL })
    }

    pub fn select(&self, predicate: impl Fn(&R) -> bool) -> Vec<R> {
        trace!(model = R::MODEL, "select");
        rw_read(&self.rows, R::MODEL, "select")
            .values()
            .filter(|row| predicate(row))
            .cloned()
            .collect()
    }

    pub fn create(&self, record: R) -> Result<R, DbError> {
        let key = record.key();
        {
            let mut rows = rw_write(&self.rows, R::MODEL, "create");
            if rows.contains_key(&key) {
                return Err(DbError::Duplicate {
                    model: R::MODEL,
                    key: format!("{key:?}"),
                });
            }
            rows.insert(key, record.clone());
        }
        self.publisher.created(record.fields());
        Ok(record)
    }

    /// Apply `change` to one row. The key columns must stay untouched.
    pub fn update(&self, key: &R::Key, change: impl FnOnce(&mut R)) -> Result<R, DbError> {
        let updated = {
            let mut rows = rw_write(&self.rows, R::MODEL, "update");
            let row = rows
                .get_mut(key)
                .ok_or(DbError::NotFound { model: R::MODEL })?;
            change(row);
            row.clone()
        };
        self.publisher.updated(updated.fields());
        Ok(updated)
    }

    /// Insert or replace; publishes an update when the row existed.
    pub fn merge(&self, record: R) -> R {
        let existed = rw_write(&self.rows, R::MODEL, "merge")
            .insert(record.key(), record.clone())
            .is_some();
        let action = if existed {
            Action::Update
        } else {
            Action::Create
        };
        self.publisher.publish(action, record.fields());
        record
    }

    pub fn delete(&self, key: &R::Key) -> Result<R, DbError> {
        let removed = rw_write(&self.rows, R::MODEL, "delete")
            .remove(key)
            .ok_or(DbError::NotFound { model: R::MODEL })?;
        self.publisher.deleted(removed.fields());
        Ok(removed)
    }

    /// Delete every matching row; returns them.
    pub fn delete_where(&self, predicate: impl Fn(&R) -> bool) -> Vec<R> {
        let removed: Vec<R> = {
            let mut rows = rw_write(&self.rows, R::MODEL, "delete_where");
            let keys: Vec<R::Key> = rows
                .iter()
                .filter(|(_, row)| predicate(row))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| rows.remove(key)).collect()
        };
        for row in &removed {
            self.publisher.deleted(row.fields());
        }
        removed
    }

    pub fn len(&self) -> usize {
        rw_read(&self.rows, R::MODEL, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
