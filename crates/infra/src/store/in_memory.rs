use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use conveyor_core::ExpectedRevision;

use super::query::{Filter, Query};
use super::r#trait::{BackingStore, ForeignKey, Row, StoreError, StoreTransaction};

type Tables = HashMap<String, BTreeMap<String, Slot>>;

/// Committed state of a row plus the write lock of at most one open transaction.
#[derive(Debug, Default)]
struct Slot {
    committed: Option<Row>,
    pending: Option<Pending>,
}

#[derive(Debug)]
struct Pending {
    tx: u64,
    /// `None` marks a pending delete.
    row: Option<Row>,
}

impl Slot {
    fn visible_to(&self, tx: u64) -> Option<&Row> {
        match &self.pending {
            Some(p) if p.tx == tx => p.row.as_ref(),
            _ => self.committed.as_ref(),
        }
    }

    fn locked_by_other(&self, tx: u64) -> bool {
        self.pending.as_ref().is_some_and(|p| p.tx != tx)
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<Tables>,
    next_tx: AtomicU64,
    foreign_keys: Vec<ForeignKey>,
}

impl Shared {
    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

/// In-memory transactional store.
///
/// Intended for tests/dev and single-process deployments. Transactions see
/// committed state plus their own writes (read committed). A written row stays
/// locked by the writing transaction until commit or rollback; conditional
/// writes from other transactions against a locked row affect zero rows
/// instead of blocking.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that enforces the given references on insert, update and delete.
    pub fn with_foreign_keys(foreign_keys: Vec<ForeignKey>) -> Self {
        Self {
            shared: Arc::new(Shared {
                foreign_keys,
                ..Shared::default()
            }),
        }
    }

    /// Committed rows of a table, ordered by id.
    pub fn committed_rows(&self, table: &str) -> Vec<Row> {
        let Ok(tables) = self.shared.tables.read() else {
            return Vec::new();
        };
        tables
            .get(table)
            .map(|rows| rows.values().filter_map(|s| s.committed.clone()).collect())
            .unwrap_or_default()
    }
}

impl BackingStore for InMemoryStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let id = self.shared.next_tx.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Box::new(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            id,
            touched: Vec::new(),
            finished: false,
        }))
    }
}

struct InMemoryTransaction {
    shared: Arc<Shared>,
    id: u64,
    touched: Vec<(String, String)>,
    finished: bool,
}

impl InMemoryTransaction {
    fn stage(&mut self, tables: &mut Tables, table: &str, id: &str, row: Option<Row>) {
        let slot = tables
            .entry(table.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
        slot.pending = Some(Pending { tx: self.id, row });
        self.touched.push((table.to_string(), id.to_string()));
    }

    /// Parents referenced by `row` must be visible to this transaction.
    fn check_parents(&self, tables: &Tables, table: &str, row: &Row) -> Result<(), StoreError> {
        for fk in self.shared.foreign_keys.iter().filter(|fk| fk.table == table) {
            let Some(parent_id) = row.data.get(&fk.column).and_then(|v| v.as_str()) else {
                continue;
            };
            let exists = tables
                .get(&fk.references)
                .and_then(|rows| rows.get(parent_id))
                .and_then(|slot| slot.visible_to(self.id))
                .is_some();
            if !exists {
                return Err(StoreError::ForeignKey(format!(
                    "{table}.{} references missing {} '{parent_id}'",
                    fk.column, fk.references
                )));
            }
        }
        Ok(())
    }

    /// A parent may not be deleted while a child row still references it.
    fn check_children(&self, tables: &Tables, table: &str, id: &str) -> Result<(), StoreError> {
        for fk in self
            .shared
            .foreign_keys
            .iter()
            .filter(|fk| fk.references == table)
        {
            let referenced = tables.get(&fk.table).is_some_and(|rows| {
                rows.values().any(|slot| {
                    slot.visible_to(self.id)
                        .and_then(|r| r.data.get(&fk.column))
                        .and_then(|v| v.as_str())
                        == Some(id)
                })
            });
            if referenced {
                return Err(StoreError::ForeignKey(format!(
                    "{table} '{id}' is still referenced by {}.{}",
                    fk.table, fk.column
                )));
            }
        }
        Ok(())
    }

    fn finish(&mut self, apply: bool) -> Result<(), StoreError> {
        self.finished = true;
        let touched = std::mem::take(&mut self.touched);
        let mut tables = self.shared.write()?;
        for (table, id) in touched {
            let Some(rows) = tables.get_mut(&table) else {
                continue;
            };
            let Some(slot) = rows.get_mut(&id) else {
                continue;
            };
            if slot.pending.as_ref().is_some_and(|p| p.tx == self.id) {
                if let Some(pending) = slot.pending.take() {
                    if apply {
                        slot.committed = pending.row;
                    }
                }
            }
            if slot.committed.is_none() && slot.pending.is_none() {
                rows.remove(&id);
            }
        }
        Ok(())
    }
}

impl StoreTransaction for InMemoryTransaction {
    fn find_by_id(&mut self, table: &str, id: &str) -> Result<Option<Row>, StoreError> {
        let tables = self.shared.read()?;
        Ok(tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .and_then(|slot| slot.visible_to(self.id))
            .cloned())
    }

    fn select(&mut self, table: &str, query: &Query) -> Result<Vec<Row>, StoreError> {
        let tables = self.shared.read()?;
        let mut rows: Vec<Row> = tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter_map(|slot| slot.visible_to(self.id))
                    .filter(|row| query.matches(&row.data))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| query.compare(&a.id, &a.data, &b.id, &b.data));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn count(&mut self, table: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        let tables = self.shared.read()?;
        let count = tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter_map(|slot| slot.visible_to(self.id))
                    .filter(|row| filters.iter().all(|f| f.matches(&row.data)))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as u64)
    }

    fn insert(&mut self, table: &str, row: &Row) -> Result<(), StoreError> {
        if self.insert_if_absent(table, row)? == 0 {
            return Err(StoreError::Duplicate {
                table: table.to_string(),
                id: row.id.clone(),
            });
        }
        Ok(())
    }

    fn insert_if_absent(&mut self, table: &str, row: &Row) -> Result<u64, StoreError> {
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.write()?;
        if let Some(slot) = tables.get(table).and_then(|rows| rows.get(&row.id)) {
            if slot.visible_to(self.id).is_some() || slot.locked_by_other(self.id) {
                return Ok(0);
            }
        }
        self.check_parents(&tables, table, row)?;
        self.stage(&mut tables, table, &row.id, Some(row.clone()));
        Ok(1)
    }

    fn update(
        &mut self,
        table: &str,
        row: &Row,
        expected: ExpectedRevision,
        guard: &[Filter],
    ) -> Result<u64, StoreError> {
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.write()?;
        let Some(slot) = tables.get(table).and_then(|rows| rows.get(&row.id)) else {
            return Ok(0);
        };
        if slot.locked_by_other(self.id) {
            return Ok(0);
        }
        let Some(current) = slot.visible_to(self.id) else {
            return Ok(0);
        };
        if !expected.matches(current.revision) || !guard.iter().all(|f| f.matches(&current.data))
        {
            return Ok(0);
        }
        self.check_parents(&tables, table, row)?;
        self.stage(&mut tables, table, &row.id, Some(row.clone()));
        Ok(1)
    }

    fn delete(
        &mut self,
        table: &str,
        id: &str,
        expected: ExpectedRevision,
    ) -> Result<u64, StoreError> {
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.write()?;
        let Some(slot) = tables.get(table).and_then(|rows| rows.get(id)) else {
            return Ok(0);
        };
        if slot.locked_by_other(self.id) {
            return Ok(0);
        }
        let Some(current) = slot.visible_to(self.id) else {
            return Ok(0);
        };
        if !expected.matches(current.revision) {
            return Ok(0);
        }
        self.check_children(&tables, table, id)?;
        self.stage(&mut tables, table, id, None);
        Ok(1)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish(true)
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish(false)
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish(false);
        }
    }
}
