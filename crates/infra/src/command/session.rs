//! Sessions and the entity cache (identity map).
//!
//! Within one command context every lookup of the same `(entity type, id)`
//! returns the same [`Shared`] instance, so later code sees earlier in-memory
//! mutations without re-querying. At flush time the session diffs every loaded
//! entity against the snapshot taken when it was loaded and writes only what
//! changed, each write guarded by the revision that was read.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value as JsonValue;
use tracing::trace;

use conveyor_core::{EngineError, EngineResult, Entity, ExpectedRevision};

use crate::store::{Filter, Query, Row, StoreTransaction};

use super::engine::EngineConfiguration;

/// A cached entity instance shared by everything in the same unit of work.
pub type Shared<E> = Rc<RefCell<E>>;

/// Per-unit-of-work state that is flushed before the transaction commits.
pub trait Session: Any {
    fn flush(
        &mut self,
        tx: &mut dyn StoreTransaction,
        engine: &EngineConfiguration,
    ) -> EngineResult<()>;

    fn close(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Opens sessions of one type for new command contexts.
pub trait SessionFactory: Send + Sync {
    fn session_type(&self) -> TypeId;

    fn open_session(&self) -> Box<dyn Session>;
}

/// Decides whether a cached entity belongs in the result of a query.
///
/// Both the rows freshly loaded for the query and the cached candidates are
/// passed in so that implementations can validate a cache hit against either.
pub trait CachedEntityMatcher<E> {
    fn is_retained(&self, loaded: &[Shared<E>], cached: &[Shared<E>], entity: &E) -> bool;
}

/// Matcher that re-evaluates the query's own filters on the in-memory state.
#[derive(Debug, Clone, Copy)]
pub struct QueryMatcher<'q> {
    query: &'q Query,
}

impl<'q> QueryMatcher<'q> {
    pub fn new(query: &'q Query) -> Self {
        Self { query }
    }
}

impl<E: Entity> CachedEntityMatcher<E> for QueryMatcher<'_> {
    fn is_retained(&self, _loaded: &[Shared<E>], _cached: &[Shared<E>], entity: &E) -> bool {
        serde_json::to_value(entity)
            .map(|data| self.query.matches(&data))
            .unwrap_or(false)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum EntryState {
    /// Read from (or written through to) the store; flushed if it differs from the snapshot.
    Loaded,
    /// Created in this unit of work; inserted at flush.
    Inserted,
    /// Marked for deletion; deleted at flush.
    Deleted,
    /// Already deleted from the store by an immediate write.
    Removed,
}

struct CacheEntry {
    table: &'static str,
    id: String,
    value: Box<dyn Any>,
    snapshot: JsonValue,
    state: EntryState,
    seq: u64,
    encode: fn(&dyn Any) -> EngineResult<(u64, JsonValue)>,
    set_revision: fn(&dyn Any, u64),
}

fn encode_entry<E: Entity>(value: &dyn Any) -> EngineResult<(u64, JsonValue)> {
    let shared = value
        .downcast_ref::<Shared<E>>()
        .ok_or_else(|| EngineError::illegal_state("entity cache type mismatch"))?;
    let entity = shared.borrow();
    Ok((entity.revision(), serde_json::to_value(&*entity)?))
}

fn set_entry_revision<E: Entity>(value: &dyn Any, revision: u64) {
    if let Some(shared) = value.downcast_ref::<Shared<E>>() {
        shared.borrow_mut().set_revision(revision);
    }
}

type CacheKey = (TypeId, String);

/// Built-in session holding the entity cache.
#[derive(Default)]
pub struct EntitySession {
    entries: HashMap<CacheKey, CacheEntry>,
    next_seq: u64,
}

impl EntitySession {
    pub fn new() -> Self {
        Self::default()
    }

    fn key<E: Entity>(id: &str) -> CacheKey {
        (TypeId::of::<E>(), id.to_string())
    }

    fn cached<E: Entity>(&self, id: &str) -> Option<(EntryState, Shared<E>)> {
        let entry = self.entries.get(&Self::key::<E>(id))?;
        let shared = entry.value.downcast_ref::<Shared<E>>()?;
        Some((entry.state, Rc::clone(shared)))
    }

    fn register<E: Entity>(
        &mut self,
        entity: E,
        snapshot: JsonValue,
        state: EntryState,
    ) -> Shared<E> {
        let id = entity.id();
        let shared = Rc::new(RefCell::new(entity));
        self.next_seq += 1;
        self.entries.insert(
            Self::key::<E>(&id),
            CacheEntry {
                table: E::TABLE,
                id,
                value: Box::new(Rc::clone(&shared)),
                snapshot,
                state,
                seq: self.next_seq,
                encode: encode_entry::<E>,
                set_revision: set_entry_revision::<E>,
            },
        );
        shared
    }

    /// Cached, not deleted entities of type `E`.
    fn live<E: Entity>(&self) -> Vec<Shared<E>> {
        let type_id = TypeId::of::<E>();
        self.entries
            .iter()
            .filter(|((t, _), e)| {
                *t == type_id && matches!(e.state, EntryState::Loaded | EntryState::Inserted)
            })
            .filter_map(|(_, e)| e.value.downcast_ref::<Shared<E>>().map(Rc::clone))
            .collect()
    }

    fn write_inserts(
        &mut self,
        tx: &mut dyn StoreTransaction,
        engine: &EngineConfiguration,
    ) -> EngineResult<()> {
        let order = engine.entity_order();
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Inserted)
            .map(|(k, e)| (order.rank(e.table), e.seq, k.clone()))
            .collect();
        keys.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        for (_, _, key) in keys {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            let (_, data) = (entry.encode)(entry.value.as_ref())?;
            tx.insert(entry.table, &Row::new(entry.id.clone(), 1, data.clone()))?;
            (entry.set_revision)(entry.value.as_ref(), 1);
            trace!(table = entry.table, id = %entry.id, "inserted");
            entry.snapshot = data;
            entry.state = EntryState::Loaded;
        }
        Ok(())
    }

    fn write_updates(&mut self, tx: &mut dyn StoreTransaction) -> EngineResult<()> {
        let mut dirty: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Loaded)
            .map(|(k, e)| (e.seq, k.clone()))
            .collect();
        dirty.sort();

        for (_, key) in dirty {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            let (revision, data) = (entry.encode)(entry.value.as_ref())?;
            if data == entry.snapshot {
                continue;
            }
            let next = revision + 1;
            let row = Row::new(entry.id.clone(), next, data.clone());
            let affected = tx.update(entry.table, &row, ExpectedRevision::Exact(revision), &[])?;
            if affected == 0 {
                return Err(EngineError::optimistic_lock(entry.table, entry.id.clone(), revision));
            }
            (entry.set_revision)(entry.value.as_ref(), next);
            trace!(table = entry.table, id = %entry.id, revision = next, "updated");
            entry.snapshot = data;
        }
        Ok(())
    }

    fn write_deletes(
        &mut self,
        tx: &mut dyn StoreTransaction,
        engine: &EngineConfiguration,
    ) -> EngineResult<()> {
        let order = engine.entity_order();
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Deleted)
            .map(|(k, e)| (order.rank(e.table), e.seq, k.clone()))
            .collect();
        // children before parents
        keys.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));

        for (_, _, key) in keys {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            let (revision, _) = (entry.encode)(entry.value.as_ref())?;
            let affected = tx.delete(entry.table, &entry.id, ExpectedRevision::Exact(revision))?;
            if affected == 0 {
                return Err(EngineError::optimistic_lock(entry.table, entry.id.clone(), revision));
            }
            trace!(table = entry.table, id = %entry.id, "deleted");
            entry.state = EntryState::Removed;
        }
        Ok(())
    }
}

impl Session for EntitySession {
    fn flush(
        &mut self,
        tx: &mut dyn StoreTransaction,
        engine: &EngineConfiguration,
    ) -> EngineResult<()> {
        self.write_inserts(tx, engine)?;
        self.write_updates(tx)?;
        self.write_deletes(tx, engine)
    }

    fn close(&mut self) {
        self.entries.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Factory for [`EntitySession`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EntitySessionFactory;

impl SessionFactory for EntitySessionFactory {
    fn session_type(&self) -> TypeId {
        TypeId::of::<EntitySession>()
    }

    fn open_session(&self) -> Box<dyn Session> {
        Box::new(EntitySession::new())
    }
}

/// Entity operations for one command context.
///
/// Reads go through the cache. `insert`/`update`/`delete` are staged and
/// written at flush; the `try_*_now` variants write through immediately and
/// report whether the conditional write won, which is what lease-style claims
/// need.
pub struct EntityManager<'a> {
    session: &'a mut EntitySession,
    tx: &'a mut dyn StoreTransaction,
}

impl<'a> EntityManager<'a> {
    pub(crate) fn new(session: &'a mut EntitySession, tx: &'a mut dyn StoreTransaction) -> Self {
        Self { session, tx }
    }

    pub fn find_by_id<E: Entity>(&mut self, id: &str) -> EngineResult<Option<Shared<E>>> {
        if let Some((state, shared)) = self.session.cached::<E>(id) {
            return Ok(match state {
                EntryState::Loaded | EntryState::Inserted => Some(shared),
                EntryState::Deleted | EntryState::Removed => None,
            });
        }
        match self.tx.find_by_id(E::TABLE, id)? {
            Some(row) => Ok(Some(self.load_row::<E>(row)?)),
            None => Ok(None),
        }
    }

    /// Like [`find_by_id`](Self::find_by_id) but a missing row is an error.
    pub fn get<E: Entity>(&mut self, id: &str) -> EngineResult<Shared<E>> {
        self.find_by_id::<E>(id)?
            .ok_or_else(|| EngineError::not_found(E::TABLE, id))
    }

    /// Run `query` against the store and merge the result with the cache.
    ///
    /// Loaded rows that are already cached resolve to the cached instance.
    /// Every candidate, loaded or cached, is kept only if `matcher` retains its
    /// current in-memory state. The result is de-duplicated by id and ordered
    /// and limited like the query.
    pub fn find_by_query<E: Entity>(
        &mut self,
        query: &Query,
        matcher: &dyn CachedEntityMatcher<E>,
    ) -> EngineResult<Vec<Shared<E>>> {
        let rows = self.tx.select(E::TABLE, query)?;
        let mut loaded = Vec::with_capacity(rows.len());
        for row in rows {
            match self.session.cached::<E>(&row.id) {
                Some((EntryState::Loaded | EntryState::Inserted, shared)) => loaded.push(shared),
                Some(_) => {}
                None => loaded.push(self.load_row::<E>(row)?),
            }
        }
        let cached = self.session.live::<E>();

        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::new();
        for candidate in loaded.iter().chain(cached.iter()) {
            let id = candidate.borrow().id();
            if !seen.insert(id.clone()) {
                continue;
            }
            if matcher.is_retained(&loaded, &cached, &candidate.borrow()) {
                let data = serde_json::to_value(&*candidate.borrow())?;
                result.push((id, data, Rc::clone(candidate)));
            }
        }
        result.sort_by(|a, b| query.compare(&a.0, &a.1, &b.0, &b.1));
        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        Ok(result.into_iter().map(|(_, _, e)| e).collect())
    }

    /// Count rows in the store, including this transaction's own immediate writes.
    /// Staged (unflushed) changes are not counted.
    pub fn count<E: Entity>(&mut self, filters: &[Filter]) -> EngineResult<u64> {
        Ok(self.tx.count(E::TABLE, filters)?)
    }

    /// Stage a new entity for insertion at flush.
    pub fn insert<E: Entity>(&mut self, entity: E) -> EngineResult<Shared<E>> {
        let id = entity.id();
        if self.session.cached::<E>(&id).is_some() {
            return Err(EngineError::illegal_state(format!(
                "{} '{id}' is already part of this unit of work",
                E::TABLE
            )));
        }
        Ok(self
            .session
            .register(entity, JsonValue::Null, EntryState::Inserted))
    }

    /// Replace an entity's state with a detached value.
    ///
    /// The cached revision is kept, so the flush is still checked against the
    /// revision originally read.
    pub fn update<E: Entity>(&mut self, mut entity: E) -> EngineResult<Shared<E>> {
        let id = entity.id();
        match self.session.cached::<E>(&id) {
            Some((EntryState::Loaded | EntryState::Inserted, shared)) => {
                entity.set_revision(shared.borrow().revision());
                *shared.borrow_mut() = entity;
                Ok(shared)
            }
            Some(_) => Err(EngineError::not_found(E::TABLE, id)),
            // unknown snapshot: always written at flush
            None => Ok(self
                .session
                .register(entity, JsonValue::Null, EntryState::Loaded)),
        }
    }

    /// Stage an entity for deletion at flush.
    pub fn delete<E: Entity>(&mut self, entity: &Shared<E>) -> EngineResult<()> {
        let id = entity.borrow().id();
        let key = EntitySession::key::<E>(&id);
        let Some(state) = self.session.entries.get(&key).map(|e| e.state) else {
            return Err(EngineError::illegal_state(format!(
                "{} '{id}' is not part of this unit of work",
                E::TABLE
            )));
        };
        match state {
            EntryState::Inserted => {
                self.session.entries.remove(&key);
            }
            EntryState::Loaded => {
                if let Some(entry) = self.session.entries.get_mut(&key) {
                    entry.state = EntryState::Deleted;
                }
            }
            EntryState::Deleted | EntryState::Removed => {}
        }
        Ok(())
    }

    /// Apply `mutate` and write it through immediately, guarded by the current
    /// revision and `guard`. Returns `false` (leaving the cached entity untouched)
    /// if the conditional write affected no row.
    pub fn try_update_now<E: Entity>(
        &mut self,
        entity: &Shared<E>,
        guard: &[Filter],
        mutate: impl FnOnce(&mut E),
    ) -> EngineResult<bool> {
        let mut next = entity.borrow().clone();
        mutate(&mut next);
        let id = next.id();
        let key = EntitySession::key::<E>(&id);
        if self.session.entries.get(&key).map(|e| e.state) != Some(EntryState::Loaded) {
            return Err(EngineError::illegal_state(format!(
                "{} '{id}' must be loaded before a conditional write",
                E::TABLE
            )));
        }

        let revision = entity.borrow().revision();
        let data = serde_json::to_value(&next)?;
        let row = Row::new(id.clone(), revision + 1, data.clone());
        let affected = self
            .tx
            .update(E::TABLE, &row, ExpectedRevision::Exact(revision), guard)?;
        if affected == 0 {
            return Ok(false);
        }

        next.set_revision(revision + 1);
        *entity.borrow_mut() = next;
        if let Some(entry) = self.session.entries.get_mut(&key) {
            entry.snapshot = data;
        }
        Ok(true)
    }

    /// Insert immediately unless the id already exists.
    pub fn try_insert_now<E: Entity>(&mut self, mut entity: E) -> EngineResult<Option<Shared<E>>> {
        let data = serde_json::to_value(&entity)?;
        let row = Row::new(entity.id(), 1, data.clone());
        if self.tx.insert_if_absent(E::TABLE, &row)? == 0 {
            return Ok(None);
        }
        entity.set_revision(1);
        self.session.entries.remove(&EntitySession::key::<E>(&row.id));
        Ok(Some(self.session.register(entity, data, EntryState::Loaded)))
    }

    /// Delete immediately, guarded by the current revision.
    pub fn try_delete_now<E: Entity>(&mut self, entity: &Shared<E>) -> EngineResult<bool> {
        let (id, revision) = {
            let e = entity.borrow();
            (e.id(), e.revision())
        };
        let affected = self
            .tx
            .delete(E::TABLE, &id, ExpectedRevision::Exact(revision))?;
        if affected == 0 {
            return Ok(false);
        }
        if let Some(entry) = self.session.entries.get_mut(&EntitySession::key::<E>(&id)) {
            entry.state = EntryState::Removed;
        }
        Ok(true)
    }

    fn load_row<E: Entity>(&mut self, row: Row) -> EngineResult<Shared<E>> {
        let mut entity: E = serde_json::from_value(row.data)?;
        entity.set_revision(row.revision);
        let snapshot = serde_json::to_value(&entity)?;
        Ok(self.session.register(entity, snapshot, EntryState::Loaded))
    }
}
