//! Postgres-backed store implementation.
//!
//! Every logical table is a physical table `(id TEXT PRIMARY KEY, revision BIGINT,
//! data JSONB)`. Query filters are translated to JSONB expressions on `data`, and
//! conditional writes become `UPDATE .. WHERE id = $1 AND revision = $2 AND <guard>`,
//! so the row lock taken by Postgres plus re-evaluation of the predicate under
//! READ COMMITTED gives the "exactly one writer sees 1 row affected" guarantee.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (foreign key violation) | `23503` | `ForeignKey` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Connection` |
//! | Other | N/A | `Backend` |
//!
//! ## Sync Facade
//!
//! `StoreTransaction` is synchronous. Each call is driven to completion with
//! `Handle::block_on` on the runtime captured at construction, so transactions
//! must be used from threads that are not themselves runtime workers (the async
//! executor's worker pool, `spawn_blocking`).

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row as SqlxRow, Transaction};
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use conveyor_core::ExpectedRevision;

use super::query::{Direction, Filter, ID_FIELD, Query};
use super::r#trait::{BackingStore, Row, StoreError, StoreTransaction};

/// Postgres-backed transactional store.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
    handle: Handle,
    tables: Arc<HashSet<String>>,
}

impl PostgresStore {
    /// Create a store over an existing pool, bound to the current tokio runtime.
    pub fn new<'a>(
        pool: PgPool,
        tables: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, StoreError> {
        let handle = Handle::try_current().map_err(|_| {
            StoreError::Backend(
                "PostgresStore requires a tokio runtime; construct it from within one".to_string(),
            )
        })?;
        Ok(Self::with_handle(pool, handle, tables))
    }

    pub fn with_handle<'a>(
        pool: PgPool,
        handle: Handle,
        tables: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
            tables: Arc::new(tables.into_iter().map(str::to_string).collect()),
        }
    }

    /// Connect a pool and bind the store to the current runtime.
    pub async fn connect<'a>(
        url: &str,
        max_connections: u32,
        tables: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Self::new(pool, tables)
    }

    /// Create every known table if it does not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut tables: Vec<_> = self.tables.iter().collect();
        tables.sort();
        for table in tables {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id TEXT PRIMARY KEY, \
                 revision BIGINT NOT NULL, \
                 data JSONB NOT NULL)"
            );
            sqlx::query(&ddl)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            debug!(table = %table, "table ensured");
        }
        Ok(())
    }
}

impl BackingStore for PostgresStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction {
            tx: Some(tx),
            handle: self.handle.clone(),
            tables: Arc::clone(&self.tables),
        }))
    }
}

struct PostgresTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    handle: Handle,
    tables: Arc<HashSet<String>>,
}

impl PostgresTransaction {
    fn table<'t>(&self, table: &'t str) -> Result<&'t str, StoreError> {
        if self.tables.contains(table) {
            Ok(table)
        } else {
            Err(StoreError::Backend(format!("unknown table '{table}'")))
        }
    }

    fn parts(&mut self) -> Result<(&Handle, &mut Transaction<'static, Postgres>), StoreError> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StoreError::Backend("transaction already finished".to_string()))?;
        Ok((&self.handle, tx))
    }
}

impl StoreTransaction for PostgresTransaction {
    fn find_by_id(&mut self, table: &str, id: &str) -> Result<Option<Row>, StoreError> {
        let table = self.table(table)?;
        let (handle, tx) = self.parts()?;
        let sql = format!("SELECT id, revision, data FROM {table} WHERE id = $1");
        let row = handle
            .block_on(sqlx::query(&sql).bind(id).fetch_optional(&mut **tx))
            .map_err(|e| map_sqlx_error("find_by_id", e))?;
        row.map(|r| decode_row(&r)).transpose()
    }

    fn select(&mut self, table: &str, query: &Query) -> Result<Vec<Row>, StoreError> {
        let table = self.table(table)?;
        let mut qb = QueryBuilder::<Postgres>::new("SELECT id, revision, data FROM ");
        qb.push(table);
        push_where(&mut qb, &query.filters, true)?;
        push_order(&mut qb, query)?;
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }

        let (handle, tx) = self.parts()?;
        let rows = handle
            .block_on(qb.build().fetch_all(&mut **tx))
            .map_err(|e| map_sqlx_error("select", e))?;
        rows.iter().map(decode_row).collect()
    }

    fn count(&mut self, table: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        let table = self.table(table)?;
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM ");
        qb.push(table);
        push_where(&mut qb, filters, true)?;

        let (handle, tx) = self.parts()?;
        let row = handle
            .block_on(qb.build().fetch_one(&mut **tx))
            .map_err(|e| map_sqlx_error("count", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| StoreError::Serialization(format!("failed to read total: {e}")))?;
        Ok(total.max(0) as u64)
    }

    fn insert(&mut self, table: &str, row: &Row) -> Result<(), StoreError> {
        let table = self.table(table)?;
        let (handle, tx) = self.parts()?;
        let sql = format!("INSERT INTO {table} (id, revision, data) VALUES ($1, $2, $3)");
        handle
            .block_on(
                sqlx::query(&sql)
                    .bind(&row.id)
                    .bind(row.revision as i64)
                    .bind(&row.data)
                    .execute(&mut **tx),
            )
            .map_err(|e| match map_sqlx_error("insert", e) {
                StoreError::Duplicate { .. } => StoreError::Duplicate {
                    table: table.to_string(),
                    id: row.id.clone(),
                },
                other => other,
            })?;
        Ok(())
    }

    fn insert_if_absent(&mut self, table: &str, row: &Row) -> Result<u64, StoreError> {
        let table = self.table(table)?;
        let (handle, tx) = self.parts()?;
        let sql = format!(
            "INSERT INTO {table} (id, revision, data) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO NOTHING"
        );
        let result = handle
            .block_on(
                sqlx::query(&sql)
                    .bind(&row.id)
                    .bind(row.revision as i64)
                    .bind(&row.data)
                    .execute(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("insert_if_absent", e))?;
        Ok(result.rows_affected())
    }

    fn update(
        &mut self,
        table: &str,
        row: &Row,
        expected: ExpectedRevision,
        guard: &[Filter],
    ) -> Result<u64, StoreError> {
        let table = self.table(table)?;
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE ");
        qb.push(table);
        qb.push(" SET revision = ");
        qb.push_bind(row.revision as i64);
        qb.push(", data = ");
        qb.push_bind(row.data.clone());
        qb.push(" WHERE id = ");
        qb.push_bind(row.id.clone());
        if let ExpectedRevision::Exact(revision) = expected {
            qb.push(" AND revision = ");
            qb.push_bind(revision as i64);
        }
        push_where(&mut qb, guard, false)?;

        let (handle, tx) = self.parts()?;
        let result = handle
            .block_on(qb.build().execute(&mut **tx))
            .map_err(|e| map_sqlx_error("update", e))?;
        Ok(result.rows_affected())
    }

    fn delete(
        &mut self,
        table: &str,
        id: &str,
        expected: ExpectedRevision,
    ) -> Result<u64, StoreError> {
        let table = self.table(table)?;
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM ");
        qb.push(table);
        qb.push(" WHERE id = ");
        qb.push_bind(id.to_string());
        if let ExpectedRevision::Exact(revision) = expected {
            qb.push(" AND revision = ");
            qb.push_bind(revision as i64);
        }

        let (handle, tx) = self.parts()?;
        let result = handle
            .block_on(qb.build().execute(&mut **tx))
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => self
                .handle
                .block_on(tx.commit())
                .map_err(|e| map_sqlx_error("commit_transaction", e)),
            None => Err(StoreError::Backend("transaction already finished".to_string())),
        }
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => self
                .handle
                .block_on(tx.rollback())
                .map_err(|e| map_sqlx_error("rollback", e)),
            None => Ok(()),
        }
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Row, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Serialization(format!("failed to decode row: {e}"));
    let id: String = row.try_get("id").map_err(decode)?;
    let revision: i64 = row.try_get("revision").map_err(decode)?;
    let data: JsonValue = row.try_get("data").map_err(decode)?;
    Ok(Row {
        id,
        revision: revision.max(0) as u64,
        data,
    })
}

/// Field names are interpolated into SQL, so only plain identifiers are accepted.
fn checked_field(field: &str) -> Result<&str, StoreError> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(field)
    } else {
        Err(StoreError::Backend(format!("invalid field name '{field}'")))
    }
}

fn push_where(
    qb: &mut QueryBuilder<'_, Postgres>,
    filters: &[Filter],
    leading: bool,
) -> Result<(), StoreError> {
    for (idx, filter) in filters.iter().enumerate() {
        qb.push(if idx == 0 && leading { " WHERE " } else { " AND " });
        let field = checked_field(filter.field())?;
        match filter {
            Filter::Eq(_, value) if value.is_null() => {
                qb.push(format!("NULLIF(data->'{field}', 'null'::jsonb) IS NULL"));
            }
            Filter::Eq(_, value) => {
                qb.push(format!("data->'{field}' = "));
                qb.push_bind(value.clone());
            }
            Filter::IsNull(_) => {
                qb.push(format!("NULLIF(data->'{field}', 'null'::jsonb) IS NULL"));
            }
            Filter::NotNull(_) => {
                qb.push(format!("NULLIF(data->'{field}', 'null'::jsonb) IS NOT NULL"));
            }
            Filter::AtMost(_, bound) => {
                qb.push(format!("(data->>'{field}')::bigint <= "));
                qb.push_bind(*bound);
            }
            Filter::GreaterThan(_, bound) => {
                qb.push(format!("(data->>'{field}')::bigint > "));
                qb.push_bind(*bound);
            }
            Filter::NullOrAtMost(_, bound) => {
                qb.push(format!(
                    "((data->>'{field}') IS NULL OR (data->>'{field}')::bigint <= "
                ));
                qb.push_bind(*bound);
                qb.push(")");
            }
        }
    }
    Ok(())
}

fn push_order(qb: &mut QueryBuilder<'_, Postgres>, query: &Query) -> Result<(), StoreError> {
    qb.push(" ORDER BY ");
    for key in &query.order {
        let dir = match key.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        if key.field == ID_FIELD {
            qb.push(format!("id {dir}, "));
        } else {
            let field = checked_field(&key.field)?;
            qb.push(format!(
                "NULLIF(data->'{field}', 'null'::jsonb) {dir} NULLS FIRST, "
            ));
        }
    }
    qb.push("id ASC");
    Ok(())
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate {
                    table: db_err.table().unwrap_or_default().to_string(),
                    id: String::new(),
                },
                Some("23503") => StoreError::ForeignKey(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            StoreError::Connection(format!("{operation}: {err}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}
