//! Typed repository over one entity table
//!
//! Every single-statement operation runs on a pooled connection first. A
//! connectivity failure or timeout marks that slot broken and the operation
//! is retried once on a fresh connection; any other error is returned as is.
//!
//! Reads go through the [`ReadCache`]. Lookups by example follow the
//! "default means unset" convention: fields holding their default value do
//! not filter, so a zero or empty value can never be searched for that way.
//! Use [`Repository::find_by_column`] to filter on such values.

use crate::cache::{cache_key, CacheTag, ReadCache};
use crate::config::RepositorySettings;
use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::metadata::EntityMetadata;
use crate::metrics;
use crate::sql::{self, Predicate, Statement};
use crate::timeout::call_timeout;
use crate::value::{read_column, Value};
use db_pool::{ConnectionPool, DbConfig};
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{Connection, PgConnection, Row};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-repository counters
#[derive(Debug, Default)]
pub struct RepositoryStats {
    queries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retries: AtomicU64,
    bulk_batches: AtomicU64,
}

/// Point-in-time copy of [`RepositoryStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Statements sent to the database, retries included
    pub queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Operations retried on a fresh connection
    pub retries: u64,
    /// COPY or UPDATE batches sent by bulk operations
    pub bulk_batches: u64,
}

impl RepositoryStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bulk_batches: self.bulk_batches.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self) {
        self.bulk_batches.fetch_add(1, Ordering::Relaxed);
    }
}

/// Find, save, update, delete and bulk-load one entity type
pub struct Repository<T: Entity> {
    pub(crate) metadata: Arc<EntityMetadata<T>>,
    pub(crate) pool: ConnectionPool,
    pub(crate) cache: ReadCache<Arc<Vec<T>>>,
    pub(crate) settings: RepositorySettings,
    pub(crate) stats: RepositoryStats,
    query_timeout_millis: AtomicU64,
}

impl<T: Entity> Repository<T> {
    /// Open the connection pool for this entity's table
    pub async fn connect(
        metadata: Arc<EntityMetadata<T>>,
        db: DbConfig,
        settings: RepositorySettings,
    ) -> StoreResult<Self> {
        let pool = ConnectionPool::connect(db).await?;
        let cache = ReadCache::new(
            metadata.table(),
            settings.cache_enabled,
            settings.cache_duration,
        );

        debug!(
            table = %metadata.table(),
            pool_size = pool.size(),
            cache_enabled = settings.cache_enabled,
            "Repository ready"
        );

        Ok(Self {
            query_timeout_millis: AtomicU64::new(settings.query_timeout.as_millis() as u64),
            metadata,
            pool,
            cache,
            settings,
            stats: RepositoryStats::default(),
        })
    }

    pub fn metadata(&self) -> &EntityMetadata<T> {
        &self.metadata
    }

    pub fn table(&self) -> &str {
        self.metadata.table()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_millis.load(Ordering::Relaxed))
    }

    /// Default deadline for each attempt of a single-statement operation.
    /// Wrap one call in [`with_timeout`](crate::timeout::with_timeout) to
    /// override it for that call only.
    pub fn set_query_timeout(&self, timeout: Duration) {
        self.query_timeout_millis
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// First row, ordered by key, matching the template's non-default fields
    ///
    /// An all-default template matches every row.
    pub async fn find(&self, template: &T) -> StoreResult<Option<T>> {
        let predicates = sql::example_predicates(&self.metadata, template)?;
        let rows = self
            .read_predicates("find", &predicates, Some(1))
            .await?;
        Ok(rows.first().cloned())
    }

    /// Rows matching the template, at most `limit`
    pub async fn find_all(&self, template: &T, limit: usize) -> StoreResult<Vec<T>> {
        let predicates = sql::example_predicates(&self.metadata, template)?;
        let rows = self
            .read_predicates("find_all", &predicates, Some(limit))
            .await?;
        Ok(rows.as_ref().clone())
    }

    /// Rows matching the template; `None` returns every match
    pub async fn find_many(&self, template: &T, limit: Option<usize>) -> StoreResult<Vec<T>> {
        let predicates = sql::example_predicates(&self.metadata, template)?;
        let rows = self
            .read_predicates("find_many", &predicates, limit)
            .await?;
        Ok(rows.as_ref().clone())
    }

    /// Row with the given key
    pub async fn find_by_key(&self, key: impl Into<Value>) -> StoreResult<Option<T>> {
        let key = key.into().coerce_to(self.metadata.key_type());
        let predicates = [Predicate {
            field: self.metadata.key_index(),
            value: key.clone(),
        }];
        let statement = sql::select(&self.metadata, &predicates, Some(1));
        let cache_key = cache_key(
            self.table(),
            "find_by_key",
            &[(self.metadata.key_column(), &key)],
            None,
        );
        let rows = self
            .cached_read("find_by_key", cache_key, vec![CacheTag::entity(&key)], statement)
            .await?;
        Ok(rows.first().cloned())
    }

    /// First row where `column` equals `value`, default values included
    pub async fn find_by_column(
        &self,
        column: &str,
        value: impl Into<Value>,
    ) -> StoreResult<Option<T>> {
        let field = self.resolve_column(column)?;
        let predicates = [Predicate {
            field,
            value: value
                .into()
                .coerce_to(self.metadata.fields()[field].column_type()),
        }];
        let rows = self
            .read_predicates("find_by_column", &predicates, Some(1))
            .await?;
        Ok(rows.first().cloned())
    }

    /// Every row where `column` is one of `values`
    pub async fn find_all_by_column<I, V>(&self, column: &str, values: I) -> StoreResult<Vec<T>>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let field = self.resolve_column(column)?;
        let column_type = self.metadata.fields()[field].column_type();
        let values: Vec<Value> = values
            .into_iter()
            .map(|v| v.into().coerce_to(column_type))
            .collect();
        if values.is_empty() {
            return Ok(Vec::new());
        }

        let column = self.metadata.column(field);
        let params: Vec<(&str, &Value)> = values.iter().map(|v| (column, v)).collect();
        let cache_key = cache_key(self.table(), "find_all_by_column", &params, None);
        let tags = values.iter().map(|v| self.lookup_tag(field, v)).collect();
        let statement = sql::select_in(&self.metadata, field, &values);

        let rows = self
            .cached_read("find_all_by_column", cache_key, tags, statement)
            .await?;
        Ok(rows.as_ref().clone())
    }

    /// Number of rows matching the template, never cached
    pub async fn count(&self, template: &T) -> StoreResult<i64> {
        let predicates = sql::example_predicates(&self.metadata, template)?;
        let statement = sql::count(&self.metadata, &predicates);
        let row = self.fetch_one("count", statement).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert, or update on key conflict
    ///
    /// A default key of a database-generated type inserts a new row. With
    /// `return_key` the stored key is written back into `entity`.
    pub async fn save(&self, entity: &mut T, return_key: bool) -> StoreResult<()> {
        let key_is_default = self.metadata.key_is_default(entity);
        let statement = if key_is_default {
            if !self.metadata.key_type().is_generated_key() {
                return Err(StoreError::validation(format!(
                    "save on {} requires a key value",
                    self.table()
                )));
            }
            sql::insert(&self.metadata, entity)?
        } else {
            sql::upsert(&self.metadata, entity)?
        };

        let row = self.fetch_optional("save", statement).await?;
        let stored_key = match row {
            Some(row) => Some(read_column(
                &row,
                self.metadata.key_column(),
                self.metadata.key_type(),
            )?),
            None => None,
        };

        if return_key {
            if let Some(key) = &stored_key {
                self.metadata.set_key(entity, key.clone())?;
            }
        }

        let mut tags = self.write_tags(entity)?;
        if let Some(key) = &stored_key {
            tags.push(CacheTag::entity(key));
        }
        tags.push(CacheTag::List);
        self.cache.invalidate(&tags);
        Ok(())
    }

    /// Overwrite every non-key column of the row with the entity's key
    pub async fn update(&self, entity: &T) -> StoreResult<u64> {
        if self.metadata.key_is_default(entity) {
            return Err(StoreError::validation(format!(
                "update on {} requires a key value",
                self.table()
            )));
        }
        if !self.metadata.has_non_key_fields() {
            return Err(StoreError::validation(format!(
                "{} has no updatable columns",
                self.table()
            )));
        }

        let mut changes = Vec::new();
        for index in self.metadata.non_key_indices() {
            changes.push(Predicate {
                field: index,
                value: self.metadata.fields()[index].get(entity)?,
            });
        }
        let statement = sql::update(&self.metadata, self.metadata.key_value(entity)?, &changes);

        let affected = self.execute("update", statement).await?;
        self.cache.invalidate(&self.write_tags(entity)?);
        Ok(affected)
    }

    /// Delete rows matching the template's non-default fields
    ///
    /// An all-default template is rejected; use [`delete_all`](Self::delete_all)
    /// to empty the table.
    pub async fn delete(&self, template: &T) -> StoreResult<u64> {
        let predicates = sql::example_predicates(&self.metadata, template)?;
        if predicates.is_empty() {
            return Err(StoreError::validation(format!(
                "delete on {} requires at least one non-default field",
                self.table()
            )));
        }

        let statement = sql::delete(&self.metadata, &predicates);
        let rows = self.fetch_all("delete", statement).await?;

        let mut tags = Vec::with_capacity(rows.len() + predicates.len());
        for row in &rows {
            let key = read_column(row, self.metadata.key_column(), self.metadata.key_type())?;
            tags.push(CacheTag::entity(&key));
        }
        tags.extend(self.predicate_tags(&predicates));
        self.cache.invalidate(&tags);
        Ok(rows.len() as u64)
    }

    /// Delete every row
    pub async fn delete_all(&self) -> StoreResult<u64> {
        let statement = Statement::new(self.metadata.delete_prefix());
        let affected = self.execute("delete_all", statement).await?;
        self.cache.clear();
        Ok(affected)
    }

    // ------------------------------------------------------------------
    // Cache controls
    // ------------------------------------------------------------------

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_enabled()
    }

    /// Disabling also drops cached results
    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache.set_enabled(enabled);
    }

    pub fn set_cache_duration(&self, duration: Duration) {
        self.cache.set_ttl(duration);
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Drop cached results that involve this entity or its column values
    pub fn invalidate_entity(&self, entity: &T) -> StoreResult<()> {
        self.cache.invalidate(&self.write_tags(entity)?);
        Ok(())
    }

    /// Close pooled connections
    ///
    /// Needs sole ownership. Repositories handed out by an
    /// [`EntityStore`](crate::store::EntityStore) are shared; shut those down
    /// with [`EntityStore::close`](crate::store::EntityStore::close).
    pub async fn close(self) {
        self.cache.clear();
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn resolve_column(&self, column: &str) -> StoreResult<usize> {
        self.metadata.field_index(column).ok_or_else(|| {
            StoreError::validation(format!("unknown column {} on {}", column, self.table()))
        })
    }

    /// Tags a write to `entity` invalidates: its key and every column value
    fn write_tags(&self, entity: &T) -> StoreResult<Vec<CacheTag>> {
        let mut tags = Vec::with_capacity(self.metadata.fields().len());
        if !self.metadata.key_is_default(entity) {
            tags.push(CacheTag::entity(&self.metadata.key_value(entity)?));
        }
        for index in self.metadata.non_key_indices() {
            let value = self.metadata.fields()[index].get(entity)?;
            tags.push(CacheTag::column(self.metadata.column(index), &value));
        }
        Ok(tags)
    }

    fn predicate_tags(&self, predicates: &[Predicate]) -> Vec<CacheTag> {
        predicates
            .iter()
            .map(|p| self.lookup_tag(p.field, &p.value))
            .collect()
    }

    /// Writes tag the key as an entity, so lookups on the key column must too
    fn lookup_tag(&self, field: usize, value: &Value) -> CacheTag {
        if field == self.metadata.key_index() {
            CacheTag::entity(value)
        } else {
            CacheTag::column(self.metadata.column(field), value)
        }
    }

    async fn read_predicates(
        &self,
        operation: &'static str,
        predicates: &[Predicate],
        limit: Option<usize>,
    ) -> StoreResult<Arc<Vec<T>>> {
        let params: Vec<(&str, &Value)> = predicates
            .iter()
            .map(|p| (self.metadata.column(p.field), &p.value))
            .collect();
        let key = cache_key(self.table(), operation, &params, limit);
        let tags = if predicates.is_empty() {
            vec![CacheTag::List]
        } else {
            self.predicate_tags(predicates)
        };
        let statement = sql::select(&self.metadata, predicates, limit);
        self.cached_read(operation, key, tags, statement).await
    }

    async fn cached_read(
        &self,
        operation: &'static str,
        key: String,
        mut tags: Vec<CacheTag>,
        statement: Statement,
    ) -> StoreResult<Arc<Vec<T>>> {
        if let Some(hit) = self.cache.get(&key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(table = %self.table(), operation, "Cache hit");
            return Ok(hit);
        }
        if self.cache.is_enabled() {
            self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let generation = self.cache.generation();
        let rows = self.fetch_all(operation, statement).await?;
        let entities = rows
            .iter()
            .map(|row| self.decode(row))
            .collect::<StoreResult<Vec<T>>>()?;

        for entity in &entities {
            tags.push(CacheTag::entity(&self.metadata.key_value(entity)?));
        }
        let entities = Arc::new(entities);
        self.cache
            .insert(key, Arc::clone(&entities), tags, generation);
        Ok(entities)
    }

    pub(crate) fn decode(&self, row: &PgRow) -> StoreResult<T> {
        let mut entity = T::default();
        for (index, field) in self.metadata.fields().iter().enumerate() {
            let value = read_column(row, self.metadata.column(index), field.column_type())?;
            field.set(&mut entity, value)?;
        }
        Ok(entity)
    }

    async fn fetch_all(&self, operation: &'static str, statement: Statement) -> StoreResult<Vec<PgRow>> {
        self.with_fallback(operation, move |conn| {
            let statement = statement.clone();
            Box::pin(async move { statement.fetch_all(conn).await })
        })
        .await
    }

    async fn fetch_optional(
        &self,
        operation: &'static str,
        statement: Statement,
    ) -> StoreResult<Option<PgRow>> {
        self.with_fallback(operation, move |conn| {
            let statement = statement.clone();
            Box::pin(async move { statement.fetch_optional(conn).await })
        })
        .await
    }

    async fn fetch_one(&self, operation: &'static str, statement: Statement) -> StoreResult<PgRow> {
        self.fetch_optional(operation, statement)
            .await?
            .ok_or(StoreError::Query(sqlx::Error::RowNotFound))
    }

    async fn execute(&self, operation: &'static str, statement: Statement) -> StoreResult<u64> {
        self.with_fallback(operation, move |conn| {
            let statement = statement.clone();
            Box::pin(async move { statement.execute(conn).await })
        })
        .await
    }

    /// Run on a pooled connection, falling back once to a fresh one
    async fn with_fallback<R, F>(&self, operation: &'static str, run: F) -> StoreResult<R>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<R>>,
    {
        let start = Instant::now();
        let result = match self.attempt_pooled(operation, &run).await {
            Err(e) if e.is_retryable() => {
                warn!(
                    table = %self.table(),
                    operation,
                    error = %e,
                    "Pooled connection failed, retrying on a fresh connection"
                );
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                metrics::record_retry(self.table(), operation);
                self.attempt_fresh(operation, &run).await
            }
            other => other,
        };
        metrics::record_query(self.table(), operation, start.elapsed());
        result
    }

    async fn attempt_pooled<R, F>(&self, operation: &'static str, run: &F) -> StoreResult<R>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<R>>,
    {
        let timeout = call_timeout().unwrap_or_else(|| self.query_timeout());
        let deadline = tokio::time::Instant::now() + timeout;

        let mut conn = match tokio::time::timeout_at(deadline, self.pool.acquire()).await {
            Ok(acquired) => acquired?,
            Err(_) => return Err(StoreError::Timeout { operation, timeout }),
        };

        self.stats.record_query();
        let outcome = tokio::time::timeout_at(deadline, run(&mut *conn)).await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_retryable() {
                    conn.mark_broken();
                }
                Err(e)
            }
            Err(_) => {
                // The statement may still be running; never reuse the slot as is.
                conn.mark_broken();
                Err(StoreError::Timeout { operation, timeout })
            }
        }
    }

    async fn attempt_fresh<R, F>(&self, operation: &'static str, run: &F) -> StoreResult<R>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<R>>,
    {
        let timeout = call_timeout().unwrap_or_else(|| self.query_timeout());
        let deadline = tokio::time::Instant::now() + timeout;

        let mut conn = match tokio::time::timeout_at(deadline, self.pool.open_fresh()).await {
            Ok(opened) => opened?,
            Err(_) => return Err(StoreError::Timeout { operation, timeout }),
        };

        self.stats.record_query();
        let result = match tokio::time::timeout_at(deadline, run(&mut conn)).await {
            Ok(result) => result,
            Err(_) => return Err(StoreError::Timeout { operation, timeout }),
        };
        if let Err(e) = conn.close().await {
            debug!(table = %self.table(), error = %e, "Error closing fresh connection");
        }
        result
    }
}
