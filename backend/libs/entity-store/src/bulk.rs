//! Bulk insert through binary COPY and bulk update through
//! `UPDATE ... FROM (VALUES ...)`
//!
//! Both run on a dedicated connection inside one transaction: either every
//! batch commits or none does. Afterwards the repository's whole cache is
//! dropped, whatever the outcome.

use crate::column::ColumnType;
use crate::copy::BinaryCopyEncoder;
use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::repository::Repository;
use crate::sql;
use crate::timeout::call_timeout;
use crate::value::Value;
use sqlx::{Connection, PgConnection};
use std::future::Future;
use std::time::Instant;
use tracing::{debug, error, info};

/// Encoded bytes buffered before a chunk is sent to the server
const COPY_FLUSH_BYTES: usize = 1024 * 1024;

/// Number of batches needed for `rows` at `batch_size` rows per batch
pub fn batch_count(rows: usize, batch_size: usize) -> usize {
    let batch_size = batch_size.max(1);
    (rows + batch_size - 1) / batch_size
}

impl<T: Entity> Repository<T> {
    /// Load every entity with binary COPY, in batches of at most
    /// `max_batch_size` rows inside one transaction
    ///
    /// Database-generated keys are left to the database. Returns the number
    /// of rows written.
    pub async fn bulk_insert(&self, entities: &[T]) -> StoreResult<u64> {
        if entities.is_empty() {
            return Ok(0);
        }
        let result = self
            .run_bulk("insert", |conn| self.copy_batches(conn, entities))
            .await;
        if let Ok(rows) = result {
            metrics::record_bulk_rows(self.table(), "insert", rows as usize);
        }
        result
    }

    /// Overwrite every non-key column of each entity's row, in batches sized
    /// to stay under the bind parameter limit, inside one transaction
    ///
    /// Every entity must carry a key. Returns the number of rows updated.
    pub async fn bulk_update(&self, entities: &[T]) -> StoreResult<u64> {
        if entities.is_empty() {
            return Ok(0);
        }
        if !self.metadata.has_non_key_fields() {
            return Err(StoreError::validation(format!(
                "{} has no updatable columns",
                self.table()
            )));
        }
        if let Some(position) = entities
            .iter()
            .position(|entity| self.metadata.key_is_default(entity))
        {
            return Err(StoreError::validation(format!(
                "bulk update on {} requires a key on every entity, entity {} has none",
                self.table(),
                position
            )));
        }

        let result = self
            .run_bulk("update", |conn| self.update_batches(conn, entities))
            .await;
        if let Ok(rows) = result {
            metrics::record_bulk_rows(self.table(), "update", rows as usize);
        }
        result
    }

    /// Open a dedicated connection, run `work` under the bulk deadline, then
    /// drop the cache and wrap any failure
    async fn run_bulk<F, Fut>(&self, operation: &'static str, work: F) -> StoreResult<u64>
    where
        F: FnOnce(PgConnection) -> Fut,
        Fut: Future<Output = StoreResult<u64>>,
    {
        let start = Instant::now();
        let timeout = call_timeout().unwrap_or(self.settings.bulk_timeout);

        let outcome = tokio::time::timeout(timeout, async {
            let conn = self.pool.open_fresh().await?;
            work(conn).await
        })
        .await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation: "bulk",
                timeout,
            }),
        };

        self.cache.clear();
        metrics::record_query(self.table(), operation, start.elapsed());

        match result {
            Ok(rows) => {
                info!(
                    table = %self.table(),
                    operation,
                    rows,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Bulk operation committed"
                );
                Ok(rows)
            }
            Err(e) => {
                error!(table = %self.table(), operation, error = %e, "Bulk operation rolled back");
                Err(StoreError::BulkOperation {
                    operation,
                    table: self.table().to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    async fn copy_batches(&self, mut conn: PgConnection, entities: &[T]) -> StoreResult<u64> {
        let result = self.copy_in_transaction(&mut conn, entities).await;
        close_quietly(conn, self.table()).await;
        result
    }

    async fn copy_in_transaction(&self, conn: &mut PgConnection, entities: &[T]) -> StoreResult<u64> {
        let batch_size = self.settings.max_batch_size.max(1);
        let copy_fields = self.metadata.copy_fields();
        debug!(
            table = %self.table(),
            rows = entities.len(),
            batches = batch_count(entities.len(), batch_size),
            "Starting bulk insert"
        );

        let mut tx = conn.begin().await?;
        let mut written = 0u64;

        for (index, batch) in entities.chunks(batch_size).enumerate() {
            let mut copy = tx.copy_in_raw(self.metadata.copy_sql()).await?;
            self.stats.record_query();

            let mut encoder = BinaryCopyEncoder::new();
            let mut row: Vec<(Value, ColumnType)> = Vec::with_capacity(copy_fields.len());
            for entity in batch {
                row.clear();
                let encoded = self
                    .copy_row(entity, copy_fields, &mut row)
                    .and_then(|()| encoder.write_row(&row).map_err(StoreError::from));
                if let Err(e) = encoded {
                    copy.abort(e.to_string()).await?;
                    return Err(e);
                }
                if encoder.buffered() >= COPY_FLUSH_BYTES {
                    copy.send(encoder.take()).await?;
                }
            }
            copy.send(encoder.finish()).await?;
            let rows = copy.finish().await?;

            written += rows;
            self.stats.record_batch();
            debug!(table = %self.table(), batch = index, rows, "Copied batch");
        }

        tx.commit().await?;
        Ok(written)
    }

    fn copy_row(
        &self,
        entity: &T,
        copy_fields: &[usize],
        row: &mut Vec<(Value, ColumnType)>,
    ) -> StoreResult<()> {
        for index in copy_fields {
            let field = &self.metadata.fields()[*index];
            row.push((field.get(entity)?, field.column_type()));
        }
        Ok(())
    }

    async fn update_batches(&self, mut conn: PgConnection, entities: &[T]) -> StoreResult<u64> {
        let result = self.update_in_transaction(&mut conn, entities).await;
        close_quietly(conn, self.table()).await;
        result
    }

    async fn update_in_transaction(&self, conn: &mut PgConnection, entities: &[T]) -> StoreResult<u64> {
        let rows_per_batch = sql::bulk_update_rows_per_batch(
            self.metadata.all_columns().len(),
            self.settings.max_batch_size,
        );
        debug!(
            table = %self.table(),
            rows = entities.len(),
            batches = batch_count(entities.len(), rows_per_batch),
            "Starting bulk update"
        );

        let mut tx = conn.begin().await?;
        let mut updated = 0u64;

        for (index, batch) in entities.chunks(rows_per_batch).enumerate() {
            let statement = sql::bulk_update(&self.metadata, batch)?;
            self.stats.record_query();
            let rows = statement.execute(&mut *tx).await?;

            updated += rows;
            self.stats.record_batch();
            debug!(table = %self.table(), batch = index, rows, "Updated batch");
        }

        tx.commit().await?;
        Ok(updated)
    }
}

async fn close_quietly(conn: PgConnection, table: &str) {
    if let Err(e) = conn.close().await {
        debug!(table, error = %e, "Error closing bulk connection");
    }
}
