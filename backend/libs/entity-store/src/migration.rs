//! Schema reconciliation
//!
//! Compares an entity's declared columns with the live table and applies the
//! smallest change that brings them in line:
//!
//! - missing table: `CREATE TABLE IF NOT EXISTS`
//! - only added/dropped columns and safe widenings: `ALTER TABLE` in place
//! - any type change outside the widening table: full rebuild into a fresh
//!   table, copying the surviving columns, then swap names
//!
//! The key column is excluded from comparison and never dropped. Every
//! change set runs in one transaction; a failure leaves the table untouched.

use crate::column::{is_safe_widening, normalize_catalog_type, ColumnType};
use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::metadata::{quote_ident, EntityMetadata, MetadataRegistry};
use crate::metrics;
use crate::timeout::call_timeout;
use db_pool::{open_connection, DbConfig};
use sqlx::{Connection, PgConnection};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Longest table prefix kept in a rebuild table name, leaving room for the
/// `_rebuild_xxxxxxxx` suffix within PostgreSQL's 63-byte identifier limit
const REBUILD_PREFIX_LEN: usize = 46;

/// Live or desired column set: lower-cased name to canonical type name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaSnapshot {
    columns: BTreeMap<String, String>,
}

impl SchemaSnapshot {
    pub fn from_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: AsRef<str>,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, ty)| {
                    (
                        name.as_ref().to_ascii_lowercase(),
                        ty.as_ref().to_ascii_lowercase(),
                    )
                })
                .collect(),
        }
    }

    /// Non-key columns declared by an entity
    pub fn desired<T>(metadata: &EntityMetadata<T>) -> Self {
        Self::from_columns(metadata.non_key_indices().map(|i| {
            (
                metadata.column(i).to_string(),
                metadata.fields()[i].column_type().catalog_type().to_string(),
            )
        }))
    }

    /// Read the live columns of `table` in the current schema
    pub async fn read(conn: &mut PgConnection, table: &str) -> Result<Self, sqlx::Error> {
        // information_schema reports sql_identifier domains; cast to text so
        // they decode as strings.
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text, udt_name::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(conn)
        .await?;

        Ok(Self::from_columns(rows.into_iter().map(
            |(name, data_type, udt_name)| (name, normalize_catalog_type(&data_type, &udt_name)),
        )))
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .get(&column.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn without(&self, column: &str) -> Self {
        let mut columns = self.columns.clone();
        columns.remove(&column.to_ascii_lowercase());
        Self { columns }
    }
}

/// One difference between the declared and the live table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnChange {
    Add {
        column: String,
        column_type: ColumnType,
    },
    /// Lossless type change, applied with `ALTER COLUMN ... TYPE`
    Widen {
        column: String,
        from: String,
        to: ColumnType,
    },
    Drop {
        column: String,
    },
    /// Type change that may lose data; forces a rebuild
    Incompatible {
        column: String,
        from: String,
        to: ColumnType,
    },
}

impl ColumnChange {
    fn is_incompatible(&self) -> bool {
        matches!(self, Self::Incompatible { .. })
    }
}

/// A column copied into the rebuilt table, with a cast when its type changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarriedColumn {
    pub column: String,
    pub cast: Option<ColumnType>,
}

/// How a rebuild moves data across
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildPlan {
    /// Columns copied unconditionally (key first)
    pub carried: Vec<CarriedColumn>,
    /// Columns copied with a cast that may fail; dropped from the copy if so
    pub lossy: Vec<CarriedColumn>,
    pub changes: Vec<ColumnChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationPlan {
    Create,
    UpToDate,
    InPlace(Vec<ColumnChange>),
    Rebuild(RebuildPlan),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    Created,
    Unchanged,
    Altered,
    Rebuilt,
}

impl MigrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Unchanged => "unchanged",
            Self::Altered => "altered",
            Self::Rebuilt => "rebuilt",
        }
    }
}

/// What `ensure_schema` did; `statements` is empty when nothing changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub table: String,
    pub kind: MigrationKind,
    pub statements: Vec<String>,
}

/// Diff declared non-key columns against the live table
pub fn diff_columns(desired: &SchemaSnapshot, live: &SchemaSnapshot, key_column: &str) -> Vec<ColumnChange> {
    let live = live.without(key_column);
    let desired = desired.without(key_column);
    let mut changes = Vec::new();

    for (column, desired_type) in &desired.columns {
        let Some(column_type) = column_type_for(desired_type) else {
            continue;
        };
        match live.columns.get(column) {
            None => changes.push(ColumnChange::Add {
                column: column.clone(),
                column_type,
            }),
            Some(live_type) if live_type == desired_type => {}
            Some(live_type) if is_safe_widening(live_type, desired_type) => {
                changes.push(ColumnChange::Widen {
                    column: column.clone(),
                    from: live_type.clone(),
                    to: column_type,
                })
            }
            Some(live_type) => changes.push(ColumnChange::Incompatible {
                column: column.clone(),
                from: live_type.clone(),
                to: column_type,
            }),
        }
    }

    for column in live.columns.keys() {
        if !desired.columns.contains_key(column) {
            changes.push(ColumnChange::Drop {
                column: column.clone(),
            });
        }
    }

    changes
}

fn column_type_for(catalog_type: &str) -> Option<ColumnType> {
    const ALL: [ColumnType; 16] = [
        ColumnType::SmallInt,
        ColumnType::Integer,
        ColumnType::BigInt,
        ColumnType::Real,
        ColumnType::Double,
        ColumnType::Decimal,
        ColumnType::Text,
        ColumnType::Boolean,
        ColumnType::Timestamp,
        ColumnType::TimestampTz,
        ColumnType::Bytes,
        ColumnType::Uuid,
        ColumnType::Jsonb,
        ColumnType::TextArray,
        ColumnType::IntegerArray,
        ColumnType::BigIntArray,
    ];
    ALL.into_iter().find(|ty| ty.catalog_type() == catalog_type)
}

/// Choose between in-place changes and a rebuild
pub fn classify(changes: Vec<ColumnChange>, live: &SchemaSnapshot, key_column: &str) -> MigrationPlan {
    if changes.is_empty() {
        return MigrationPlan::UpToDate;
    }
    if changes.iter().any(ColumnChange::is_incompatible) {
        return MigrationPlan::Rebuild(rebuild_plan(changes, live, key_column));
    }
    MigrationPlan::InPlace(changes)
}

/// Columns to carry over: the key plus every declared column that survives
pub fn rebuild_plan(changes: Vec<ColumnChange>, live: &SchemaSnapshot, key_column: &str) -> RebuildPlan {
    let mut carried = Vec::new();
    let mut lossy = Vec::new();

    if live.contains(key_column) {
        carried.push(CarriedColumn {
            column: key_column.to_ascii_lowercase(),
            cast: None,
        });
    }

    let touched: Vec<&str> = changes
        .iter()
        .filter_map(|change| match change {
            ColumnChange::Add { column, .. } | ColumnChange::Drop { column } => Some(column.as_str()),
            _ => None,
        })
        .collect();

    for column in live.without(key_column).columns.keys() {
        if touched.contains(&column.as_str()) {
            continue;
        }
        let change = changes.iter().find(|change| match change {
            ColumnChange::Widen { column: c, .. } | ColumnChange::Incompatible { column: c, .. } => {
                c == column
            }
            _ => false,
        });
        match change {
            Some(ColumnChange::Widen { to, .. }) => carried.push(CarriedColumn {
                column: column.clone(),
                cast: Some(*to),
            }),
            Some(ColumnChange::Incompatible { to, .. }) => lossy.push(CarriedColumn {
                column: column.clone(),
                cast: Some(*to),
            }),
            _ => carried.push(CarriedColumn {
                column: column.clone(),
                cast: None,
            }),
        }
    }

    RebuildPlan {
        carried,
        lossy,
        changes,
    }
}

/// `CREATE TABLE IF NOT EXISTS` with the declared shape under `table_name`
pub fn create_table_sql<T>(metadata: &EntityMetadata<T>, table_name: &str) -> String {
    let mut definitions = vec![format!(
        "{} {}",
        metadata.quoted_key_column(),
        metadata.key_type().key_definition()
    )];
    definitions.extend(metadata.non_key_indices().map(|i| {
        format!(
            "{} {}",
            metadata.quoted_column(i),
            metadata.fields()[i].column_type().sql_type()
        )
    }));
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table_name),
        definitions.join(", ")
    )
}

/// DDL for one in-place change
pub fn alter_sql(table: &str, change: &ColumnChange) -> Option<String> {
    let table = quote_ident(table);
    match change {
        ColumnChange::Add {
            column,
            column_type,
        } => Some(format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table,
            quote_ident(column),
            column_type.sql_type()
        )),
        ColumnChange::Widen { column, to, .. } => Some(format!(
            "ALTER TABLE {0} ALTER COLUMN {1} TYPE {2} USING {1}::{2}",
            table,
            quote_ident(column),
            to.sql_type()
        )),
        ColumnChange::Drop { column } => {
            Some(format!("ALTER TABLE {} DROP COLUMN {}", table, quote_ident(column)))
        }
        ColumnChange::Incompatible { .. } => None,
    }
}

fn copy_sql(target: &str, source: &str, columns: &[&CarriedColumn]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.column)).collect();
    let expressions: Vec<String> = columns
        .iter()
        .zip(&names)
        .map(|(c, name)| match c.cast {
            Some(ty) => format!("{}::{}", name, ty.sql_type()),
            None => name.clone(),
        })
        .collect();
    format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        quote_ident(target),
        names.join(", "),
        expressions.join(", "),
        quote_ident(source)
    )
}

/// The table argument of `pg_get_serial_sequence` is parsed as an
/// identifier, the column argument is taken literally.
fn reset_sequence_sql(table: &str, key_column: &str) -> String {
    let table = quote_ident(table);
    format!(
        "SELECT setval(pg_get_serial_sequence('{0}', '{1}'), COALESCE((SELECT MAX({2}) FROM {0}), 0) + 1, false)",
        table,
        key_column,
        quote_ident(key_column)
    )
}

fn rebuild_table_name(table: &str) -> String {
    let prefix: String = table.chars().take(REBUILD_PREFIX_LEN).collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_rebuild_{}", prefix, &suffix[..8])
}

fn migration_error(table: &str, source: sqlx::Error) -> StoreError {
    StoreError::SchemaMigration {
        table: table.to_string(),
        source,
    }
}

async fn table_exists(conn: &mut PgConnection, table: &str) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = current_schema() AND table_name = $1
        )
        "#,
    )
    .bind(table)
    .fetch_one(conn)
    .await
}

/// Brings entity tables in line with their declarations
///
/// Each call uses its own short-lived connection.
pub struct SchemaMigrator {
    registry: Arc<MetadataRegistry>,
    db: DbConfig,
}

impl SchemaMigrator {
    pub fn new(registry: Arc<MetadataRegistry>, db: DbConfig) -> Self {
        Self { registry, db }
    }

    /// Create or reconcile the table for `T`. Running it again without
    /// declaration changes issues no DDL.
    pub async fn ensure_schema<T: Entity>(&self) -> StoreResult<MigrationReport> {
        let metadata = self.registry.get::<T>()?;
        let report = self
            .with_connection(metadata.table(), |conn| {
                Box::pin(ensure_on(conn, Arc::clone(&metadata), false))
            })
            .await;
        self.finish(metadata.table(), report)
    }

    /// Force a full rebuild even when the live table already matches
    pub async fn rebuild<T: Entity>(&self) -> StoreResult<MigrationReport> {
        let metadata = self.registry.get::<T>()?;
        let report = self
            .with_connection(metadata.table(), |conn| {
                Box::pin(ensure_on(conn, Arc::clone(&metadata), true))
            })
            .await;
        self.finish(metadata.table(), report)
    }

    /// Compute what `ensure_schema` would do without changing anything
    pub async fn plan<T: Entity>(&self) -> StoreResult<MigrationPlan> {
        let metadata = self.registry.get::<T>()?;
        let table = metadata.table().to_string();
        self.with_connection(&table, |conn| {
            Box::pin(async move {
                let table = metadata.table();
                if !table_exists(conn, table).await? {
                    return Ok(MigrationPlan::Create);
                }
                let live = SchemaSnapshot::read(conn, table).await?;
                let changes = diff_columns(&SchemaSnapshot::desired(&metadata), &live, metadata.key_column());
                Ok(classify(changes, &live, metadata.key_column()))
            })
        })
        .await
    }

    async fn with_connection<R, F>(&self, table: &str, run: F) -> StoreResult<R>
    where
        F: for<'c> FnOnce(
            &'c mut PgConnection,
        ) -> futures::future::BoxFuture<'c, Result<R, sqlx::Error>>,
    {
        let work = async {
            let mut conn = open_connection(&self.db)
                .await
                .map_err(|e| migration_error(table, e))?;
            let result = run(&mut conn).await;
            if let Err(e) = conn.close().await {
                debug!(table, error = %e, "Error closing migration connection");
            }
            result.map_err(|e| migration_error(table, e))
        };

        // Unbounded unless the caller set a deadline. Dropping the
        // connection mid-transaction makes the server roll it back.
        match call_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, work)
                .await
                .map_err(|_| StoreError::Timeout {
                    operation: "migration",
                    timeout,
                })?,
            None => work.await,
        }
    }

    fn finish(
        &self,
        table: &str,
        report: StoreResult<MigrationReport>,
    ) -> StoreResult<MigrationReport> {
        match report {
            Ok(report) => {
                metrics::record_migration(table, report.kind.as_str());
                if report.kind != MigrationKind::Unchanged {
                    info!(
                        table,
                        kind = report.kind.as_str(),
                        statements = report.statements.len(),
                        "Schema migrated"
                    );
                }
                Ok(report)
            }
            Err(e) => {
                metrics::record_migration(table, "failed");
                error!(table, error = %e, "Schema migration failed");
                Err(e)
            }
        }
    }
}

async fn ensure_on<T>(
    conn: &mut PgConnection,
    metadata: Arc<EntityMetadata<T>>,
    force_rebuild: bool,
) -> Result<MigrationReport, sqlx::Error> {
    let table = metadata.table().to_string();

    if !table_exists(conn, &table).await? {
        let sql = create_table_sql(&metadata, &table);
        sqlx::query(&sql).execute(&mut *conn).await?;
        return Ok(MigrationReport {
            table,
            kind: MigrationKind::Created,
            statements: vec![sql],
        });
    }

    let live = SchemaSnapshot::read(conn, &table).await?;
    let changes = diff_columns(&SchemaSnapshot::desired(&metadata), &live, metadata.key_column());
    let plan = if force_rebuild {
        MigrationPlan::Rebuild(rebuild_plan(changes, &live, metadata.key_column()))
    } else {
        classify(changes, &live, metadata.key_column())
    };

    match plan {
        MigrationPlan::Create | MigrationPlan::UpToDate => Ok(MigrationReport {
            table,
            kind: MigrationKind::Unchanged,
            statements: Vec::new(),
        }),
        MigrationPlan::InPlace(changes) => {
            let statements: Vec<String> = changes
                .iter()
                .filter_map(|change| alter_sql(&table, change))
                .collect();
            let mut tx = conn.begin().await?;
            for sql in &statements {
                debug!(table = %table, sql = %sql, "Applying column change");
                sqlx::query(sql).execute(&mut *tx).await?;
            }
            tx.commit().await?;
            Ok(MigrationReport {
                table,
                kind: MigrationKind::Altered,
                statements,
            })
        }
        MigrationPlan::Rebuild(plan) => {
            let statements = rebuild(conn, &metadata, &plan).await?;
            Ok(MigrationReport {
                table,
                kind: MigrationKind::Rebuilt,
                statements,
            })
        }
    }
}

async fn rebuild<T>(
    conn: &mut PgConnection,
    metadata: &EntityMetadata<T>,
    plan: &RebuildPlan,
) -> Result<Vec<String>, sqlx::Error> {
    let table = metadata.table();
    let temp = rebuild_table_name(table);
    let mut statements = Vec::new();

    info!(
        table,
        temp_table = %temp,
        changes = plan.changes.len(),
        "Rebuilding table"
    );

    let mut tx = conn.begin().await?;

    let create = create_table_sql(metadata, &temp);
    sqlx::query(&create).execute(&mut *tx).await?;
    statements.push(create);

    let carried: Vec<&CarriedColumn> = plan.carried.iter().collect();
    if !plan.lossy.is_empty() {
        let with_casts: Vec<&CarriedColumn> = carried.iter().copied().chain(plan.lossy.iter()).collect();
        let sql = copy_sql(&temp, table, &with_casts);
        let mut savepoint = Connection::begin(&mut *tx).await?;
        let copied = sqlx::query(&sql).execute(&mut *savepoint).await;
        match copied {
            Ok(_) => {
                savepoint.commit().await?;
                statements.push(sql);
            }
            Err(e) => {
                savepoint.rollback().await?;
                let skipped: Vec<&str> = plan.lossy.iter().map(|c| c.column.as_str()).collect();
                warn!(
                    table,
                    columns = ?skipped,
                    error = %e,
                    "Cast during rebuild failed, columns left empty"
                );
                if !carried.is_empty() {
                    let sql = copy_sql(&temp, table, &carried);
                    sqlx::query(&sql).execute(&mut *tx).await?;
                    statements.push(sql);
                }
            }
        }
    } else if !carried.is_empty() {
        let sql = copy_sql(&temp, table, &carried);
        sqlx::query(&sql).execute(&mut *tx).await?;
        statements.push(sql);
    }

    let swap = [
        format!("DROP TABLE {}", quote_ident(table)),
        format!("ALTER TABLE {} RENAME TO {}", quote_ident(&temp), quote_ident(table)),
    ];
    for sql in swap {
        sqlx::query(&sql).execute(&mut *tx).await?;
        statements.push(sql);
    }

    if metadata.key_type().is_serial_key() {
        let sql = reset_sequence_sql(table, metadata.key_column());
        sqlx::query(&sql).execute(&mut *tx).await?;
        statements.push(sql);
    }

    tx.commit().await?;
    Ok(statements)
}
