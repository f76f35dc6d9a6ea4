//! Parameterized command construction
//!
//! Every value reaches the database as a bound parameter. Only identifiers
//! that passed metadata validation are spliced into the text, always
//! double-quoted.

use crate::column::ColumnType;
use crate::error::{StoreError, StoreResult};
use crate::metadata::EntityMetadata;
use crate::value::{add_argument, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, PgConnection};

/// PostgreSQL's per-statement bind parameter limit
pub const MAX_BIND_PARAMETERS: usize = 65_535;

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub value: Value,
    pub column_type: ColumnType,
}

/// Equality filter on one field
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: usize,
    pub value: Value,
}

/// A command string and its ordered parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind a value and return its placeholder
    pub fn bind(&mut self, value: Value, column_type: ColumnType) -> String {
        self.params.push(Param { value, column_type });
        format!("${}", self.params.len())
    }

    fn arguments(&self) -> StoreResult<PgArguments> {
        let mut args = PgArguments::default();
        args.reserve(self.params.len(), self.params.len() * 8);
        for param in &self.params {
            add_argument(&mut args, &param.value, param.column_type).map_err(|e| {
                StoreError::Query(sqlx::Error::Encode(e))
            })?;
        }
        Ok(args)
    }

    pub async fn fetch_all(&self, conn: &mut PgConnection) -> StoreResult<Vec<PgRow>> {
        let args = self.arguments()?;
        Ok(sqlx::query_with(&self.sql, args).fetch_all(conn).await?)
    }

    pub async fn fetch_optional(&self, conn: &mut PgConnection) -> StoreResult<Option<PgRow>> {
        let args = self.arguments()?;
        Ok(sqlx::query_with(&self.sql, args)
            .fetch_optional(conn)
            .await?)
    }

    /// Run the command and return the affected row count
    pub async fn execute(&self, conn: &mut PgConnection) -> StoreResult<u64> {
        let args = self.arguments()?;
        Ok(sqlx::query_with(&self.sql, args)
            .execute(conn)
            .await?
            .rows_affected())
    }
}

/// Predicates for every non-key field that differs from its default
pub fn example_predicates<T>(metadata: &EntityMetadata<T>, example: &T) -> StoreResult<Vec<Predicate>> {
    let mut predicates = Vec::new();
    for index in metadata.non_key_indices() {
        let field = &metadata.fields()[index];
        if field.is_default(example) {
            continue;
        }
        predicates.push(Predicate {
            field: index,
            value: field.get(example)?,
        });
    }
    Ok(predicates)
}

fn push_where<T>(statement: &mut Statement, metadata: &EntityMetadata<T>, predicates: &[Predicate]) {
    if predicates.is_empty() {
        return;
    }
    let clauses: Vec<String> = predicates
        .iter()
        .map(|predicate| {
            let column = metadata.quoted_column(predicate.field);
            if predicate.value.is_null() {
                format!("{} IS NULL", column)
            } else {
                let column_type = metadata.fields()[predicate.field].column_type();
                let placeholder = statement.bind(predicate.value.clone(), column_type);
                format!("{} = {}", column, placeholder)
            }
        })
        .collect();
    statement.sql.push_str(" WHERE ");
    statement.sql.push_str(&clauses.join(" AND "));
}

/// `SELECT ... WHERE <predicates> ORDER BY key [LIMIT n]`
pub fn select<T>(
    metadata: &EntityMetadata<T>,
    predicates: &[Predicate],
    limit: Option<usize>,
) -> Statement {
    let mut statement = Statement::new(metadata.select_prefix());
    push_where(&mut statement, metadata, predicates);
    statement.sql.push_str(" ORDER BY ");
    statement.sql.push_str(metadata.quoted_key_column());
    if let Some(limit) = limit {
        statement.sql.push_str(&format!(" LIMIT {}", limit));
    }
    statement
}

/// `SELECT ... WHERE column IN (...) ORDER BY key`
pub fn select_in<T>(metadata: &EntityMetadata<T>, field: usize, values: &[Value]) -> Statement {
    let column_type = metadata.fields()[field].column_type();
    let mut statement = Statement::new(metadata.select_prefix());
    let placeholders: Vec<String> = values
        .iter()
        .map(|value| statement.bind(value.clone(), column_type))
        .collect();
    statement.sql.push_str(&format!(
        " WHERE {} IN ({}) ORDER BY {}",
        metadata.quoted_column(field),
        placeholders.join(", "),
        metadata.quoted_key_column()
    ));
    statement
}

/// `SELECT COUNT(*) ... WHERE <predicates>`
pub fn count<T>(metadata: &EntityMetadata<T>, predicates: &[Predicate]) -> Statement {
    let mut statement = Statement::new(format!("SELECT COUNT(*) FROM {}", metadata.quoted_table()));
    push_where(&mut statement, metadata, predicates);
    statement
}

/// `UPDATE ... SET <changed> WHERE key = $n`
pub fn update<T>(metadata: &EntityMetadata<T>, key: Value, changes: &[Predicate]) -> Statement {
    let mut statement = Statement::new(metadata.update_prefix());
    let assignments: Vec<String> = changes
        .iter()
        .map(|change| {
            let column_type = metadata.fields()[change.field].column_type();
            let placeholder = statement.bind(change.value.clone(), column_type);
            format!("{} = {}", metadata.quoted_column(change.field), placeholder)
        })
        .collect();
    statement.sql.push_str(&assignments.join(", "));
    let key_placeholder = statement.bind(key, metadata.key_type());
    statement.sql.push_str(&format!(
        " WHERE {} = {}",
        metadata.quoted_key_column(),
        key_placeholder
    ));
    statement
}

/// `DELETE ... WHERE <predicates> RETURNING key`
///
/// Callers must reject an empty predicate list; this builder only renders.
pub fn delete<T>(metadata: &EntityMetadata<T>, predicates: &[Predicate]) -> Statement {
    let mut statement = Statement::new(metadata.delete_prefix());
    push_where(&mut statement, metadata, predicates);
    statement.sql.push_str(" RETURNING ");
    statement.sql.push_str(metadata.quoted_key_column());
    statement
}

/// Insert of the non-key fields, returning the generated key
pub fn insert<T>(metadata: &EntityMetadata<T>, entity: &T) -> StoreResult<Statement> {
    let mut statement = Statement::new(metadata.insert_sql());
    for index in metadata.non_key_indices() {
        let field = &metadata.fields()[index];
        statement.bind(field.get(entity)?, field.column_type());
    }
    Ok(statement)
}

/// Insert-or-update on key conflict over every field
pub fn upsert<T>(metadata: &EntityMetadata<T>, entity: &T) -> StoreResult<Statement> {
    let mut statement = Statement::new(metadata.upsert_sql());
    for field in metadata.fields() {
        statement.bind(field.get(entity)?, field.column_type());
    }
    Ok(statement)
}

/// Rows per `UPDATE ... FROM (VALUES ...)` so one statement stays under the
/// bind parameter limit
pub fn bulk_update_rows_per_batch(columns: usize, max_batch_size: usize) -> usize {
    (MAX_BIND_PARAMETERS / columns.max(1)).min(max_batch_size).max(1)
}

/// `UPDATE t AS target SET c = data.c FROM (VALUES ...) AS data(...)
/// WHERE target.key = data.key`
///
/// Every non-key column is overwritten, defaults included.
pub fn bulk_update<T>(metadata: &EntityMetadata<T>, entities: &[T]) -> StoreResult<Statement> {
    let columns = metadata.quoted_columns();
    let key_column = metadata.quoted_key_column();
    let mut statement = Statement::new(String::new());

    let mut rows = Vec::with_capacity(entities.len());
    for entity in entities {
        let mut cells = Vec::with_capacity(columns.len());
        for field in metadata.fields() {
            let placeholder = statement.bind(field.get(entity)?, field.column_type());
            cells.push(format!("{}::{}", placeholder, field.column_type().sql_type()));
        }
        rows.push(format!("({})", cells.join(", ")));
    }

    let assignments: Vec<String> = metadata
        .non_key_indices()
        .map(|i| format!("{0} = data.{0}", columns[i]))
        .collect();

    statement.sql = format!(
        "UPDATE {table} AS target SET {assignments} FROM (VALUES {rows}) AS data({columns}) \
         WHERE target.{key} = data.{key}",
        table = metadata.quoted_table(),
        assignments = assignments.join(", "),
        rows = rows.join(", "),
        columns = columns.join(", "),
        key = key_column,
    );
    Ok(statement)
}
