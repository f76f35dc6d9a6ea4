//! Per-type metadata compiled once and shared for the process lifetime.

use crate::column::ColumnType;
use crate::entity::{Entity, FieldDef};
use crate::error::{StoreError, StoreResult};
use crate::value::Value;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// PostgreSQL truncates identifiers beyond this length
const MAX_IDENTIFIER_LEN: usize = 63;

/// Compiled, immutable description of an entity's table
pub struct EntityMetadata<T> {
    entity: &'static str,
    table: String,
    quoted_table: String,
    fields: Vec<FieldDef<T>>,
    columns: Vec<String>,
    quoted_columns: Vec<String>,
    key_index: usize,
    select_prefix: String,
    insert_sql: String,
    upsert_sql: String,
    copy_sql: String,
    copy_fields: Vec<usize>,
}

impl<T: Entity> EntityMetadata<T> {
    /// Validate the declaration and prebuild every command string
    pub fn compile() -> StoreResult<Self> {
        let entity = std::any::type_name::<T>();
        let table = T::TABLE.trim().to_ascii_lowercase();
        if table.is_empty() {
            return Err(StoreError::configuration(entity, "table name is empty"));
        }
        validate_identifier(entity, "table", &table)?;

        let fields = T::fields();
        if fields.is_empty() {
            return Err(StoreError::configuration(entity, "no fields declared"));
        }

        let keys: Vec<usize> = fields
            .iter()
            .enumerate()
            .filter(|(_, field)| field.is_key())
            .map(|(index, _)| index)
            .collect();
        let key_index = match keys.as_slice() {
            [single] => *single,
            [] => return Err(StoreError::configuration(entity, "no key field declared")),
            many => {
                return Err(StoreError::configuration(
                    entity,
                    format!("{} key fields declared, exactly one is required", many.len()),
                ))
            }
        };

        let mut columns = Vec::with_capacity(fields.len());
        let mut seen = HashSet::new();
        for field in &fields {
            let column = field.column().trim().to_ascii_lowercase();
            validate_identifier(entity, field.name(), &column)?;
            if !seen.insert(column.clone()) {
                return Err(StoreError::configuration(
                    entity,
                    format!("column {} is mapped more than once", column),
                ));
            }
            columns.push(column);
        }

        // Every identifier is emitted quoted so reserved words such as
        // `order` or `group` stay usable as names.
        let quoted_table = quote_ident(&table);
        let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();

        let key_column = &quoted_columns[key_index];
        let key_type = fields[key_index].column_type();
        let non_key: Vec<usize> = (0..fields.len()).filter(|i| *i != key_index).collect();

        let select_prefix = format!(
            "SELECT {} FROM {}",
            quoted_columns.join(", "),
            quoted_table
        );

        let insert_sql = if non_key.is_empty() {
            format!(
                "INSERT INTO {} DEFAULT VALUES RETURNING {}",
                quoted_table, key_column
            )
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
                quoted_table,
                join_columns(&quoted_columns, &non_key),
                placeholders(1, non_key.len()),
                key_column
            )
        };

        let conflict_action = if non_key.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!(
                "DO UPDATE SET {}",
                non_key
                    .iter()
                    .map(|i| format!("{0} = EXCLUDED.{0}", quoted_columns[*i]))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        let upsert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {} RETURNING {}",
            quoted_table,
            quoted_columns.join(", "),
            placeholders(1, columns.len()),
            key_column,
            conflict_action,
            key_column
        );

        // Generated keys are left to the database during bulk loads.
        let copy_fields: Vec<usize> = if key_type.is_generated_key() && !non_key.is_empty() {
            non_key.clone()
        } else {
            (0..fields.len()).collect()
        };
        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN (FORMAT BINARY)",
            quoted_table,
            join_columns(&quoted_columns, &copy_fields)
        );

        debug!(entity, table = %table, columns = columns.len(), "Compiled entity metadata");

        Ok(Self {
            entity,
            table,
            quoted_table,
            fields,
            columns,
            quoted_columns,
            key_index,
            select_prefix,
            insert_sql,
            upsert_sql,
            copy_sql,
            copy_fields,
        })
    }
}

impl<T> EntityMetadata<T> {
    pub fn entity_name(&self) -> &'static str {
        self.entity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[FieldDef<T>] {
        &self.fields
    }

    /// Every column in declaration order
    pub fn all_columns(&self) -> &[String] {
        &self.columns
    }

    /// Columns written by a plain insert (all but the key)
    pub fn insert_columns(&self) -> Vec<&str> {
        self.non_key_indices().map(|i| self.columns[i].as_str()).collect()
    }

    pub fn column(&self, index: usize) -> &str {
        &self.columns[index]
    }

    /// Table name ready to splice into a command
    pub fn quoted_table(&self) -> &str {
        &self.quoted_table
    }

    /// Column name ready to splice into a command
    pub fn quoted_column(&self, index: usize) -> &str {
        &self.quoted_columns[index]
    }

    pub fn quoted_columns(&self) -> &[String] {
        &self.quoted_columns
    }

    pub fn quoted_key_column(&self) -> &str {
        &self.quoted_columns[self.key_index]
    }

    pub fn key_index(&self) -> usize {
        self.key_index
    }

    pub fn key_field(&self) -> &FieldDef<T> {
        &self.fields[self.key_index]
    }

    pub fn key_column(&self) -> &str {
        &self.columns[self.key_index]
    }

    pub fn key_type(&self) -> ColumnType {
        self.fields[self.key_index].column_type()
    }

    pub fn non_key_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let key = self.key_index;
        (0..self.fields.len()).filter(move |i| *i != key)
    }

    pub fn has_non_key_fields(&self) -> bool {
        self.fields.len() > 1
    }

    /// `SELECT <all columns> FROM <table>`
    pub fn select_prefix(&self) -> &str {
        &self.select_prefix
    }

    /// `DELETE FROM <table>`
    pub fn delete_prefix(&self) -> String {
        format!("DELETE FROM {}", self.quoted_table)
    }

    /// `UPDATE <table> SET `
    pub fn update_prefix(&self) -> String {
        format!("UPDATE {} SET ", self.quoted_table)
    }

    /// Insert of the non-key columns returning the generated key
    pub fn insert_sql(&self) -> &str {
        &self.insert_sql
    }

    /// `INSERT ... ON CONFLICT (key) DO UPDATE` over every column
    pub fn upsert_sql(&self) -> &str {
        &self.upsert_sql
    }

    /// Binary COPY command for bulk loads
    pub fn copy_sql(&self) -> &str {
        &self.copy_sql
    }

    /// Field indices written by the COPY command, in command order
    pub fn copy_fields(&self) -> &[usize] {
        &self.copy_fields
    }

    /// Resolve a column or field name, case-insensitively
    pub fn field_index(&self, name: &str) -> Option<usize> {
        let wanted = name.trim().to_ascii_lowercase();
        self.columns
            .iter()
            .position(|column| *column == wanted)
            .or_else(|| {
                self.fields
                    .iter()
                    .position(|field| field.name().eq_ignore_ascii_case(&wanted))
            })
    }

    pub fn key_value(&self, entity: &T) -> StoreResult<Value> {
        Ok(self.key_field().get(entity)?)
    }

    pub fn key_is_default(&self, entity: &T) -> bool {
        self.key_field().is_default(entity)
    }

    pub fn set_key(&self, entity: &mut T, value: Value) -> StoreResult<()> {
        Ok(self.key_field().set(entity, value)?)
    }
}

fn validate_identifier(entity: &str, what: &str, identifier: &str) -> StoreResult<()> {
    let mut chars = identifier.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(StoreError::configuration(
            entity,
            format!("{} has invalid identifier {:?}", what, identifier),
        ));
    }
    Ok(())
}

/// Double-quote an identifier, doubling any embedded quote
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn join_columns(columns: &[String], indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| columns[*i].as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `$start, $start+1, ...` for `count` parameters
pub(crate) fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|n| format!("${}", n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Compiled metadata keyed by type
///
/// Constructed explicitly and passed to whoever needs it. Concurrent first
/// access to the same type compiles exactly once: the map entry stays locked
/// while the compiler runs.
#[derive(Default)]
pub struct MetadataRegistry {
    compiled: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: Entity>(&self) -> StoreResult<Arc<EntityMetadata<T>>> {
        let entry = self
            .compiled
            .entry(TypeId::of::<T>())
            .or_try_insert_with(|| {
                EntityMetadata::<T>::compile()
                    .map(|metadata| Arc::new(metadata) as Arc<dyn Any + Send + Sync>)
            })?;
        let erased = Arc::clone(entry.value());
        drop(entry);

        erased.downcast::<EntityMetadata<T>>().map_err(|_| {
            StoreError::configuration(
                std::any::type_name::<T>(),
                "metadata registry holds a different type",
            )
        })
    }

    /// Number of compiled types
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}
