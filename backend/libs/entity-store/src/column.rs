//! Column type mapping
//!
//! The single source of truth for how a field's declared type becomes a
//! PostgreSQL column, both when creating tables and when deciding whether a
//! live column already matches.

/// Canonical database column type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal,
    Text,
    Boolean,
    /// Timestamp without time zone
    Timestamp,
    /// Timestamp with time zone
    TimestampTz,
    Bytes,
    Uuid,
    /// Structured values, nested records and generic lists
    Jsonb,
    TextArray,
    IntegerArray,
    BigIntArray,
}

impl ColumnType {
    /// Type name used in DDL
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::SmallInt => "SMALLINT",
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Real => "REAL",
            Self::Double => "DOUBLE PRECISION",
            Self::Decimal => "DECIMAL",
            Self::Text => "TEXT",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
            Self::TimestampTz => "TIMESTAMPTZ",
            Self::Bytes => "BYTEA",
            Self::Uuid => "UUID",
            Self::Jsonb => "JSONB",
            Self::TextArray => "TEXT[]",
            Self::IntegerArray => "INTEGER[]",
            Self::BigIntArray => "BIGINT[]",
        }
    }

    /// Type name as reported by the catalog after [`normalize_catalog_type`]
    pub fn catalog_type(&self) -> &'static str {
        match self {
            Self::SmallInt => "smallint",
            Self::Integer => "integer",
            Self::BigInt => "bigint",
            Self::Real => "real",
            Self::Double => "double precision",
            Self::Decimal => "numeric",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp without time zone",
            Self::TimestampTz => "timestamp with time zone",
            Self::Bytes => "bytea",
            Self::Uuid => "uuid",
            Self::Jsonb => "jsonb",
            Self::TextArray => "text[]",
            Self::IntegerArray => "integer[]",
            Self::BigIntArray => "bigint[]",
        }
    }

    /// Key column definition, with a database-generated value where one
    /// exists for the type
    pub fn key_definition(&self) -> String {
        match self {
            Self::SmallInt => "SMALLSERIAL PRIMARY KEY".to_string(),
            Self::Integer => "SERIAL PRIMARY KEY".to_string(),
            Self::BigInt => "BIGSERIAL PRIMARY KEY".to_string(),
            Self::Uuid => "UUID PRIMARY KEY DEFAULT gen_random_uuid()".to_string(),
            other => format!("{} PRIMARY KEY", other.sql_type()),
        }
    }

    /// Whether the database generates key values for this type
    pub fn is_generated_key(&self) -> bool {
        matches!(self, Self::SmallInt | Self::Integer | Self::BigInt | Self::Uuid)
    }

    /// Whether the key is backed by a sequence
    pub fn is_serial_key(&self) -> bool {
        matches!(self, Self::SmallInt | Self::Integer | Self::BigInt)
    }
}

/// Fold a catalog `(data_type, udt_name)` pair into the canonical name used
/// for comparison
///
/// `information_schema.columns` reports every array as `ARRAY`, so the
/// element type is recovered from the underscore-prefixed `udt_name`.
pub fn normalize_catalog_type(data_type: &str, udt_name: &str) -> String {
    if !data_type.eq_ignore_ascii_case("ARRAY") {
        return data_type.to_ascii_lowercase();
    }

    let element = match udt_name.trim_start_matches('_').to_ascii_lowercase().as_str() {
        "int2" => "smallint".to_string(),
        "int4" => "integer".to_string(),
        "int8" => "bigint".to_string(),
        "float4" => "real".to_string(),
        "float8" => "double precision".to_string(),
        "bool" => "boolean".to_string(),
        "varchar" => "character varying".to_string(),
        other => other.to_string(),
    };
    format!("{}[]", element)
}

/// Widenings applicable in place with `ALTER COLUMN ... TYPE`
const SAFE_WIDENINGS: &[(&str, &[&str])] = &[
    ("smallint", &["integer", "bigint", "decimal", "numeric"]),
    ("integer", &["bigint", "decimal", "numeric"]),
    ("character varying", &["text"]),
    ("varchar", &["text"]),
    ("real", &["double precision"]),
];

/// Whether converting a live column of type `from` to `to` cannot lose data
///
/// Identical types are trivially safe. Anything absent from the table,
/// narrowing and cross-family changes included, is unsafe.
pub fn is_safe_widening(from: &str, to: &str) -> bool {
    let from = from.to_ascii_lowercase();
    let to = to.to_ascii_lowercase();
    if from == to {
        return true;
    }

    SAFE_WIDENINGS
        .iter()
        .find(|(source, _)| *source == from)
        .map(|(_, targets)| targets.contains(&to.as_str()))
        .unwrap_or(false)
}
