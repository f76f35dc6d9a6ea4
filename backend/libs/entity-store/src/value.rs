//! Dynamic column values and the typed field conversions feeding them.
//!
//! [`FieldValue`] is what makes a Rust type usable as an entity field: it
//! names the column type, converts to and from [`Value`], and reports whether
//! the field still holds its default. That last bit drives query-by-example:
//! default fields are treated as "don't filter on this field".

use crate::column::ColumnType;
use crate::error::ValueError;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, Row};
use std::fmt;
use uuid::Uuid;

/// A single column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Decimal(BigDecimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    TextArray(Vec<String>),
    IntArray(Vec<i32>),
    BigIntArray(Vec<i64>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::SmallInt(_) => "smallint",
            Self::Int(_) => "integer",
            Self::BigInt(_) => "bigint",
            Self::Real(_) => "real",
            Self::Double(_) => "double",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
            Self::TimestampTz(_) => "timestamptz",
            Self::Json(_) => "json",
            Self::TextArray(_) => "text[]",
            Self::IntArray(_) => "integer[]",
            Self::BigIntArray(_) => "bigint[]",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Widen integers to the column's width so equal lookups bind and cache
    /// identically whatever integer type the caller used
    pub fn coerce_to(self, column_type: ColumnType) -> Self {
        match (column_type, self) {
            (ColumnType::BigInt, Self::Int(v)) => Self::BigInt(i64::from(v)),
            (ColumnType::BigInt, Self::SmallInt(v)) => Self::BigInt(i64::from(v)),
            (ColumnType::Integer, Self::SmallInt(v)) => Self::Int(i32::from(v)),
            (ColumnType::Double, Self::Real(v)) => Self::Double(f64::from(v)),
            (_, value) => value,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )+
    };
}

value_from!(
    bool => Bool,
    i16 => SmallInt,
    i32 => Int,
    i64 => BigInt,
    f32 => Real,
    f64 => Double,
    BigDecimal => Decimal,
    String => Text,
    Vec<u8> => Bytes,
    Uuid => Uuid,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
    serde_json::Value => Json,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<V: Into<Value>> From<Option<V>> for Value {
    fn from(v: Option<V>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Stable rendering used in cache keys and invalidation tags. Text is
/// quoted so a value can never be mistaken for a key separator.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{}", v),
            Self::SmallInt(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::BigInt(v) => write!(f, "{}", v),
            Self::Real(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Decimal(v) => write!(f, "{}", v.normalized()),
            Self::Text(v) => write!(f, "{:?}", v),
            Self::Bytes(v) => write!(f, "x{}", hex::encode(v)),
            Self::Uuid(v) => write!(f, "{}", v),
            Self::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%dT%H:%M:%S%.6f")),
            Self::TimestampTz(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Json(v) => write!(f, "{}", v),
            Self::TextArray(v) => write!(f, "{:?}", v),
            Self::IntArray(v) => write!(f, "{:?}", v),
            Self::BigIntArray(v) => write!(f, "{:?}", v),
        }
    }
}

/// A Rust type usable as an entity field
pub trait FieldValue: Sized + Send + Sync + 'static {
    fn column_type() -> ColumnType;

    fn to_value(&self) -> Result<Value, ValueError>;

    /// Build the field from a column value. NULL yields the default.
    fn from_value(value: Value) -> Result<Self, ValueError>;

    /// Zero, empty, nil or epoch: the field is "unset"
    fn is_default(&self) -> bool;
}

fn mismatch(expected: &'static str, found: &Value) -> ValueError {
    ValueError::Mismatch {
        expected,
        found: found.kind(),
    }
}

macro_rules! scalar_field {
    ($ty:ty, $column:ident, $variant:ident, $expected:literal, |$v:ident| $is_default:expr) => {
        impl FieldValue for $ty {
            fn column_type() -> ColumnType {
                ColumnType::$column
            }

            fn to_value(&self) -> Result<Value, ValueError> {
                Ok(Value::$variant(self.clone()))
            }

            fn from_value(value: Value) -> Result<Self, ValueError> {
                match value {
                    Value::$variant(v) => Ok(v),
                    Value::Null => Ok(<$ty>::default()),
                    other => Err(mismatch($expected, &other)),
                }
            }

            fn is_default(&self) -> bool {
                let $v = self;
                $is_default
            }
        }
    };
}

scalar_field!(bool, Boolean, Bool, "bool", |v| !*v);
scalar_field!(i16, SmallInt, SmallInt, "smallint", |v| *v == 0);
scalar_field!(f32, Real, Real, "real", |v| *v == 0.0);
scalar_field!(f64, Double, Double, "double", |v| *v == 0.0);
scalar_field!(BigDecimal, Decimal, Decimal, "decimal", |v| *v == BigDecimal::default());
scalar_field!(String, Text, Text, "text", |v| v.is_empty());
scalar_field!(Vec<u8>, Bytes, Bytes, "bytes", |v| v.is_empty());
scalar_field!(Uuid, Uuid, Uuid, "uuid", |v| v.is_nil());
scalar_field!(NaiveDateTime, Timestamp, Timestamp, "timestamp", |v| *v == NaiveDateTime::default());
scalar_field!(DateTime<Utc>, TimestampTz, TimestampTz, "timestamptz", |v| *v == DateTime::<Utc>::default());
scalar_field!(serde_json::Value, Jsonb, Json, "json", |v| v.is_null());
scalar_field!(Vec<String>, TextArray, TextArray, "text[]", |v| v.is_empty());
scalar_field!(Vec<i32>, IntegerArray, IntArray, "integer[]", |v| v.is_empty());
scalar_field!(Vec<i64>, BigIntArray, BigIntArray, "bigint[]", |v| v.is_empty());

// Integer fields also accept narrower integer values, so a key column read
// back from a widened table still converts.
impl FieldValue for i32 {
    fn column_type() -> ColumnType {
        ColumnType::Integer
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        Ok(Value::Int(*self))
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Int(v) => Ok(v),
            Value::SmallInt(v) => Ok(i32::from(v)),
            Value::BigInt(v) => {
                i32::try_from(v).map_err(|_| ValueError::OutOfRange(format!("{} as integer", v)))
            }
            Value::Null => Ok(0),
            other => Err(mismatch("integer", &other)),
        }
    }

    fn is_default(&self) -> bool {
        *self == 0
    }
}

impl FieldValue for i64 {
    fn column_type() -> ColumnType {
        ColumnType::BigInt
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        Ok(Value::BigInt(*self))
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::BigInt(v) => Ok(v),
            Value::Int(v) => Ok(i64::from(v)),
            Value::SmallInt(v) => Ok(i64::from(v)),
            Value::Null => Ok(0),
            other => Err(mismatch("bigint", &other)),
        }
    }

    fn is_default(&self) -> bool {
        *self == 0
    }
}

impl<V: FieldValue> FieldValue for Option<V> {
    fn column_type() -> ColumnType {
        V::column_type()
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        match self {
            Some(v) => v.to_value(),
            None => Ok(Value::Null),
        }
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Ok(None),
            other => V::from_value(other).map(Some),
        }
    }

    fn is_default(&self) -> bool {
        self.is_none()
    }
}

/// Nested record or list stored as a JSONB column
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Json<T>(pub T);

impl<T> FieldValue for Json<T>
where
    T: Serialize + DeserializeOwned + Default + PartialEq + Send + Sync + 'static,
{
    fn column_type() -> ColumnType {
        ColumnType::Jsonb
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        Ok(Value::Json(serde_json::to_value(&self.0)?))
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Json(v) => Ok(Json(serde_json::from_value(v)?)),
            Value::Null => Ok(Json(T::default())),
            other => Err(mismatch("json", &other)),
        }
    }

    fn is_default(&self) -> bool {
        self.0 == T::default()
    }
}

/// Store a fieldless enum as an INTEGER column
///
/// The enum must be `Copy + Default + PartialEq`, convert into `i32` and
/// implement `TryFrom<i32>`.
#[macro_export]
macro_rules! int_enum_field {
    ($ty:ty) => {
        impl $crate::FieldValue for $ty {
            fn column_type() -> $crate::ColumnType {
                $crate::ColumnType::Integer
            }

            fn to_value(&self) -> Result<$crate::Value, $crate::ValueError> {
                Ok($crate::Value::Int(i32::from(*self)))
            }

            fn from_value(value: $crate::Value) -> Result<Self, $crate::ValueError> {
                match value {
                    $crate::Value::Int(v) => {
                        <$ty>::try_from(v).map_err(|_| $crate::ValueError::InvalidEnum {
                            target: stringify!($ty),
                            value: v,
                        })
                    }
                    $crate::Value::Null => Ok(<$ty>::default()),
                    other => Err($crate::ValueError::Mismatch {
                        expected: "integer",
                        found: other.kind(),
                    }),
                }
            }

            fn is_default(&self) -> bool {
                *self == <$ty>::default()
            }
        }
    };
}

/// Append a bound parameter. NULL is typed after the target column so
/// PostgreSQL never has to guess.
pub(crate) fn add_argument(
    args: &mut PgArguments,
    value: &Value,
    column_type: ColumnType,
) -> Result<(), sqlx::error::BoxDynError> {
    match value {
        Value::Null => add_null(args, column_type),
        Value::Bool(v) => args.add(*v),
        Value::SmallInt(v) => args.add(*v),
        Value::Int(v) => args.add(*v),
        Value::BigInt(v) => args.add(*v),
        Value::Real(v) => args.add(*v),
        Value::Double(v) => args.add(*v),
        Value::Decimal(v) => args.add(v.clone()),
        Value::Text(v) => args.add(v.clone()),
        Value::Bytes(v) => args.add(v.clone()),
        Value::Uuid(v) => args.add(*v),
        Value::Timestamp(v) => args.add(*v),
        Value::TimestampTz(v) => args.add(*v),
        Value::Json(v) => args.add(v.clone()),
        Value::TextArray(v) => args.add(v.clone()),
        Value::IntArray(v) => args.add(v.clone()),
        Value::BigIntArray(v) => args.add(v.clone()),
    }
}

fn add_null(
    args: &mut PgArguments,
    column_type: ColumnType,
) -> Result<(), sqlx::error::BoxDynError> {
    match column_type {
        ColumnType::SmallInt => args.add(None::<i16>),
        ColumnType::Integer => args.add(None::<i32>),
        ColumnType::BigInt => args.add(None::<i64>),
        ColumnType::Real => args.add(None::<f32>),
        ColumnType::Double => args.add(None::<f64>),
        ColumnType::Decimal => args.add(None::<BigDecimal>),
        ColumnType::Text => args.add(None::<String>),
        ColumnType::Boolean => args.add(None::<bool>),
        ColumnType::Timestamp => args.add(None::<NaiveDateTime>),
        ColumnType::TimestampTz => args.add(None::<DateTime<Utc>>),
        ColumnType::Bytes => args.add(None::<Vec<u8>>),
        ColumnType::Uuid => args.add(None::<Uuid>),
        ColumnType::Jsonb => args.add(None::<serde_json::Value>),
        ColumnType::TextArray => args.add(None::<Vec<String>>),
        ColumnType::IntegerArray => args.add(None::<Vec<i32>>),
        ColumnType::BigIntArray => args.add(None::<Vec<i64>>),
    }
}

/// Decode one column of a row according to its declared type
pub(crate) fn read_column(
    row: &PgRow,
    column: &str,
    column_type: ColumnType,
) -> Result<Value, sqlx::Error> {
    let value = match column_type {
        ColumnType::SmallInt => row.try_get::<Option<i16>, _>(column)?.map(Value::SmallInt),
        ColumnType::Integer => row.try_get::<Option<i32>, _>(column)?.map(Value::Int),
        ColumnType::BigInt => row.try_get::<Option<i64>, _>(column)?.map(Value::BigInt),
        ColumnType::Real => row.try_get::<Option<f32>, _>(column)?.map(Value::Real),
        ColumnType::Double => row.try_get::<Option<f64>, _>(column)?.map(Value::Double),
        ColumnType::Decimal => row
            .try_get::<Option<BigDecimal>, _>(column)?
            .map(Value::Decimal),
        ColumnType::Text => row.try_get::<Option<String>, _>(column)?.map(Value::Text),
        ColumnType::Boolean => row.try_get::<Option<bool>, _>(column)?.map(Value::Bool),
        ColumnType::Timestamp => row
            .try_get::<Option<NaiveDateTime>, _>(column)?
            .map(Value::Timestamp),
        ColumnType::TimestampTz => row
            .try_get::<Option<DateTime<Utc>>, _>(column)?
            .map(Value::TimestampTz),
        ColumnType::Bytes => row.try_get::<Option<Vec<u8>>, _>(column)?.map(Value::Bytes),
        ColumnType::Uuid => row.try_get::<Option<Uuid>, _>(column)?.map(Value::Uuid),
        ColumnType::Jsonb => row
            .try_get::<Option<serde_json::Value>, _>(column)?
            .map(Value::Json),
        ColumnType::TextArray => row
            .try_get::<Option<Vec<String>>, _>(column)?
            .map(Value::TextArray),
        ColumnType::IntegerArray => row
            .try_get::<Option<Vec<i32>>, _>(column)?
            .map(Value::IntArray),
        ColumnType::BigIntArray => row
            .try_get::<Option<Vec<i64>>, _>(column)?
            .map(Value::BigIntArray),
    };
    Ok(value.unwrap_or(Value::Null))
}
