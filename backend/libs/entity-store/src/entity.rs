//! Entity declaration
//!
//! An entity is any flat struct mapped to one table. It declares its table
//! name and a list of [`FieldDef`]s, each carrying typed accessor functions
//! so per-row marshalling is a direct call instead of introspection.
//!
//! ```ignore
//! #[derive(Debug, Clone, Default, PartialEq)]
//! pub struct Player {
//!     pub id: i64,
//!     pub display_name: String,
//!     pub level: i32,
//! }
//!
//! entity_store::impl_entity!(Player, table = "players", key = id, fields {
//!     id: i64 => "id",
//!     display_name: String => "display_name",
//!     level: i32 => "level",
//! });
//! ```

use crate::column::ColumnType;
use crate::error::ValueError;
use crate::value::{FieldValue, Value};
use std::fmt;

type Getter<T> = Box<dyn Fn(&T) -> Result<Value, ValueError> + Send + Sync>;
type Setter<T> = Box<dyn Fn(&mut T, Value) -> Result<(), ValueError> + Send + Sync>;
type DefaultCheck<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// A record type stored in its own table
pub trait Entity: Default + Clone + Send + Sync + 'static {
    /// Table name
    const TABLE: &'static str;

    /// Field descriptors, exactly one of them marked as key
    fn fields() -> Vec<FieldDef<Self>>;
}

/// One field of an entity with its compiled accessors
pub struct FieldDef<T> {
    name: &'static str,
    column: &'static str,
    column_type: ColumnType,
    is_key: bool,
    get: Getter<T>,
    set: Setter<T>,
    is_default: DefaultCheck<T>,
}

impl<T: 'static> FieldDef<T> {
    /// Describe a field through a pair of accessor functions
    pub fn new<V: FieldValue>(
        name: &'static str,
        column: &'static str,
        is_key: bool,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) -> Self {
        Self {
            name,
            column,
            column_type: V::column_type(),
            is_key,
            get: Box::new(move |entity| get(entity).to_value()),
            set: Box::new(move |entity, value| {
                *get_mut(entity) = V::from_value(value)?;
                Ok(())
            }),
            is_default: Box::new(move |entity| get(entity).is_default()),
        }
    }

    /// Key field
    pub fn key<V: FieldValue>(
        name: &'static str,
        column: &'static str,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) -> Self {
        Self::new(name, column, true, get, get_mut)
    }

    /// Regular column
    pub fn field<V: FieldValue>(
        name: &'static str,
        column: &'static str,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) -> Self {
        Self::new(name, column, false, get, get_mut)
    }
}

impl<T> FieldDef<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn column(&self) -> &'static str {
        self.column
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn get(&self, entity: &T) -> Result<Value, ValueError> {
        (self.get)(entity)
    }

    pub fn set(&self, entity: &mut T, value: Value) -> Result<(), ValueError> {
        (self.set)(entity, value)
    }

    pub fn is_default(&self, entity: &T) -> bool {
        (self.is_default)(entity)
    }
}

impl<T> fmt::Debug for FieldDef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("column", &self.column)
            .field("column_type", &self.column_type)
            .field("is_key", &self.is_key)
            .finish()
    }
}

/// Implement [`Entity`] for a struct
///
/// Lists the table, the key field and every mapped field with its type and
/// column name. Accessors are generated as plain functions.
#[macro_export]
macro_rules! impl_entity {
    (
        $ty:ty,
        table = $table:expr,
        key = $key:ident,
        fields { $($field:ident : $fty:ty => $column:expr),+ $(,)? }
    ) => {
        impl $crate::Entity for $ty {
            const TABLE: &'static str = $table;

            fn fields() -> ::std::vec::Vec<$crate::FieldDef<Self>> {
                ::std::vec![
                    $(
                        $crate::FieldDef::<$ty>::new::<$fty>(
                            stringify!($field),
                            $column,
                            stringify!($field) == stringify!($key),
                            {
                                fn get(entity: &$ty) -> &$fty {
                                    &entity.$field
                                }
                                get
                            },
                            {
                                fn get_mut(entity: &mut $ty) -> &mut $fty {
                                    &mut entity.$field
                                }
                                get_mut
                            },
                        ),
                    )+
                ]
            }
        }
    };
}
