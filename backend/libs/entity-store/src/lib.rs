//! Typed PostgreSQL repositories
//!
//! Declare a flat struct as an [`Entity`], let the [`SchemaMigrator`] create
//! or reconcile its table, then read and write it through a
//! [`Repository`] without writing SQL:
//!
//! ```ignore
//! use entity_store::{EntityStore, StoreConfig};
//!
//! let store = EntityStore::new(StoreConfig::from_env("game-backend")?);
//! store.ensure_schema::<Player>().await?;
//!
//! let players = store.repository::<Player>().await?;
//! let mut player = Player { display_name: "ann".into(), level: 3, ..Default::default() };
//! players.save(&mut player, true).await?;
//!
//! let found = players.find(&Player { display_name: "ann".into(), ..Default::default() }).await?;
//! ```
//!
//! # Components
//!
//! - [`metadata`]: per-type table description and prebuilt commands,
//!   compiled once per [`MetadataRegistry`]
//! - [`migration`]: create, alter in place, or rebuild tables
//! - [`repository`]: find/save/update/delete with pooled connections, a
//!   single fresh-connection retry and a tag-invalidated [`ReadCache`]
//! - [`bulk`]: binary COPY bulk insert and batched bulk update
//! - [`timeout`]: per-call deadlines over the configured defaults
//!
//! # Lookup by example
//!
//! `find`, `find_all`, `find_many`, `count` and `delete` filter on the
//! template's fields that differ from their default value. A field set to
//! `0`, `""`, `false` or `None` is not a filter, so those values cannot be
//! searched for by example; use `find_by_column` instead.

pub mod bulk;
pub mod cache;
pub mod column;
pub mod config;
pub mod copy;
pub mod entity;
pub mod error;
pub mod metadata;
mod metrics;
pub mod migration;
pub mod repository;
pub mod sql;
pub mod store;
pub mod timeout;
pub mod value;

pub use cache::{CacheTag, ReadCache};
pub use column::ColumnType;
pub use config::{RepositorySettings, StoreConfig};
pub use entity::{Entity, FieldDef};
pub use error::{StoreError, StoreResult, ValueError};
pub use metadata::{EntityMetadata, MetadataRegistry};
pub use migration::{MigrationKind, MigrationPlan, MigrationReport, SchemaMigrator};
pub use repository::{Repository, RepositoryStats, StatsSnapshot};
pub use store::EntityStore;
pub use timeout::with_timeout;
pub use value::{FieldValue, Json, Value};

pub use db_pool::{ConnectionPool, DbConfig};
