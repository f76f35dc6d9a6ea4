//! Registry of repositories
//!
//! An [`EntityStore`] owns the metadata registry and at most one repository
//! per entity type. It is an ordinary value: build one per application (or
//! per test) and pass it where it is needed.

use crate::config::StoreConfig;
use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::metadata::{EntityMetadata, MetadataRegistry};
use crate::migration::{MigrationPlan, MigrationReport, SchemaMigrator};
use crate::repository::Repository;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::any::{Any, TypeId};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// A repository of some entity type, as held by the store
trait OpenRepository: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn table(&self) -> &str;

    /// Close the pool if no caller still holds the repository
    fn close_if_unshared(self: Arc<Self>) -> BoxFuture<'static, bool>;
}

impl<T: Entity> OpenRepository for Repository<T> {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn table(&self) -> &str {
        Repository::table(self)
    }

    fn close_if_unshared(self: Arc<Self>) -> BoxFuture<'static, bool> {
        Box::pin(async move {
            match Arc::try_unwrap(self) {
                Ok(repository) => {
                    repository.close().await;
                    true
                }
                Err(_) => false,
            }
        })
    }
}

type RepositorySlot = Arc<OnceCell<Arc<dyn OpenRepository>>>;

pub struct EntityStore {
    config: StoreConfig,
    registry: Arc<MetadataRegistry>,
    migrator: SchemaMigrator,
    repositories: DashMap<TypeId, RepositorySlot>,
}

impl EntityStore {
    pub fn new(config: StoreConfig) -> Self {
        config.log_config();
        let registry = Arc::new(MetadataRegistry::new());
        let migrator = SchemaMigrator::new(Arc::clone(&registry), config.db.clone());
        Self {
            config,
            registry,
            migrator,
            repositories: DashMap::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Compiled metadata for `T`
    pub fn metadata<T: Entity>(&self) -> StoreResult<Arc<EntityMetadata<T>>> {
        self.registry.get::<T>()
    }

    pub fn migrator(&self) -> &SchemaMigrator {
        &self.migrator
    }

    /// Create or reconcile the table backing `T`
    pub async fn ensure_schema<T: Entity>(&self) -> StoreResult<MigrationReport> {
        self.migrator.ensure_schema::<T>().await
    }

    /// What [`ensure_schema`](Self::ensure_schema) would do for `T`
    pub async fn plan_schema<T: Entity>(&self) -> StoreResult<MigrationPlan> {
        self.migrator.plan::<T>().await
    }

    /// The repository for `T`, opened on first use
    ///
    /// Concurrent first calls share one construction. A failed construction
    /// is not cached, so a later call tries again.
    pub async fn repository<T: Entity>(&self) -> StoreResult<Arc<Repository<T>>> {
        let slot = self
            .repositories
            .entry(TypeId::of::<T>())
            .or_default()
            .clone();

        let erased = slot
            .get_or_try_init(|| async {
                let metadata = self.registry.get::<T>()?;
                let db = self
                    .config
                    .db
                    .for_service(format!("{}-{}", self.config.db.service_name, metadata.table()));
                let repository =
                    Repository::connect(metadata, db, self.config.repository.clone()).await?;
                info!(table = %repository.table(), "Repository opened");
                Ok::<_, StoreError>(Arc::new(repository) as Arc<dyn OpenRepository>)
            })
            .await?;

        Arc::clone(erased).into_any().downcast::<Repository<T>>().map_err(|_| {
            StoreError::configuration(
                std::any::type_name::<T>(),
                "repository registry holds a different type",
            )
        })
    }

    /// Number of opened repositories
    pub fn repository_count(&self) -> usize {
        self.repositories
            .iter()
            .filter(|slot| slot.value().initialized())
            .count()
    }

    /// Close the connection pools of every opened repository
    ///
    /// Returns how many pools were closed. A repository still held by a
    /// caller is skipped; its connections close when the last handle drops.
    pub async fn close(self) -> usize {
        let mut closed = 0;
        for (_, slot) in self.repositories {
            let Some(repository) = Arc::try_unwrap(slot).ok().and_then(OnceCell::into_inner) else {
                continue;
            };
            let table = repository.table().to_string();
            if repository.close_if_unshared().await {
                closed += 1;
            } else {
                warn!(table = %table, "Repository still in use, left open");
            }
        }
        info!(closed, "Entity store closed");
        closed
    }
}
