//! Database connection pool management
//!
//! A small, fixed set of long-lived PostgreSQL connections handed out
//! round-robin. Acquisition never queues behind a global wait list: it picks
//! the next slot, prefers any idle slot, and lazily reopens a slot whose
//! connection was found closed or was marked broken by its last user.
//! [`ConnectionPool::open_fresh`] always opens a brand-new, caller-owned
//! connection and is the fallback path when a pooled connection fails.

pub mod env_utils;
mod metrics;

use env_utils::{parse_env_bool, parse_env_required, parse_env_with_default};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Default number of pooled connections per repository
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Database connection pool configuration
#[derive(Clone)]
pub struct DbConfig {
    /// Service name for metrics labeling and `application_name`
    pub service_name: String,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Number of pooled connections (fixed for the pool's lifetime)
    pub pool_size: usize,
    /// Connection creation timeout (new connection to PostgreSQL)
    pub connect_timeout_secs: u64,
    /// Ping pooled connections before handing them out
    pub test_before_acquire: bool,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("service_name", &self.service_name)
            .field("database_url", &"[REDACTED]")
            .field("pool_size", &self.pool_size)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("test_before_acquire", &self.test_before_acquire)
            .finish()
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            service_name: String::from("unknown"),
            database_url: String::new(),
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout_secs: 5,
            test_before_acquire: true,
        }
    }
}

impl DbConfig {
    /// Create a new DbConfig from environment variables
    pub fn from_env(service_name: &str) -> Result<Self, String> {
        let database_url = parse_env_required::<String>("DATABASE_URL")?;

        Ok(Self {
            service_name: service_name.to_string(),
            database_url,
            pool_size: parse_env_with_default("DB_POOL_SIZE", DEFAULT_POOL_SIZE),
            connect_timeout_secs: parse_env_with_default("DB_CONNECT_TIMEOUT_SECS", 5),
            test_before_acquire: parse_env_bool("DB_TEST_BEFORE_ACQUIRE", true),
        })
    }

    /// Same settings under a different service label
    pub fn for_service(&self, service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..self.clone()
        }
    }

    /// Log pool configuration details
    pub fn log_config(&self) {
        info!(
            "Database Pool Configuration: service={}, pool_size={}, connect_timeout={}s, test_before_acquire={}",
            self.service_name, self.pool_size, self.connect_timeout_secs, self.test_before_acquire
        );
    }

    fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        let options: PgConnectOptions = self.database_url.parse()?;
        Ok(options.application_name(&self.service_name))
    }
}

/// Open a single standalone connection, bounded by the connect timeout
pub async fn open_connection(config: &DbConfig) -> Result<PgConnection, sqlx::Error> {
    let options = config.connect_options()?;
    connect_with_timeout(&options, config).await
}

async fn connect_with_timeout(
    options: &PgConnectOptions,
    config: &DbConfig,
) -> Result<PgConnection, sqlx::Error> {
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    match tokio::time::timeout(connect_timeout, PgConnection::connect_with(options)).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => {
            metrics::record_error(&config.service_name, &e);
            Err(e)
        }
        Err(_) => {
            let e = sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Database connect timeout",
            ));
            metrics::record_error(&config.service_name, &e);
            Err(e)
        }
    }
}

struct Slot {
    conn: Mutex<PgConnection>,
    stale: AtomicBool,
}

/// Fixed-size round-robin connection pool
pub struct ConnectionPool {
    config: DbConfig,
    options: PgConnectOptions,
    slots: Vec<Slot>,
    next: AtomicUsize,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl ConnectionPool {
    /// Open every slot eagerly
    ///
    /// A pool size of zero is treated as one.
    pub async fn connect(config: DbConfig) -> Result<Self, sqlx::Error> {
        let options = config.connect_options()?;
        let size = config.pool_size.max(1);

        debug!(
            service = %config.service_name,
            pool_size = size,
            "Opening connection pool"
        );

        let mut slots = Vec::with_capacity(size);
        for index in 0..size {
            match connect_with_timeout(&options, &config).await {
                Ok(conn) => slots.push(Slot {
                    conn: Mutex::new(conn),
                    stale: AtomicBool::new(false),
                }),
                Err(e) => {
                    error!(
                        service = %config.service_name,
                        slot = index,
                        error = %e,
                        "Failed to open pooled connection"
                    );
                    return Err(e);
                }
            }
        }

        metrics::record_slots(&config.service_name, size, 0);
        info!(
            service = %config.service_name,
            pool_size = size,
            "Connection pool created"
        );

        Ok(Self {
            config,
            options,
            slots,
            next: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Hand out the next pooled connection
    ///
    /// Starts at the round-robin cursor and takes the first idle slot. When
    /// every slot is in use it waits on the cursor slot only. A slot marked
    /// stale, or failing its ping when `test_before_acquire` is set, is
    /// reopened while its lock is held, so concurrent callers never open the
    /// same slot twice.
    pub async fn acquire(&self) -> Result<PooledConnection<'_>, sqlx::Error> {
        let start = Instant::now();
        let size = self.slots.len();
        let cursor = self.next.fetch_add(1, Ordering::Relaxed) % size;

        let idle = (0..size)
            .map(|offset| (cursor + offset) % size)
            .find_map(|index| {
                self.slots[index]
                    .conn
                    .try_lock()
                    .ok()
                    .map(|guard| (index, guard))
            });

        let (index, guard) = match idle {
            Some(found) => found,
            None => (cursor, self.slots[cursor].conn.lock().await),
        };

        let mut pooled = PooledConnection {
            slot: &self.slots[index],
            index,
            guard,
        };
        self.ensure_open(&mut pooled).await?;

        metrics::record_acquire(&self.config.service_name, start.elapsed());
        Ok(pooled)
    }

    /// Open a brand-new connection owned by the caller
    pub async fn open_fresh(&self) -> Result<PgConnection, sqlx::Error> {
        connect_with_timeout(&self.options, &self.config).await
    }

    /// Close every pooled connection
    pub async fn close(self) {
        for slot in self.slots {
            let conn = slot.conn.into_inner();
            if let Err(e) = conn.close().await {
                debug!(service = %self.config.service_name, error = %e, "Error closing pooled connection");
            }
        }
        metrics::record_slots(&self.config.service_name, 0, 0);
    }

    async fn ensure_open(&self, pooled: &mut PooledConnection<'_>) -> Result<(), sqlx::Error> {
        let mut needs_reopen = pooled.slot.stale.load(Ordering::Acquire);

        if !needs_reopen && self.config.test_before_acquire {
            if let Err(e) = pooled.guard.ping().await {
                debug!(
                    service = %self.config.service_name,
                    slot = pooled.index,
                    error = %e,
                    "Pooled connection failed ping"
                );
                needs_reopen = true;
            }
        }

        if !needs_reopen {
            return Ok(());
        }

        pooled.slot.stale.store(true, Ordering::Release);
        match self.open_fresh().await {
            Ok(conn) => {
                // Replacing drops the dead connection in place.
                *pooled.guard = conn;
                pooled.slot.stale.store(false, Ordering::Release);
                metrics::record_reopen(&self.config.service_name);
                self.record_slot_states();
                info!(
                    service = %self.config.service_name,
                    slot = pooled.index,
                    "Reopened pooled connection"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    service = %self.config.service_name,
                    slot = pooled.index,
                    error = %e,
                    "Failed to reopen pooled connection"
                );
                self.record_slot_states();
                Err(e)
            }
        }
    }

    fn record_slot_states(&self) {
        let stale = self
            .slots
            .iter()
            .filter(|slot| slot.stale.load(Ordering::Relaxed))
            .count();
        metrics::record_slots(&self.config.service_name, self.slots.len() - stale, stale);
    }
}

/// A pooled connection, exclusively held until dropped
pub struct PooledConnection<'a> {
    slot: &'a Slot,
    index: usize,
    guard: MutexGuard<'a, PgConnection>,
}

impl PooledConnection<'_> {
    /// Slot index inside the pool
    pub fn slot(&self) -> usize {
        self.index
    }

    /// Flag the connection as unusable so the next acquire of this slot
    /// reopens it
    pub fn mark_broken(&self) {
        self.slot.stale.store(true, Ordering::Release);
    }
}

impl Deref for PooledConnection<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
