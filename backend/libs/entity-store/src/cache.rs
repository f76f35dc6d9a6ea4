//! Per-repository read cache
//!
//! Results are stored under a deterministic key built from the table, the
//! operation and its parameters, and tagged with what they depend on: the
//! entity keys they contain, the column values they filtered on, or the
//! unfiltered listing. Writes invalidate by tag through a reverse index
//! instead of scanning key strings.
//!
//! Expiry is sliding: every hit pushes the deadline out by the configured
//! duration. Expired entries are dropped lazily when looked up.
//!
//! Inserts share a gate that invalidation takes exclusively, so an entry is
//! either stored and indexed before an invalidation starts or rejected by
//! the generation check after it.

use crate::metrics;
use crate::value::Value;
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Bumped whenever the key layout changes
const KEY_VERSION: &str = "v1";

/// Parameter segments longer than this are replaced by their digest
const MAX_PARAMS_SEGMENT: usize = 200;

/// What a cached result depends on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheTag {
    /// Contains, or was looked up by, the entity with this key
    Entity(String),
    /// Filtered on `column = value`
    Column { column: String, value: String },
    /// Unfiltered listing, stale after any insert
    List,
}

impl CacheTag {
    pub fn entity(key: &Value) -> Self {
        Self::Entity(key.to_string())
    }

    pub fn column(column: &str, value: &Value) -> Self {
        Self::Column {
            column: column.to_string(),
            value: value.to_string(),
        }
    }
}

/// Build a cache key of the form `v1:{table}:{operation}:{params}[:limit=N]`
///
/// Parameters keep their given order, which callers derive from field
/// declaration order, so equal queries always produce equal keys.
pub fn cache_key(
    table: &str,
    operation: &str,
    params: &[(&str, &Value)],
    limit: Option<usize>,
) -> String {
    let mut segment = params
        .iter()
        .map(|(column, value)| format!("{}={}", column, value))
        .collect::<Vec<_>>()
        .join("&");

    if segment.len() > MAX_PARAMS_SEGMENT {
        segment = format!("sha256-{}", hex::encode(Sha256::digest(segment.as_bytes())));
    }

    match limit {
        Some(limit) => format!(
            "{}:{}:{}:{}:limit={}",
            KEY_VERSION, table, operation, segment, limit
        ),
        None => format!("{}:{}:{}:{}", KEY_VERSION, table, operation, segment),
    }
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    tags: Vec<CacheTag>,
}

/// Tag-indexed cache with sliding expiration
pub struct ReadCache<V> {
    table: String,
    entries: DashMap<String, CacheEntry<V>>,
    index: DashMap<CacheTag, HashSet<String>>,
    gate: RwLock<()>,
    enabled: AtomicBool,
    ttl_millis: AtomicU64,
    generation: AtomicU64,
}

impl<V: Clone> ReadCache<V> {
    pub fn new(table: impl Into<String>, enabled: bool, ttl: Duration) -> Self {
        Self {
            table: table.into(),
            entries: DashMap::new(),
            index: DashMap::new(),
            gate: RwLock::new(()),
            enabled: AtomicBool::new(enabled),
            ttl_millis: AtomicU64::new(ttl.as_millis() as u64),
            generation: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turning the cache off also drops everything it holds
    pub fn set_enabled(&self, enabled: bool) {
        let was_enabled = self.enabled.swap(enabled, Ordering::AcqRel);
        if was_enabled && !enabled {
            self.clear();
        }
        debug!(table = %self.table, enabled, "Read cache toggled");
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_millis.load(Ordering::Acquire))
    }

    /// Applies to entries inserted or hit from now on
    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl_millis
            .store(ttl.as_millis() as u64, Ordering::Release);
    }

    /// Invalidation counter, read before running a query so a result
    /// computed across a concurrent write is not cached
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a result, refreshing its deadline on a hit
    pub fn get(&self, key: &str) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }

        let now = Instant::now();
        let hit = match self.entries.get_mut(key) {
            Some(mut entry) if entry.expires_at > now => {
                entry.expires_at = now + self.ttl();
                Some(entry.value.clone())
            }
            Some(_) => None,
            None => {
                metrics::record_cache_lookup(&self.table, false);
                return None;
            }
        };

        if hit.is_none() {
            self.remove_expired(key, now);
        }
        metrics::record_cache_lookup(&self.table, hit.is_some());
        hit
    }

    /// Store a result unless the cache is off or an invalidation ran since
    /// `generation` was read
    pub fn insert(&self, key: String, value: V, tags: Vec<CacheTag>, generation: u64) {
        let _gate = self.gate.read();
        if !self.is_enabled() || self.generation() != generation {
            return;
        }

        for tag in &tags {
            self.index.entry(tag.clone()).or_default().insert(key.clone());
        }
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl(),
            tags,
        };
        self.entries.insert(key, entry);
    }

    /// Remove every entry carrying any of `tags`
    pub fn invalidate(&self, tags: &[CacheTag]) -> usize {
        let gate = self.gate.write();
        self.generation.fetch_add(1, Ordering::AcqRel);

        let mut removed = 0;
        for tag in tags {
            let keys = match self.index.remove(tag) {
                Some((_, keys)) => keys,
                None => continue,
            };
            for key in keys {
                if self.remove_entry(&key) {
                    removed += 1;
                }
            }
        }
        drop(gate);

        metrics::record_invalidation(&self.table, removed);
        if removed > 0 {
            debug!(table = %self.table, removed, "Invalidated cached results");
        }
        removed
    }

    /// Drop everything
    pub fn clear(&self) -> usize {
        let gate = self.gate.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let removed = self.entries.len();
        self.entries.clear();
        self.index.clear();
        drop(gate);
        metrics::record_invalidation(&self.table, removed);
        removed
    }

    /// Drop `key` if it is still expired once no insert is in flight
    fn remove_expired(&self, key: &str, now: Instant) {
        let _gate = self.gate.write();
        let expired = self
            .entries
            .get(key)
            .map(|entry| entry.expires_at <= now)
            .unwrap_or(false);
        if expired {
            self.remove_entry(key);
        }
    }

    /// Callers hold the gate exclusively
    fn remove_entry(&self, key: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(key) else {
            return false;
        };
        for tag in &entry.tags {
            let now_empty = match self.index.get_mut(tag) {
                Some(mut keys) => {
                    keys.remove(key);
                    keys.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.index.remove_if(tag, |_, keys| keys.is_empty());
            }
        }
        true
    }
}
