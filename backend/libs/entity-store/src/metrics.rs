//! Prometheus metrics for repositories, the read cache and migrations

use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};
use std::time::Duration;

lazy_static::lazy_static! {
    static ref STORE_QUERIES: IntCounterVec = register_int_counter_vec!(
        "entity_store_queries_total",
        "Commands sent to the database by repository operation",
        &["table", "operation"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref STORE_QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "entity_store_query_duration_seconds",
        "Repository operation latency including connection fallback",
        &["table", "operation"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref STORE_RETRIES: IntCounterVec = register_int_counter_vec!(
        "entity_store_fresh_connection_retries_total",
        "Operations retried on a fresh connection after a pooled failure",
        &["table", "operation"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref STORE_CACHE_LOOKUPS: IntCounterVec = register_int_counter_vec!(
        "entity_store_cache_lookups_total",
        "Read cache lookups by result (hit/miss)",
        &["table", "result"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref STORE_CACHE_INVALIDATIONS: IntCounterVec = register_int_counter_vec!(
        "entity_store_cache_invalidated_entries_total",
        "Cached results removed by writes or explicit invalidation",
        &["table"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref STORE_BULK_ROWS: IntCounterVec = register_int_counter_vec!(
        "entity_store_bulk_rows_total",
        "Rows written by bulk operations",
        &["table", "operation"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref STORE_MIGRATIONS: IntCounterVec = register_int_counter_vec!(
        "entity_store_migrations_total",
        "Schema reconciliations by outcome",
        &["table", "kind"]
    ).expect("Prometheus metrics registration should succeed at startup");
}

pub(crate) fn record_query(table: &str, operation: &str, elapsed: Duration) {
    STORE_QUERIES.with_label_values(&[table, operation]).inc();
    STORE_QUERY_DURATION
        .with_label_values(&[table, operation])
        .observe(elapsed.as_secs_f64());
}

pub(crate) fn record_retry(table: &str, operation: &str) {
    STORE_RETRIES.with_label_values(&[table, operation]).inc();
}

pub(crate) fn record_cache_lookup(table: &str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    STORE_CACHE_LOOKUPS.with_label_values(&[table, result]).inc();
}

pub(crate) fn record_invalidation(table: &str, removed: usize) {
    if removed > 0 {
        STORE_CACHE_INVALIDATIONS
            .with_label_values(&[table])
            .inc_by(removed as u64);
    }
}

pub(crate) fn record_bulk_rows(table: &str, operation: &str, rows: usize) {
    STORE_BULK_ROWS
        .with_label_values(&[table, operation])
        .inc_by(rows as u64);
}

pub(crate) fn record_migration(table: &str, kind: &str) {
    STORE_MIGRATIONS.with_label_values(&[table, kind]).inc();
}
