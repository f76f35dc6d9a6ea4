//! Prometheus metrics for the connection pool
//!
//! Tracks acquisition latency, slot reopen events and connection errors

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};
use std::time::Duration;

lazy_static::lazy_static! {
    /// Pool slot count by state (open/stale)
    static ref DB_POOL_SLOTS: IntGaugeVec = register_int_gauge_vec!(
        "db_pool_slots",
        "Database pool slot count by state",
        &["service", "state"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Time to acquire a connection from the pool, including any reopen
    static ref DB_POOL_ACQUIRE_DURATION: HistogramVec = register_histogram_vec!(
        "db_pool_acquire_duration_seconds",
        "Time to acquire connection from pool",
        &["service"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Slots reopened after being found closed or broken
    static ref DB_POOL_REOPENS: IntCounterVec = register_int_counter_vec!(
        "db_pool_reopens_total",
        "Pooled connections reopened lazily",
        &["service"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Connection errors by type
    static ref DB_POOL_CONNECTION_ERRORS: IntCounterVec = register_int_counter_vec!(
        "db_pool_connection_errors_total",
        "Connection open/acquire errors",
        &["service", "error_type"]
    ).expect("Prometheus metrics registration should succeed at startup");
}

pub(crate) fn record_slots(service: &str, open: usize, stale: usize) {
    DB_POOL_SLOTS
        .with_label_values(&[service, "open"])
        .set(open as i64);
    DB_POOL_SLOTS
        .with_label_values(&[service, "stale"])
        .set(stale as i64);
}

pub(crate) fn record_acquire(service: &str, elapsed: Duration) {
    DB_POOL_ACQUIRE_DURATION
        .with_label_values(&[service])
        .observe(elapsed.as_secs_f64());
}

pub(crate) fn record_reopen(service: &str) {
    DB_POOL_REOPENS.with_label_values(&[service]).inc();
}

pub(crate) fn record_error(service: &str, error: &sqlx::Error) {
    let error_type = match error {
        sqlx::Error::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => "timeout",
        sqlx::Error::Io(_) => "io",
        sqlx::Error::Tls(_) => "tls",
        sqlx::Error::Database(_) => "database",
        sqlx::Error::Configuration(_) => "configuration",
        _ => "other",
    };

    DB_POOL_CONNECTION_ERRORS
        .with_label_values(&[service, error_type])
        .inc();
}
