//! Environment variable parsing utilities
//!
//! Safe, ergonomic parsing of configuration knobs with sensible defaults,
//! shared by the pool and the repository settings.

use std::str::FromStr;
use std::time::Duration;

/// Parse an environment variable with a default fallback
///
/// Missing and unparsable values both fall back to `default`.
///
/// # Example
/// ```ignore
/// let pool_size: usize = parse_env_with_default("DB_POOL_SIZE", 5);
/// ```
pub fn parse_env_with_default<T: FromStr>(key: &str, default: T) -> T {
    parse_env_optional(key).unwrap_or(default)
}

/// Parse an environment variable, returning None if missing or invalid
pub fn parse_env_optional<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse a required environment variable
///
/// # Example
/// ```ignore
/// let database_url = parse_env_required::<String>("DATABASE_URL")?;
/// ```
pub fn parse_env_required<T: FromStr>(key: &str) -> Result<T, String> {
    std::env::var(key)
        .map_err(|_| format!("Environment variable {} not found", key))?
        .trim()
        .parse()
        .map_err(|_| format!("Failed to parse environment variable {}", key))
}

/// Parse a boolean flag. Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
pub fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Parse a duration expressed in whole seconds
pub fn parse_env_secs(key: &str, default: Duration) -> Duration {
    parse_env_optional::<u64>(key)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Parse a duration expressed in whole milliseconds
pub fn parse_env_millis(key: &str, default: Duration) -> Duration {
    parse_env_optional::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}
