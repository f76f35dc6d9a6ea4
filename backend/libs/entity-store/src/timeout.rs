//! Per-call deadlines
//!
//! Repositories carry default deadlines from [`RepositorySettings`]. A caller
//! that needs a different one for a single call wraps it in
//! [`with_timeout`]; concurrent callers each keep their own value.
//!
//! ```ignore
//! let player = entity_store::with_timeout(
//!     Duration::from_millis(50),
//!     players.find_by_key(7),
//! )
//! .await?;
//! ```
//!
//! [`RepositorySettings`]: crate::config::RepositorySettings

use std::future::Future;
use std::time::Duration;

tokio::task_local! {
    static CALL_TIMEOUT: Duration;
}

/// Run `operation` with `timeout` as the deadline of every database call it
/// makes, in place of the repository defaults
///
/// The deadline applies per attempt for single statements and to the whole
/// transaction for bulk loads and schema changes. The innermost scope wins.
pub async fn with_timeout<F>(timeout: Duration, operation: F) -> F::Output
where
    F: Future,
{
    CALL_TIMEOUT.scope(timeout, operation).await
}

/// Deadline set by an enclosing [`with_timeout`], if any
pub(crate) fn call_timeout() -> Option<Duration> {
    CALL_TIMEOUT.try_with(|timeout| *timeout).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_scope_has_no_timeout() {
        assert_eq!(call_timeout(), None);
    }

    #[tokio::test]
    async fn test_innermost_scope_wins() {
        let (outer, inner) = with_timeout(Duration::from_secs(2), async {
            let outer = call_timeout();
            let inner = with_timeout(Duration::from_millis(20), async { call_timeout() }).await;
            (outer, inner)
        })
        .await;
        assert_eq!(outer, Some(Duration::from_secs(2)));
        assert_eq!(inner, Some(Duration::from_millis(20)));
        assert_eq!(call_timeout(), None);
    }

    #[tokio::test]
    async fn test_concurrent_calls_keep_their_own_timeout() {
        let slow = with_timeout(Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            call_timeout()
        });
        let fast = with_timeout(Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            call_timeout()
        });
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow, Some(Duration::from_secs(5)));
        assert_eq!(fast, Some(Duration::from_millis(100)));
    }
}
