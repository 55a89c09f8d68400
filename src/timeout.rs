use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Bounds a backend call so a stalled request fails fast instead of hanging.
pub async fn with_timeout<T, F>(future: F, description: &str, limit: Duration) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => {
            let after_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
            tracing::error!("[Timeout] {} timed out after {}ms", description, after_ms);
            Err(AppError::Timeout {
                description: description.to_string(),
                after_ms,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stalled_call_times_out() {
        let started = tokio::time::Instant::now();
        let result: AppResult<()> = with_timeout(
            std::future::pending(),
            "session fetch",
            Duration::from_secs(10),
        )
        .await;

        match result {
            Err(AppError::Timeout {
                description,
                after_ms,
            }) => {
                assert_eq!(description, "session fetch");
                assert_eq!(after_ms, 10_000);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_call_passes_through() {
        let result = with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(42)
            },
            "profile fetch",
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_inner_error_is_preserved() {
        let result: AppResult<()> = with_timeout(
            async { Err(AppError::NotFound("profile".to_string())) },
            "profile fetch",
            Duration::from_secs(10),
        )
        .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
