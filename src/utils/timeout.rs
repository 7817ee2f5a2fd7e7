//! Timeout helpers for the few operations that may suspend a caller.

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// Default upper bound on an outbound stream connect
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `fut` with a deadline, mapping expiry to [`TransportError::ConnectTimeout`]
pub async fn with_timeout<F, T>(fut: F, limit: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::ConnectTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(TransportError::ConnectTimeout)));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_inner_result() {
        let result = with_timeout(async { Ok(7u8) }, Duration::from_secs(1)).await;
        assert_eq!(result.ok(), Some(7));
    }
}
