//! Bounded operations
//!
//! Every hypervisor call, agent RPC and mount-tool invocation runs through
//! [`bounded`], which races the operation against a timeout and a
//! cancellation token. Dropping the losing future aborts the work; child
//! processes are spawned with `kill_on_drop` for that reason.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `fut` for at most `limit`, giving up early if `cancel` fires
pub async fn bounded<T, F>(
    operation: &str,
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled {
            operation: operation.to_string(),
        }),
        outcome = tokio::time::timeout(limit, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                duration: limit,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_completes_within_limit() {
        let cancel = CancellationToken::new();
        let value = bounded("noop", Duration::from_secs(1), &cancel, async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_timeout_is_distinct() {
        let cancel = CancellationToken::new();
        let result: Result<()> = bounded("slow", Duration::from_millis(10), &cancel, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_matches!(result, Err(Error::Timeout { ref operation, .. }) if operation == "slow");
    }

    #[tokio::test]
    async fn test_cancellation_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = bounded("attach", Duration::from_secs(5), &cancel, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_matches!(result, Err(Error::Cancelled { .. }));
    }
}
