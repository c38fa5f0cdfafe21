use crate::envelope::{Envelope, Recipient, SendOptions};
use crate::router::MessageRouter;
use dirigent_core::{DirigentError, DirigentResult, Priority};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Configures retry behaviour for correlated requests.
///
/// Nothing in the router retries on its own; retries happen only when a
/// caller opts in through [`MessageRouter::request_with_retry`], and only
/// for acknowledgement timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Computes the backoff delay for a given attempt using exponential backoff
/// capped at `backoff_max_ms`.
fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

impl MessageRouter {
    /// Send a correlated request and await its response.
    ///
    /// The request travels as a require-ack envelope whose id is the
    /// correlation id; the recipient resolves it by calling
    /// [`respond`](Self::respond) with that id. Returns
    /// [`DirigentError::AcknowledgementTimeout`] when no response arrives
    /// within `ttl_ms`.
    pub async fn request(
        &self,
        from: &str,
        to: &str,
        method: &str,
        params: serde_json::Value,
        priority: Priority,
        ttl_ms: u64,
    ) -> DirigentResult<serde_json::Value> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let envelope = Envelope::new(
            from,
            Recipient::Worker(to.to_string()),
            "rpc_request",
            serde_json::json!({ "method": method, "params": params }),
            &SendOptions {
                priority,
                ttl_ms,
                require_ack: true,
            },
        );
        // The responder is registered before delivery, so a recipient that
        // answers from inside its handler cannot race this await.
        let envelope = self.dispatch(envelope, Some(tx)).await?;

        match tokio::time::timeout(Duration::from_millis(ttl_ms), rx).await {
            Ok(Ok(value)) => {
                debug!(envelope = %envelope.id, method, "rpc resolved");
                Ok(value)
            }
            Ok(Err(_)) | Err(_) => {
                self.forget(envelope.id).await;
                Err(DirigentError::AcknowledgementTimeout {
                    envelope: envelope.id,
                    ttl_ms,
                })
            }
        }
    }

    /// [`request`](Self::request) with explicit retry on acknowledgement
    /// timeout, backing off exponentially between attempts.
    pub async fn request_with_retry(
        &self,
        from: &str,
        to: &str,
        method: &str,
        params: serde_json::Value,
        priority: Priority,
        ttl_ms: u64,
        policy: &RetryPolicy,
    ) -> DirigentResult<serde_json::Value> {
        let mut attempt = 0u32;
        loop {
            match self
                .request(from, to, method, params.clone(), priority, ttl_ms)
                .await
            {
                Ok(value) => return Ok(value),
                Err(DirigentError::AcknowledgementTimeout { envelope, .. })
                    if attempt < policy.max_retries =>
                {
                    let delay = compute_backoff(policy, attempt);
                    warn!(%envelope, attempt, delay_ms = delay, "rpc timed out, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::router::MessageHandler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Echo responder: answers every rpc_request with its params.
    struct EchoHandler {
        name: String,
        router: Arc<MessageRouter>,
        calls: Arc<AtomicUsize>,
        /// Number of initial requests to ignore (to exercise retries).
        ignore_first: usize,
    }

    #[async_trait]
    impl MessageHandler for EchoHandler {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, envelope: &Envelope) -> DirigentResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.ignore_first {
                return Ok(());
            }
            let router = self.router.clone();
            let id = envelope.id;
            let params = envelope.content["params"].clone();
            // Respond from a separate task, as a real worker would.
            tokio::spawn(async move {
                let _ = router.respond(id, params).await;
            });
            Ok(())
        }
    }

    fn echo(router: &Arc<MessageRouter>, ignore_first: usize) -> (Arc<EchoHandler>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(EchoHandler {
                name: "scout".to_string(),
                router: router.clone(),
                calls: calls.clone(),
                ignore_first,
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn test_request_resolves_with_response() {
        let router = Arc::new(MessageRouter::new());
        let (handler, _) = echo(&router, 0);
        router.register_handler(handler).await;

        let value = router
            .request(
                "planner",
                "scout",
                "survey",
                serde_json::json!({"zone": 4}),
                Priority::Normal,
                1_000,
            )
            .await
            .unwrap();

        assert_eq!(value["zone"], 4);
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_times_out_without_response() {
        let router = Arc::new(MessageRouter::new());
        let (handler, _) = echo(&router, usize::MAX);
        router.register_handler(handler).await;

        let result = router
            .request(
                "planner",
                "scout",
                "survey",
                serde_json::Value::Null,
                Priority::Normal,
                25,
            )
            .await;

        assert!(matches!(
            result,
            Err(DirigentError::AcknowledgementTimeout { ttl_ms: 25, .. })
        ));
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_ignored_attempts() {
        let router = Arc::new(MessageRouter::new());
        let (handler, calls) = echo(&router, 2);
        router.register_handler(handler).await;

        let policy = RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
        };
        let value = router
            .request_with_retry(
                "planner",
                "scout",
                "survey",
                serde_json::json!({"zone": 7}),
                Priority::Normal,
                25,
                &policy,
            )
            .await
            .unwrap();

        assert_eq!(value["zone"], 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_timeout() {
        let router = Arc::new(MessageRouter::new());
        let (handler, calls) = echo(&router, usize::MAX);
        router.register_handler(handler).await;

        let policy = RetryPolicy {
            max_retries: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
        };
        let result = router
            .request_with_retry(
                "planner",
                "scout",
                "survey",
                serde_json::Value::Null,
                Priority::Normal,
                20,
                &policy,
            )
            .await;

        assert!(matches!(
            result,
            Err(DirigentError::AcknowledgementTimeout { .. })
        ));
        // First attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        };
        assert_eq!(compute_backoff(&policy, 0), 100);
        assert_eq!(compute_backoff(&policy, 1), 200);
        assert_eq!(compute_backoff(&policy, 2), 400);
        assert_eq!(compute_backoff(&policy, 5), 1_000);
    }
}
