//! Shared HTTP plumbing for the exchange clients
//!
//! Request timeout, retry budget and exponential backoff
//! (`base_delay * 2^(attempt-1)`) for rate-limit and transport failures.

use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};

/// Configuration for exchange HTTP clients
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Maximum number of retry attempts after the first try
    pub max_retries: u32,
    /// Request timeout duration
    pub timeout: Duration,
    /// Delay before the first retry; doubles on each further retry
    pub base_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(10),
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn build_client(&self) -> GatewayResult<Client> {
        Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| GatewayError::Network(format!("Failed to create HTTP client: {}", e)))
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Run `operation`, retrying retryable failures with exponential backoff.
///
/// Non-retryable errors (API rejections, parse failures) return immediately.
pub async fn execute_with_retry<F, Fut, T>(
    config: &ClientConfig,
    label: &str,
    operation: F,
) -> GatewayResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    execute_with_retry_if(config, label, GatewayError::is_retryable, operation).await
}

/// Like [`execute_with_retry`] with a caller supplied retry predicate.
///
/// Order placement only retries rate limits: a transport failure may hide
/// an order that did reach the exchange.
pub async fn execute_with_retry_if<F, Fut, T>(
    config: &ClientConfig,
    label: &str,
    should_retry: fn(&GatewayError) -> bool,
    operation: F,
) -> GatewayResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            let delay = config.backoff(attempt);
            debug!("{}: retrying after {}ms", label, delay.as_millis());
            sleep(delay).await;
        }

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if should_retry(&e) && attempt < config.max_retries => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    label,
                    attempt + 1,
                    config.max_retries + 1,
                    e
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> ClientConfig {
        ClientConfig::default()
            .with_max_retries(3)
            .with_base_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_doubles() {
        let config = ClientConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_retries_rate_limit_then_succeeds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = execute_with_retry(&fast_config(), "test", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GatewayError::RateLimited)
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: GatewayResult<()> = execute_with_retry(&fast_config(), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Network("down".into()))
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_api_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: GatewayResult<()> = execute_with_retry(&fast_config(), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Api {
                code: 80014,
                message: "invalid".into(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate_skips_network_retry() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let only_rate_limits: fn(&GatewayError) -> bool =
            |e| matches!(e, GatewayError::RateLimited);
        let result: GatewayResult<()> =
            execute_with_retry_if(&fast_config(), "order", only_rate_limits, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Network("reset".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
