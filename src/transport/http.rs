//! Shared HTTP transport with per-attempt timeouts and exponential backoff.
//!
//! One `reqwest::Client` (and therefore one connection pool) backs every
//! outbound call. `HttpTransport` is cheap to clone; clones share the pool.

use std::future::Future;
use std::time::{Duration, Instant};

use reqwest::{Client as HttpClient, Method};

use super::errors::TransportError;
use super::retry::RetryPolicy;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout, independent of the per-attempt budget.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle pooled connections kept per host.
const POOL_MAX_IDLE_PER_HOST: usize = 32;

// ─── Retry outcome ───────────────────────────────────────────────────────────

/// Result of a retried operation plus how much it cost.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, TransportError>,
    /// Attempts actually made (1-based count).
    pub attempts: u32,
    /// Wall-clock time across all attempts and backoff sleeps.
    pub elapsed: Duration,
}

/// Run `op` under `policy`.
///
/// `op` receives the 1-based attempt number. Retries stop on the first
/// success, on a non-retriable error, or when attempts are exhausted.
pub async fn with_retry<T, F, Fut>(endpoint: &str, policy: &RetryPolicy, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let start = Instant::now();
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) if e.is_retriable() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    endpoint = %endpoint,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transport attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retriable() {
                    tracing::warn!(
                        endpoint = %endpoint,
                        attempts = attempt,
                        error = %e,
                        "transport attempts exhausted"
                    );
                } else {
                    tracing::warn!(
                        endpoint = %endpoint,
                        attempt,
                        error = %e,
                        "non-retryable transport failure"
                    );
                }
                return RetryOutcome {
                    result: Err(e),
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }
        }
    }
}

// ─── HttpTransport ───────────────────────────────────────────────────────────

/// JSON-over-HTTP client shared by the tool and model clients.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    /// Build the shared client. No total request timeout is set on the
    /// client; every call applies its own per-attempt timeout instead.
    pub fn new() -> Result<Self, TransportError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|e| TransportError::ClientBuild {
                reason: e.to_string(),
            })?;
        Ok(Self { http })
    }

    /// Wrap an existing client (shares its pool).
    pub fn with_client(http: HttpClient) -> Self {
        Self { http }
    }

    /// Single attempt: send, check status, decode a JSON body.
    ///
    /// An empty 2xx body decodes as `Value::Null`.
    pub async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        let timeout_ms = timeout.as_millis() as u64;
        let attempt = async {
            let mut request = self.http.request(method.clone(), url);
            if let Some(payload) = body {
                request = request.json(payload);
            }

            let response = request
                .send()
                .await
                .map_err(|e| TransportError::from_reqwest(url, &e, timeout_ms))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| TransportError::from_reqwest(url, &e, timeout_ms))?;

            if !status.is_success() {
                return Err(TransportError::from_status(url, status.as_u16(), text));
            }

            if text.trim().is_empty() {
                return Ok(serde_json::Value::Null);
            }

            serde_json::from_str(&text).map_err(|e| TransportError::InvalidResponse {
                endpoint: url.to_string(),
                reason: format!("body is not JSON: {e}"),
            })
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                endpoint: url.to_string(),
                timeout_ms,
            }),
        }
    }

    /// `send_once` under a retry policy.
    pub async fn send_with_retry(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        policy: &RetryPolicy,
    ) -> RetryOutcome<serde_json::Value> {
        with_retry(url, policy, |attempt| {
            tracing::debug!(url = %url, method = %method, attempt, "sending request");
            self.send_once(method.clone(), url, body, policy.per_attempt_timeout)
        })
        .await
    }

    /// Open a streaming POST and return the response once headers arrive.
    ///
    /// Only the connect-and-headers phase is retried and timed; the body is
    /// consumed by the caller.
    pub async fn open_stream(
        &self,
        url: &str,
        body: &serde_json::Value,
        policy: &RetryPolicy,
    ) -> RetryOutcome<reqwest::Response> {
        let timeout = policy.per_attempt_timeout;
        let timeout_ms = timeout.as_millis() as u64;

        with_retry(url, policy, |attempt| async move {
            tracing::debug!(url = %url, attempt, "opening stream");
            let send = self
                .http
                .post(url)
                .header("Accept", "text/event-stream")
                .json(body)
                .send();

            let response = match tokio::time::timeout(timeout, send).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(TransportError::from_reqwest(url, &e, timeout_ms)),
                Err(_) => {
                    return Err(TransportError::Timeout {
                        endpoint: url.to_string(),
                        timeout_ms,
                    })
                }
            };

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(TransportError::from_status(url, status.as_u16(), text));
            }
            Ok(response)
        })
        .await
    }

    /// Best-effort GET with no retries; any failure reads as `false`.
    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.http.get(url).send()).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            Ok(Err(e)) => {
                tracing::debug!(url = %url, error = %e, "health probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(url = %url, "health probe timed out");
                false
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
