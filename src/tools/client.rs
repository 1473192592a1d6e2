//! HTTP client for the tool server.
//!
//! `ToolClient::call` never returns `Err`: every transport or tool-reported
//! failure becomes a `ToolResponse` with `success == false`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use crate::transport::{HttpTransport, RetryPolicy, TransportError};

use super::types::{FailureKind, ToolDescriptor, ToolRequest, ToolResponse};

/// Timeout for the diagnostic health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Anything that can execute a tool request. The orchestrator holds one of
/// these; tests substitute an in-memory fake.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call(&self, request: &ToolRequest, policy: &RetryPolicy) -> ToolResponse;

    async fn health(&self) -> bool;
}

/// Tool server client over the shared transport.
#[derive(Debug, Clone)]
pub struct ToolClient {
    transport: HttpTransport,
    base_url: String,
    default_policy: RetryPolicy,
}

impl ToolClient {
    pub fn new(transport: HttpTransport, base_url: impl Into<String>, default_policy: RetryPolicy) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            transport,
            base_url,
            default_policy,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    fn tool_url(&self, tool_name: &str) -> String {
        format!("{}/tools/{}", self.base_url, tool_name)
    }

    /// `GET /tools`. Accepts `{"tools": [...]}` or a bare array.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let url = format!("{}/tools", self.base_url);
        let body = self
            .transport
            .send_with_retry(Method::GET, &url, None, &self.default_policy)
            .await
            .result?;

        let list = match body {
            serde_json::Value::Object(mut map) => map.remove("tools").unwrap_or_default(),
            other => other,
        };

        serde_json::from_value(list).map_err(|e| TransportError::InvalidResponse {
            endpoint: url,
            reason: format!("unexpected tool list: {e}"),
        })
    }
}

#[async_trait]
impl ToolInvoker for ToolClient {
    async fn call(&self, request: &ToolRequest, policy: &RetryPolicy) -> ToolResponse {
        let url = self.tool_url(request.tool_name());
        let body = request.to_wire();

        tracing::info!(
            tool = %request.tool_name(),
            correlation_id = %request.correlation_id(),
            url = %url,
            max_attempts = policy.attempts(),
            "calling tool"
        );

        let outcome = self
            .transport
            .send_with_retry(Method::POST, &url, Some(&body), policy)
            .await;

        let response = match outcome.result {
            Ok(value) => match interpret_body(value) {
                Ok(result) => ToolResponse::ok(request, result, outcome.elapsed, outcome.attempts),
                Err(message) => ToolResponse::failed(
                    request,
                    FailureKind::ToolReported,
                    message,
                    outcome.elapsed,
                    outcome.attempts,
                ),
            },
            Err(e) => ToolResponse::failed(
                request,
                failure_kind(&e),
                e.to_string(),
                outcome.elapsed,
                outcome.attempts,
            ),
        };

        if response.success {
            tracing::info!(
                tool = %request.tool_name(),
                correlation_id = %request.correlation_id(),
                attempts = response.attempt,
                latency_ms = response.latency.as_millis() as u64,
                "tool call succeeded"
            );
        } else {
            tracing::warn!(
                tool = %request.tool_name(),
                correlation_id = %request.correlation_id(),
                attempts = response.attempt,
                latency_ms = response.latency.as_millis() as u64,
                failure = ?response.failure().map(|(kind, _)| kind),
                "tool call failed"
            );
        }

        response
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        self.transport.probe(&url, HEALTH_TIMEOUT).await
    }
}

/// Map a 2xx body to the tool's result or its reported error.
///
/// `success: false` is a failure; a `result` field is unwrapped; a body with
/// neither is taken whole as the result.
fn interpret_body(body: serde_json::Value) -> Result<serde_json::Value, String> {
    let serde_json::Value::Object(mut map) = body else {
        return Ok(body);
    };

    if map.get("success").and_then(|v| v.as_bool()) == Some(false) {
        let message = match map.remove("error") {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Object(err)) => err
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| serde_json::Value::Object(err).to_string()),
            Some(other) if !other.is_null() => other.to_string(),
            _ => "tool reported failure without details".to_string(),
        };
        return Err(message);
    }

    if let Some(result) = map.remove("result") {
        return Ok(result);
    }

    Ok(serde_json::Value::Object(map))
}

fn failure_kind(err: &TransportError) -> FailureKind {
    match err {
        TransportError::Timeout { .. } => FailureKind::Timeout,
        TransportError::NonRetryable { .. } => FailureKind::NonRetryable,
        TransportError::InvalidResponse { .. } => FailureKind::InvalidResponse,
        TransportError::Unavailable { .. }
        | TransportError::Server { .. }
        | TransportError::ClientBuild { .. } => FailureKind::Unavailable,
    }
}
