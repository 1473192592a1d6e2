//! Tool request/response value types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Arguments passed to a tool, keyed by slot name.
pub type ToolArguments = serde_json::Map<String, serde_json::Value>;

// ─── ToolRequest ────────────────────────────────────────────────────────────

/// One tool invocation. Fields are private; a request is never mutated after
/// construction, and every retry attempt reuses the same request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRequest {
    tool_name: String,
    arguments: ToolArguments,
    correlation_id: Uuid,
}

impl ToolRequest {
    pub fn new(tool_name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn arguments(&self) -> &ToolArguments {
        &self.arguments
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Wire body: `{tool_name, arguments}`.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "tool_name": self.tool_name,
            "arguments": self.arguments,
        })
    }
}

// ─── ToolResponse ───────────────────────────────────────────────────────────

/// Why a tool call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Unavailable,
    NonRetryable,
    /// The tool answered 2xx but reported `success: false`.
    ToolReported,
    InvalidResponse,
    /// The orchestrator's wall-clock budget ran out first.
    BudgetExceeded,
}

/// Either the tool's result or a description of the failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ToolPayload {
    Result(serde_json::Value),
    Error { kind: FailureKind, message: String },
}

/// Outcome of the final attempt of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResponse {
    pub success: bool,
    pub payload: ToolPayload,
    #[serde(with = "crate::transport::retry::duration_ms", rename = "latency_ms")]
    pub latency: Duration,
    /// Tool name that produced the response.
    pub source: String,
    /// Attempt number (1-based) that produced this response.
    pub attempt: u32,
    pub correlation_id: Uuid,
    pub completed_at: DateTime<Utc>,
}

impl ToolResponse {
    pub fn ok(request: &ToolRequest, result: serde_json::Value, latency: Duration, attempt: u32) -> Self {
        Self {
            success: true,
            payload: ToolPayload::Result(result),
            latency,
            source: request.tool_name().to_string(),
            attempt,
            correlation_id: request.correlation_id(),
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        request: &ToolRequest,
        kind: FailureKind,
        message: impl Into<String>,
        latency: Duration,
        attempt: u32,
    ) -> Self {
        Self {
            success: false,
            payload: ToolPayload::Error {
                kind,
                message: message.into(),
            },
            latency,
            source: request.tool_name().to_string(),
            attempt,
            correlation_id: request.correlation_id(),
            completed_at: Utc::now(),
        }
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match &self.payload {
            ToolPayload::Result(v) => Some(v),
            ToolPayload::Error { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<(FailureKind, &str)> {
        match &self.payload {
            ToolPayload::Error { kind, message } => Some((*kind, message.as_str())),
            ToolPayload::Result(_) => None,
        }
    }
}

/// A tool advertised by `GET /tools`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> ToolArguments {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn test_wire_body_shape() {
        let req = ToolRequest::new("get_weather", args(&[("city", "Seoul")]));
        assert_eq!(
            req.to_wire(),
            serde_json::json!({"tool_name": "get_weather", "arguments": {"city": "Seoul"}})
        );
    }

    #[test]
    fn test_each_request_gets_fresh_correlation_id() {
        let a = ToolRequest::new("t", ToolArguments::new());
        let b = ToolRequest::new("t", ToolArguments::new());
        assert_ne!(a.correlation_id(), b.correlation_id());
    }

    #[test]
    fn test_response_carries_request_identity() {
        let req = ToolRequest::new("get_stock_info", args(&[("stock_code", "005930")]));
        let resp = ToolResponse::failed(
            &req,
            FailureKind::Timeout,
            "timed out",
            Duration::from_millis(30),
            3,
        );
        assert!(!resp.success);
        assert_eq!(resp.source, "get_stock_info");
        assert_eq!(resp.correlation_id, req.correlation_id());
        assert_eq!(resp.failure(), Some((FailureKind::Timeout, "timed out")));
        assert!(resp.result().is_none());
    }

    #[test]
    fn test_response_serializes_latency_ms() {
        let req = ToolRequest::new("t", ToolArguments::new());
        let resp = ToolResponse::ok(&req, serde_json::json!({"x": 1}), Duration::from_millis(42), 1);
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["latency_ms"], 42);
        assert_eq!(v["payload"]["kind"], "result");
    }
}
