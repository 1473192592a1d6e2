//! Transport error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. The retry loop in
//! [`super::http`] only needs [`TransportError::is_retriable`]; everything else
//! here is context for log entries and caller-visible failure values.

use thiserror::Error;

/// Errors that can occur while talking to the tool or model server.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The per-attempt timeout elapsed before a response arrived.
    #[error("request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// Connection refused, DNS failure, reset before a response.
    #[error("endpoint {endpoint} unavailable: {reason}")]
    Unavailable { endpoint: String, reason: String },

    /// The server rejected the request itself (malformed, unknown tool).
    #[error("non-retryable HTTP {status} from {endpoint}: {body}")]
    NonRetryable {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// Server-side failure that may succeed on a later attempt.
    #[error("HTTP {status} from {endpoint}: {body}")]
    Server {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// A 2xx response whose body could not be read or decoded.
    #[error("invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    /// The HTTP client itself could not be constructed.
    #[error("failed to build HTTP client: {reason}")]
    ClientBuild { reason: String },
}

impl TransportError {
    /// Whether another attempt may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. }
                | TransportError::Unavailable { .. }
                | TransportError::Server { .. }
        )
    }

    /// Build the error for a non-2xx status.
    ///
    /// 408 and 429 are transient even though they are 4xx codes.
    pub fn from_status(endpoint: &str, status: u16, body: String) -> Self {
        if is_retriable_status(status) {
            TransportError::Server {
                endpoint: endpoint.to_string(),
                status,
                body,
            }
        } else {
            TransportError::NonRetryable {
                endpoint: endpoint.to_string(),
                status,
                body,
            }
        }
    }

    /// Classify a `reqwest` error raised before a status was received.
    pub fn from_reqwest(endpoint: &str, err: &reqwest::Error, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            TransportError::Timeout {
                endpoint: endpoint.to_string(),
                timeout_ms,
            }
        } else if err.is_decode() || err.is_body() {
            TransportError::InvalidResponse {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        } else {
            TransportError::Unavailable {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        }
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::NonRetryable { status, .. } | TransportError::Server { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// 408 Request Timeout, 429 Too Many Requests and every 5xx.
pub fn is_retriable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_variants() {
        assert!(TransportError::Timeout {
            endpoint: "x".into(),
            timeout_ms: 10
        }
        .is_retriable());
        assert!(TransportError::Unavailable {
            endpoint: "x".into(),
            reason: "refused".into()
        }
        .is_retriable());
        assert!(!TransportError::InvalidResponse {
            endpoint: "x".into(),
            reason: "bad json".into()
        }
        .is_retriable());
    }

    #[test]
    fn test_from_status_classification() {
        assert!(TransportError::from_status("x", 503, String::new()).is_retriable());
        assert!(TransportError::from_status("x", 500, String::new()).is_retriable());
        assert!(TransportError::from_status("x", 429, String::new()).is_retriable());
        assert!(TransportError::from_status("x", 408, String::new()).is_retriable());
        assert!(!TransportError::from_status("x", 400, String::new()).is_retriable());
        assert!(!TransportError::from_status("x", 404, String::new()).is_retriable());
        assert!(!TransportError::from_status("x", 422, String::new()).is_retriable());
    }

    #[test]
    fn test_status_accessor() {
        let err = TransportError::from_status("x", 404, "missing".into());
        assert_eq!(err.status(), Some(404));
        let err = TransportError::Timeout {
            endpoint: "x".into(),
            timeout_ms: 1,
        };
        assert_eq!(err.status(), None);
    }
}
