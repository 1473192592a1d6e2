//! Retry-and-timeout-aware JSON transport shared by the tool and model clients.

pub mod errors;
pub mod http;
pub mod retry;

pub use errors::TransportError;
pub use http::{with_retry, HttpTransport, RetryOutcome};
pub use retry::RetryPolicy;
