//! Agent Core error types.
//!
//! Tool and extraction failures are values, not errors; only the cases
//! below escape the agent core.

use thiserror::Error;

use crate::config::ConfigError;
use crate::inference::client::describe_failure;
use crate::inference::InferenceError;

/// Errors that can occur while building or running the agent core.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The language model could not start a generation.
    #[error("generation unavailable: {source}")]
    GenerationUnavailable {
        #[source]
        source: InferenceError,
    },

    /// Configuration could not be turned into components.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The shared HTTP client could not be constructed.
    #[error("transport setup failed: {reason}")]
    TransportSetup { reason: String },
}

impl AgentError {
    /// One-line form for logs; upstream response bodies are left out.
    pub fn log_detail(&self) -> String {
        match self {
            AgentError::GenerationUnavailable { source } => {
                format!("generation unavailable: {}", describe_failure(source))
            }
            other => other.to_string(),
        }
    }
}
