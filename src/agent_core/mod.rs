//! Agent Core: deciding when to call a tool and merging its answer.
//!
//! Submodules:
//! - `registry`: Phrase index and city/stock entity registries
//! - `classifier`: Keyword/entity request classifier with optional model fallback
//! - `extractor`: Tool argument extraction (exact code, registry, verbatim, model)
//! - `merge`: Prompt composition and tool result rendering
//! - `assembler`: Ordered relay of generation chunks to the caller
//! - `orchestrator`: Per-request state machine tying the above together
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod assembler;
pub mod classifier;
pub mod errors;
pub mod extractor;
pub mod merge;
pub mod orchestrator;
pub mod registry;
pub mod types;

// Re-exports for convenience
pub use assembler::{OutputSink, RelayOutcome, SinkClosed};
pub use classifier::RequestClassifier;
pub use errors::AgentError;
pub use extractor::ParameterExtractor;
pub use orchestrator::{HealthReport, ToolOrchestrator};
pub use registry::{Entity, EntityRegistry, Registries};
pub use types::{
    ClassificationMethod, ClassificationVerdict, ConversationContext, Domain, ExtractedArgument, Extraction,
    ExtractionStrategy, Phase, RequestOutcome, Signal, SignalKind, TerminalStatus,
};
