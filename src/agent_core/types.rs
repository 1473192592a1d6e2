//! Shared types for the agent core.
//!
//! Verdicts, extracted arguments, per-request context and the outcome
//! record returned to the surrounding application.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::inference::types::ChatMessage;
use crate::tools::types::ToolResponse;

// ─── Domains ────────────────────────────────────────────────────────────────

/// Closed set of tool domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Weather,
    Stock,
    Search,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Weather, Domain::Stock, Domain::Search];

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Weather => "weather",
            Domain::Stock => "stock",
            Domain::Search => "search",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "weather" => Ok(Domain::Weather),
            "stock" => Ok(Domain::Stock),
            "search" => Ok(Domain::Search),
            other => Err(format!("unknown domain '{other}'")),
        }
    }
}

// ─── Classification ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Hit in a domain keyword table.
    Keyword,
    /// Mention of a registry entity (city, listed company, six-digit code).
    Entity,
    /// Label returned by the model-assisted fallback.
    Model,
}

/// A textual cue that contributed to a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub domain: Domain,
    pub cue: String,
    pub kind: SignalKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    PatternMatch,
    ModelAssisted,
}

/// The classifier's decision for one prompt.
///
/// `domain == None` is the "none" verdict; `confidence` and `method` are
/// reported either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationVerdict {
    #[serde(with = "domain_label")]
    pub domain: Option<Domain>,
    pub confidence: f32,
    /// Ordered by position in the prompt; model signals come last.
    pub matched_signals: Vec<Signal>,
    pub method: ClassificationMethod,
    /// Domains tied on signal count, when that is why the verdict is "none".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguous_between: Vec<Domain>,
}

impl ClassificationVerdict {
    pub fn none() -> Self {
        Self {
            domain: None,
            confidence: 0.0,
            matched_signals: Vec::new(),
            method: ClassificationMethod::PatternMatch,
            ambiguous_between: Vec::new(),
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        !self.ambiguous_between.is_empty()
    }

    /// The domain, if the verdict clears `threshold`.
    pub fn tool_domain(&self, threshold: f32) -> Option<Domain> {
        self.domain.filter(|_| self.confidence >= threshold)
    }
}

/// `Option<Domain>` as a plain label, `"none"` for `None`.
mod domain_label {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Domain;

    pub fn serialize<S>(value: &Option<Domain>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value.map(Domain::as_str).unwrap_or("none"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Domain>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let label = String::deserialize(deserializer)?;
        if label.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        label.parse().map(Some).map_err(serde::de::Error::custom)
    }
}

// ─── Extraction ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// Rigid identifier pattern (six-digit listed-company code).
    ExactCode,
    /// Known entity name or alias.
    Registry,
    /// Single constrained model call.
    ModelAssisted,
    /// The prompt itself, minus trigger keywords.
    Verbatim,
    /// Per-domain configured default, applied by the orchestrator.
    ConfiguredDefault,
}

/// One argument pulled out of free text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedArgument {
    pub slot: String,
    /// Text as it appeared in the prompt (or the model's answer).
    pub raw_text_span: String,
    /// Canonical registry name; `None` when the registry does not know it.
    pub normalized_name: Option<String>,
    /// Value sent to the tool; `None` means the slot is unresolved.
    pub value: Option<String>,
    pub alias_resolved: bool,
    pub confidence: f32,
    pub strategy: ExtractionStrategy,
}

impl ExtractedArgument {
    pub fn is_resolved(&self) -> bool {
        self.value.is_some()
    }
}

/// Outcome for one slot. `argument` may carry an unresolved candidate (the
/// model named something the registry does not know).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extraction {
    pub slot: String,
    pub argument: Option<ExtractedArgument>,
    /// Strategies that ran, in order.
    pub attempted: Vec<ExtractionStrategy>,
}

impl Extraction {
    pub fn is_resolved(&self) -> bool {
        self.argument.as_ref().is_some_and(ExtractedArgument::is_resolved)
    }

    pub fn resolved(&self) -> Option<&ExtractedArgument> {
        self.argument.as_ref().filter(|a| a.is_resolved())
    }
}

// ─── Request context ────────────────────────────────────────────────────────

/// Read-only view of the caller's conversation for one request.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub prior_turns: Vec<ChatMessage>,
    /// Model identifier used for generation.
    pub model: String,
    /// Optional text supplied by a retrieval collaborator.
    pub retrieved_context: Option<String>,
}

impl ConversationContext {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }
}

// ─── Outcome ────────────────────────────────────────────────────────────────

/// States of the per-request pipeline, in the order they can be visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Classifying,
    NoTool,
    ExtractingArgs,
    ToolCalling,
    AbortToToolless,
    Clarifying,
    Merging,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Done,
    /// The language model itself was unavailable.
    Failed,
    /// The caller went away before the answer finished.
    Cancelled,
}

/// Everything a caller may want to log about one request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub status: TerminalStatus,
    pub verdict: ClassificationVerdict,
    pub arguments: Vec<ExtractedArgument>,
    pub tool_response: Option<ToolResponse>,
    /// Visited states, in order.
    pub trace: Vec<Phase>,
    /// Caller-visible notice that was streamed, if any.
    pub notice: Option<String>,
    /// Reason the generation stream ended abnormally.
    pub interrupted: Option<String>,
}

// ─── Tests ──────────────────────────────────────────────────────────────────
