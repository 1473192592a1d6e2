//! Tool server client: one POST per tool, results and failures as values.

pub mod client;
pub mod types;

pub use client::{ToolClient, ToolInvoker};
pub use types::{FailureKind, ToolArguments, ToolDescriptor, ToolPayload, ToolRequest, ToolResponse};
