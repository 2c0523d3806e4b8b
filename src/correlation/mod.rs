//! Message and tool-call correlation.

pub mod engine;
pub mod extract;

pub use engine::{CorrelationEngine, CorrelationMiss, DEFAULT_DELEGATION_TOOL};
pub use extract::{extract_tool_calls, ExtractedToolCall, ToolCallSource};
