//! Streaming events emitted by a model adapter while consuming a response.
//!
//! Deltas are cumulative by append; the caller may render them directly.
//! Tool calls are only surfaced once fully assembled (id, name, complete
//! argument JSON) — argument fragments are never exposed.

use crate::error::ProviderError;
use crate::response::Response;

/// A fully assembled model-originated tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One event on a response stream.
///
/// On success, `Final` is the last event before the channel closes, and it
/// appears at most once. On failure, `Error` is the last event.
#[derive(Debug, Clone)]
pub enum Event {
    /// A whole reasoning segment (not character-by-character).
    ReasonDelta(String),

    /// A small provider text fragment.
    ContentDelta(String),

    ToolCall(ToolCall),

    Final(Response),

    Error(ProviderError),
}
