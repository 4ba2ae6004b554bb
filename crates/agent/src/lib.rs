//! The agentic round loop — the heart of Tandem.
//!
//! The agent drives a **stream → act → observe** cycle:
//!
//! 1. Load the session history (plus system prompt on the first turn)
//! 2. Open a streaming generation against the model
//! 3. Relay reasoning and content deltas to the caller as they arrive
//! 4. Spawn one worker per model-requested tool call, concurrently
//! 5. Feed tool results back and loop, up to a fixed round cap
//! 6. Persist the new slice of the conversation and the accumulated usage
//!
//! The loop ends when the model produces a terminal message with no tool
//! calls, or when the round cap forces a user-visible reply.

pub mod registry;
pub mod runner;

pub use registry::{Tool, ToolHandler, ToolRegistry};
pub use runner::{Agent, MAX_ROUNDS};
