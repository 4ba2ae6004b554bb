//! LLM provider adapters for Tandem.
//!
//! Both adapters implement the `tandem_core::Model` trait: one speaks the
//! `responses`-style wire protocol (flattened input items, lifecycle
//! events), the other the `messages`-style protocol (role-coalesced
//! content blocks, incremental block deltas). Each owns its wire encoding,
//! SSE consumption, and usage/cost projection.

pub mod anthropic;
pub mod openai;
mod sse;

pub use anthropic::AnthropicModel;
pub use openai::OpenAiModel;
