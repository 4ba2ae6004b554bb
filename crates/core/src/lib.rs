//! # Tandem Core
//!
//! Domain types, traits, and error definitions for the Tandem agent
//! framework. This crate defines the common model that the provider
//! adapters, the session stores, and the orchestrator all implement
//! against.
//!
//! ## Design Philosophy
//!
//! Every subsystem boundary is a trait here. Implementations live in their
//! respective crates, which enables:
//! - Swapping providers without touching the orchestrator
//! - Testing the round loop with scripted mock models
//! - A clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod event;
pub mod message;
pub mod model;
pub mod response;
pub mod store;
pub mod tool;

pub use error::{ConfigError, Error, ProviderError, Result, StoreError, ToolError};
pub use event::{Event, ToolCall};
pub use message::{Msg, MsgBody, Role};
pub use model::{Model, ProviderKind, ResponseStream, StreamCfg};
pub use response::{Response, Usage};
pub use store::Store;
pub use tool::{JsType, ToolParam, ToolSpec};
