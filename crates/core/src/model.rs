//! Model trait — the abstraction over streaming LLM backends.
//!
//! A `Model` opens one streaming generation against a provider and hands
//! back a `ResponseStream`. The orchestrator consumes events from it
//! without knowing which wire protocol is underneath.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::event::Event;
use crate::message::Msg;
use crate::tool::ToolSpec;

/// Which wire protocol family a model speaks. The orchestrator's
/// final-round policy diverges on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// A `responses`-style API: flattened input items, lifecycle events,
    /// reasoning summaries. Mid-history system messages are allowed.
    Responses,

    /// A `messages`-style API: role-coalesced content blocks, a single
    /// top-level system prompt, incremental block deltas.
    Messages,
}

/// Per-request stream configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCfg {
    /// Forbid tool use for this request. Only honored by providers that
    /// support a "none" tool choice.
    pub disable_tools: bool,

    /// Ask for verbose reasoning summaries. Only honored by the
    /// `Responses` kind.
    pub detailed_reasoning: bool,
}

/// A streaming LLM backend.
#[async_trait]
pub trait Model: Send + Sync {
    /// Open one streaming generation. Transport failures (connection
    /// errors, non-2xx responses) are returned here synchronously and
    /// never travel through the event channel.
    async fn open_stream(
        &self,
        http: &reqwest::Client,
        msgs: &[Msg],
        tools: &[ToolSpec],
        cfg: StreamCfg,
    ) -> Result<Box<dyn ResponseStream>, ProviderError>;

    fn provider(&self) -> ProviderKind;
}

/// An open response stream.
///
/// `consume` drives the HTTP body to EOF (or early cancel), writing events
/// to `out` in arrival order. Implementations must close the HTTP body and
/// drop the sender on every exit path, and must stop promptly once
/// `cancel` fires or the receiver is gone.
#[async_trait]
pub trait ResponseStream: Send {
    async fn consume(self: Box<Self>, cancel: CancellationToken, out: mpsc::Sender<Event>);
}
