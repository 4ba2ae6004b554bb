//! Store trait — session history and usage persistence.
//!
//! A session is an opaque string key under which an ordered message
//! history and an accumulated `Usage` are retained. Sessions are created
//! implicitly on first `extend`; histories grow monotonically and there is
//! no deletion.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::message::Msg;
use crate::response::Usage;

#[async_trait]
pub trait Store: Send + Sync {
    /// The ordered message history for `session`. Unknown sessions yield
    /// an empty list.
    async fn messages(&self, session: &str) -> Vec<Msg>;

    /// The accumulated usage for `session`. Unknown sessions yield a
    /// zeroed record.
    async fn usage(&self, session: &str) -> Usage;

    /// Append `msgs` and accumulate `usage` under `session`.
    async fn extend(&self, session: &str, msgs: &[Msg], usage: Usage) -> Result<(), StoreError>;
}
