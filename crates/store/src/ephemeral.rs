//! In-memory session store — useful for tests and throwaway sessions.

use async_trait::async_trait;
use tokio::sync::RwLock;

use tandem_core::error::StoreError;
use tandem_core::message::Msg;
use tandem_core::response::Usage;
use tandem_core::store::Store;

use crate::cache::SessionCache;

/// A session store that keeps everything in memory. Nothing survives the
/// process.
#[derive(Debug, Default)]
pub struct EphemeralStore {
    inner: RwLock<SessionCache>,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for EphemeralStore {
    async fn messages(&self, session: &str) -> Vec<Msg> {
        self.inner.read().await.messages(session)
    }

    async fn usage(&self, session: &str) -> Usage {
        self.inner.read().await.usage(session)
    }

    async fn extend(&self, session: &str, msgs: &[Msg], usage: Usage) -> Result<(), StoreError> {
        self.inner.write().await.extend(session, msgs, usage);
        Ok(())
    }
}
