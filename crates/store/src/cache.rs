//! The shared in-memory session state: two maps, append and accumulate.
//!
//! Used directly (behind a lock) by `EphemeralStore`, and as the
//! write-through cache embedded in `SqliteStore`.

use std::collections::HashMap;

use tandem_core::message::Msg;
use tandem_core::response::Usage;

#[derive(Debug, Default)]
pub(crate) struct SessionCache {
    msgs: HashMap<String, Vec<Msg>>,
    usage: HashMap<String, Usage>,
}

impl SessionCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn messages(&self, session: &str) -> Vec<Msg> {
        self.msgs.get(session).cloned().unwrap_or_default()
    }

    pub(crate) fn usage(&self, session: &str) -> Usage {
        self.usage.get(session).copied().unwrap_or_default()
    }

    pub(crate) fn extend(&mut self, session: &str, msgs: &[Msg], usage: Usage) {
        self.msgs
            .entry(session.to_string())
            .or_default()
            .extend_from_slice(msgs);
        self.usage
            .entry(session.to_string())
            .or_default()
            .accumulate(usage);
    }
}
