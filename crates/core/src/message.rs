//! Message domain types.
//!
//! A `Msg` is one entry of a conversation history: a user or assistant
//! content message, an opaque reasoning block, a model-requested tool call,
//! or the corresponding tool result. Messages are single-owner while the
//! orchestrator is building a round; the store hands out fresh clones.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::model::ProviderKind;

/// The role of a content message. Only these three roles exist; anything
/// else is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The semantic body of a message. This is also the persisted JSON layout:
/// a `type` discriminator plus the fields of exactly one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MsgBody {
    /// An intermediate thought segment. `encrypted` is the provider-signed
    /// opaque blob; `text` is the plaintext summary and may be empty when
    /// only the blob is available.
    Reasoning { encrypted: String, text: String },

    Content { role: Role, text: String },

    /// A model-originated request to invoke a tool. `arguments` is the raw
    /// JSON body exactly as the model emitted it.
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },

    /// The response to a `ToolCall` with the same id. The result text is
    /// opaque at this level.
    ToolResult { id: String, result: String },
}

/// A conversation message: a semantic body plus a per-provider memoised
/// wire form.
///
/// The wire slots are write-once (the adapter that first serialises the
/// message fills its slot) and are dropped on any mutable access to the
/// body, so a stale encoding can never outlive a semantic change. They are
/// never serialised or compared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    #[serde(flatten)]
    body: MsgBody,

    #[serde(skip)]
    wire: WireCache,
}

#[derive(Debug, Clone, Default)]
struct WireCache {
    slots: [OnceLock<serde_json::Value>; 2],
}

impl Msg {
    pub fn reasoning(encrypted: impl Into<String>, text: impl Into<String>) -> Self {
        MsgBody::Reasoning {
            encrypted: encrypted.into(),
            text: text.into(),
        }
        .into()
    }

    pub fn content(role: Role, text: impl Into<String>) -> Self {
        MsgBody::Content {
            role,
            text: text.into(),
        }
        .into()
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        MsgBody::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
        .into()
    }

    pub fn tool_result(id: impl Into<String>, result: impl Into<String>) -> Self {
        MsgBody::ToolResult {
            id: id.into(),
            result: result.into(),
        }
        .into()
    }

    pub fn body(&self) -> &MsgBody {
        &self.body
    }

    /// Mutable access to the body. Invalidates every cached wire form.
    pub fn body_mut(&mut self) -> &mut MsgBody {
        self.wire = WireCache::default();
        &mut self.body
    }

    pub fn is_reasoning(&self) -> bool {
        matches!(self.body, MsgBody::Reasoning { .. })
    }

    /// The content text, if this is a content message.
    pub fn content_text(&self) -> Option<(Role, &str)> {
        match &self.body {
            MsgBody::Content { role, text } => Some((*role, text)),
            _ => None,
        }
    }

    /// The memoised wire form for `kind`, if one was already computed.
    pub fn wire_cached(&self, kind: ProviderKind) -> Option<&serde_json::Value> {
        self.wire.slots[slot(kind)].get()
    }

    /// The memoised wire form for `kind`, computing it on first use.
    pub fn wire_or_encode(
        &self,
        kind: ProviderKind,
        encode: impl FnOnce(&MsgBody) -> serde_json::Value,
    ) -> &serde_json::Value {
        self.wire.slots[slot(kind)].get_or_init(|| encode(&self.body))
    }
}

fn slot(kind: ProviderKind) -> usize {
    match kind {
        ProviderKind::Responses => 0,
        ProviderKind::Messages => 1,
    }
}

impl From<MsgBody> for Msg {
    fn from(body: MsgBody) -> Self {
        Self {
            body,
            wire: WireCache::default(),
        }
    }
}

impl PartialEq for Msg {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialization_roundtrip_all_kinds() {
        let msgs = vec![
            Msg::reasoning("blob==", "thinking about it"),
            Msg::content(Role::User, "Hello!"),
            Msg::tool_call("call_1", "getWeather", r#"{"location":"Tokyo"}"#),
            Msg::tool_result("call_1", "25C and sunny"),
        ];

        for msg in msgs {
            let payload = serde_json::to_string(&msg).unwrap();
            let back: Msg = serde_json::from_str(&payload).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn payload_carries_type_discriminator() {
        let payload = serde_json::to_value(Msg::content(Role::Assistant, "hi")).unwrap();
        assert_eq!(payload["type"], "content");
        assert_eq!(payload["role"], "assistant");
        assert_eq!(payload["text"], "hi");

        let payload = serde_json::to_value(Msg::tool_result("1", "ok")).unwrap();
        assert_eq!(payload["type"], "tool_result");
    }

    #[test]
    fn wire_cache_memoises_first_encoding() {
        let msg = Msg::content(Role::User, "hi");
        let mut calls = 0;
        let v = msg
            .wire_or_encode(ProviderKind::Responses, |_| {
                calls += 1;
                json!({"role": "user"})
            })
            .clone();
        let again = msg.wire_or_encode(ProviderKind::Responses, |_| {
            calls += 1;
            json!({"role": "other"})
        });
        assert_eq!(calls, 1);
        assert_eq!(*again, v);
    }

    #[test]
    fn wire_cache_is_per_provider() {
        let msg = Msg::content(Role::User, "hi");
        msg.wire_or_encode(ProviderKind::Responses, |_| json!("a"));
        assert!(msg.wire_cached(ProviderKind::Messages).is_none());
    }

    #[test]
    fn mutation_invalidates_wire_cache() {
        let mut msg = Msg::content(Role::User, "hi");
        msg.wire_or_encode(ProviderKind::Responses, |_| json!("stale"));
        assert!(msg.wire_cached(ProviderKind::Responses).is_some());

        if let MsgBody::Content { text, .. } = msg.body_mut() {
            text.push_str(" there");
        }
        assert!(msg.wire_cached(ProviderKind::Responses).is_none());
        assert!(msg.wire_cached(ProviderKind::Messages).is_none());
    }

    #[test]
    fn equality_ignores_wire_cache() {
        let a = Msg::content(Role::User, "same");
        let b = Msg::content(Role::User, "same");
        a.wire_or_encode(ProviderKind::Responses, |_| json!("cached"));
        assert_eq!(a, b);
    }
}
