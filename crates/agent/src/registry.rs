//! Tool registration and invocation.
//!
//! A `Tool` pairs the spec sent to the model with a type-erased handler.
//! Handlers are built through the generic `Tool::new`, which decodes the
//! raw argument bytes into a typed struct before calling the typed
//! function. Decoding is strict: trailing garbage is always rejected, and
//! argument structs are expected to carry `#[serde(deny_unknown_fields)]`
//! so unexpected fields fail too.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use tandem_core::error::ToolError;
use tandem_core::tool::ToolSpec;

/// A type-erased tool handler: raw argument bytes in, result text out.
pub type ToolHandler = Arc<
    dyn Fn(
            CancellationToken,
            Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// A tool the agent can offer to the model.
pub struct Tool {
    pub spec: ToolSpec,
    pub handler: ToolHandler,
}

impl Tool {
    /// Wrap a typed async function as a tool.
    pub fn new<T, F, Fut>(spec: ToolSpec, f: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: ToolHandler = Arc::new(move |cancel, raw| {
            let f = f.clone();
            Box::pin(async move {
                let args: T = serde_json::from_slice(&raw)
                    .map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
                f(cancel, args).await
            })
        });

        Self { spec, handler }
    }
}

/// A name → handler map, built once per agent.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, ToolHandler>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`. Registering the same name twice is
    /// a bug in the agent's construction, not a runtime condition.
    pub fn register(&mut self, name: impl Into<String>, handler: ToolHandler) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            panic!("tool {name} already registered");
        }
    }

    pub fn handler(&self, name: &str) -> Option<ToolHandler> {
        self.handlers.get(name).cloned()
    }

    /// Invoke `name` with the raw argument bytes.
    pub async fn call(
        &self,
        cancel: CancellationToken,
        name: &str,
        args: &[u8],
    ) -> Result<String, ToolError> {
        let Some(handler) = self.handler(name) else {
            return Err(ToolError::Unknown(name.to_string()));
        };
        handler(cancel, args.to_vec()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct EchoArgs {
        text: String,
    }

    fn echo_tool() -> Tool {
        Tool::new(
            ToolSpec::new("echo", "Echoes back the input"),
            |_cancel, args: EchoArgs| async move { Ok(args.text) },
        )
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_runs() {
        let mut registry = ToolRegistry::new();
        let tool = echo_tool();
        registry.register(tool.spec.name.clone(), tool.handler);

        let result = registry
            .call(
                CancellationToken::new(),
                "echo",
                br#"{"text":"hello world"}"#,
            )
            .await
            .unwrap();
        assert_eq!(result, "hello world");
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let registry = ToolRegistry::new();
        let err = registry
            .call(CancellationToken::new(), "nonexistent", b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Unknown(_)));
    }

    #[tokio::test]
    async fn unknown_fields_are_rejected() {
        let mut registry = ToolRegistry::new();
        let tool = echo_tool();
        registry.register(tool.spec.name.clone(), tool.handler);

        let err = registry
            .call(
                CancellationToken::new(),
                "echo",
                br#"{"text":"hi","extra":1}"#,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn trailing_garbage_is_rejected() {
        let mut registry = ToolRegistry::new();
        let tool = echo_tool();
        registry.register(tool.spec.name.clone(), tool.handler);

        let err = registry
            .call(
                CancellationToken::new(),
                "echo",
                br#"{"text":"hi"} {"text":"again"}"#,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_is_a_bug() {
        let mut registry = ToolRegistry::new();
        let a = echo_tool();
        let b = echo_tool();
        registry.register(a.spec.name.clone(), a.handler);
        registry.register(b.spec.name.clone(), b.handler);
    }
}
