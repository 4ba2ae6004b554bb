//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API.
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as a top-level field, extracted during flattening
//! - Same-role message coalescing into content block lists
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Extended thinking (`thinking` blocks carrying plaintext + signature)
//! - Ephemeral prompt-cache marker on the last content block
//! - Streaming via SSE with incremental `content_block_*` events

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tandem_core::error::{ConfigError, ProviderError};
use tandem_core::event::{Event, ToolCall};
use tandem_core::message::{Msg, MsgBody, Role};
use tandem_core::model::{Model, ProviderKind, ResponseStream, StreamCfg};
use tandem_core::response::{Response, Usage};
use tandem_core::tool::ToolSpec;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// The smallest thinking budget the API accepts.
const MIN_THINKING_BUDGET: i64 = 1024;

/// Anthropic Messages API model adapter.
pub struct AnthropicModel {
    model: String,
    max_tokens: i64,
    thinking_budget: Option<i64>,
    cache_prompt: bool,
    api_key: String,
    base_url: String,
}

impl AnthropicModel {
    /// Create a new adapter for `model`.
    ///
    /// Reads `ANTHROPIC_API_KEY` from the environment and validates the
    /// model id against the pricing table; both failures are configuration
    /// errors, surfaced here rather than at run time.
    pub fn new(model: impl Into<String>, max_tokens: i64) -> Result<Self, ConfigError> {
        let model = model.into();
        if model_rates(&model).is_none() {
            return Err(ConfigError::UnknownModel(model));
        }
        let api_key =
            std::env::var(API_KEY_ENV).map_err(|_| ConfigError::MissingEnv(API_KEY_ENV))?;

        Ok(Self {
            model,
            max_tokens,
            thinking_budget: None,
            cache_prompt: false,
            api_key,
            base_url: DEFAULT_BASE_URL.into(),
        })
    }

    /// Enable extended thinking. Budgets below the API minimum of 1024
    /// tokens leave thinking disabled.
    pub fn with_thinking(mut self, budget_tokens: i64) -> Self {
        if budget_tokens >= MIN_THINKING_BUDGET {
            self.thinking_budget = Some(budget_tokens);
        }
        self
    }

    /// Mark the last content block of every request with an ephemeral
    /// cache-control hint.
    pub fn with_prompt_caching(mut self) -> Self {
        self.cache_prompt = true;
        self
    }

    /// Use a custom base URL (e.g., for proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Model for AnthropicModel {
    async fn open_stream(
        &self,
        http: &reqwest::Client,
        msgs: &[Msg],
        tools: &[ToolSpec],
        cfg: StreamCfg,
    ) -> Result<Box<dyn ResponseStream>, ProviderError> {
        let (system, messages) = flatten(msgs, self.cache_prompt);

        let payload = RequestBody {
            max_tokens: self.max_tokens,
            messages,
            model: &self.model,
            stream: true,
            system,
            thinking: self.thinking_budget.map(|budget_tokens| ThinkingCfg {
                kind: "enabled",
                budget_tokens,
            }),
            tool_choice: tool_choice(tools, cfg),
            tools: tools.iter().map(encode_tool).collect(),
        };

        debug!(model = %self.model, msgs = msgs.len(), "opening messages stream");

        let response = http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Accept", "text/event-stream")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body: body_snippet(response).await,
            });
        }

        Ok(Box::new(AnthropicStream {
            response,
            state: StreamState::new(self.model.clone()),
        }))
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Messages
    }
}

/// Read at most 1 KiB of an error response body.
async fn body_snippet(response: reqwest::Response) -> String {
    let bytes = response.bytes().await.unwrap_or_default();
    String::from_utf8_lossy(&bytes[..bytes.len().min(1024)]).into_owned()
}

fn tool_choice(tools: &[ToolSpec], cfg: StreamCfg) -> Option<Value> {
    if tools.is_empty() {
        return None;
    }
    if cfg.disable_tools {
        Some(json!({"type": "none"}))
    } else {
        Some(json!({"type": "auto", "disable_parallel_tool_use": false}))
    }
}

/// Flatten core messages into the wire form: the single system prompt as a
/// separate value, everything else as role-coalesced content block lists.
///
/// Consecutive messages from the same role concatenate their blocks, which
/// matters when reasoning and tool use happen in the same turn. A second
/// system message is a bug in the caller: mid-history system messages are
/// not representable on this protocol.
fn flatten(msgs: &[Msg], cache_prompt: bool) -> (Option<String>, Vec<WireMsg>) {
    let mut system: Option<String> = None;
    let mut out: Vec<WireMsg> = Vec::new();

    for msg in msgs {
        let role = match msg.body() {
            MsgBody::Content {
                role: Role::System,
                text,
            } => {
                assert!(
                    system.is_none(),
                    "multiple system messages in a messages-style request"
                );
                system = Some(text.clone());
                continue;
            }
            MsgBody::Content {
                role: Role::User, ..
            }
            | MsgBody::ToolResult { .. } => "user",
            _ => "assistant",
        };

        let block = msg
            .wire_or_encode(ProviderKind::Messages, encode_block)
            .clone();

        match out.last_mut() {
            Some(last) if last.role == role => last.content.push(block),
            _ => out.push(WireMsg {
                role,
                content: vec![block],
            }),
        }
    }

    if cache_prompt {
        if let Some(last_block) = out
            .last_mut()
            .and_then(|m| m.content.last_mut())
        {
            // Reasoning blocks cannot carry cache markers; the last block
            // of a request history is never one.
            assert!(
                last_block["type"] != "thinking",
                "last content block is a reasoning block"
            );
            last_block["cache_control"] = json!({"type": "ephemeral"});
        }
    }

    (system, out)
}

fn encode_block(body: &MsgBody) -> Value {
    match body {
        MsgBody::Reasoning { encrypted, text } => json!({
            "type": "thinking",
            "thinking": text,
            "signature": encrypted,
        }),
        MsgBody::Content { text, .. } => json!({
            "type": "text",
            "text": text,
        }),
        MsgBody::ToolCall {
            id,
            name,
            arguments,
        } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": serde_json::from_str::<Value>(arguments).unwrap_or_default(),
        }),
        MsgBody::ToolResult { id, result } => json!({
            "type": "tool_result",
            "tool_use_id": id,
            "content": result,
        }),
    }
}

fn encode_tool(spec: &ToolSpec) -> Value {
    let required: Vec<&String> = spec.params.keys().collect();
    json!({
        "name": &spec.name,
        "description": &spec.desc,
        "input_schema": {
            "type": "object",
            "properties": &spec.params,
            "required": required,
        },
        "strict": true,
    })
}

struct AnthropicStream {
    response: reqwest::Response,
    state: StreamState,
}

#[async_trait]
impl ResponseStream for AnthropicStream {
    async fn consume(self: Box<Self>, cancel: CancellationToken, out: mpsc::Sender<Event>) {
        // Dropping `out` on return closes the channel; dropping the byte
        // stream closes the HTTP body.
        let mut bytes = self.response.bytes_stream();
        let mut parser = crate::sse::SseParser::new();
        let mut state = self.state;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                chunk = bytes.next() => chunk,
            };

            match chunk {
                Some(Ok(chunk)) => {
                    for payload in parser.push(&chunk) {
                        if state.dispatch(&payload, &cancel, &out).await {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    send_event(&cancel, &out, Event::Error(ProviderError::Network(e.to_string())))
                        .await;
                    return;
                }
                None => break,
            }
        }

        // EOF without a message_stop: the stream was cut short.
        send_event(
            &cancel,
            &out,
            Event::Error(ProviderError::Interrupted(
                "connection closed before message stop".into(),
            )),
        )
        .await;
    }
}

/// Incrementally assembles the round's `Response` from content-block
/// events. The trailing message of `resp.messages` is always the block
/// currently being streamed.
struct StreamState {
    model_id: String,
    resp: Response,
}

impl StreamState {
    fn new(model_id: String) -> Self {
        Self {
            model_id,
            resp: Response::default(),
        }
    }

    /// Decode one SSE payload and advance the state machine. Returns true
    /// when the caller should stop consuming.
    async fn dispatch(
        &mut self,
        payload: &str,
        cancel: &CancellationToken,
        out: &mpsc::Sender<Event>,
    ) -> bool {
        let event: RawSse = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                send_event(
                    cancel,
                    out,
                    Event::Error(ProviderError::Protocol(format!("bad event frame: {e}"))),
                )
                .await;
                return true;
            }
        };

        match event.kind.as_str() {
            "ping" => false,
            "message_start" => {
                self.resp.model = event.message.model;
                false
            }
            "message_delta" => {
                // Usage counters are overwritten, not accumulated: each
                // message_delta reports the totals so far.
                let u = &event.usage;
                self.resp.usage = Usage {
                    input: u.input_tokens,
                    cached: u.cache_read_input_tokens,
                    output: u.output_tokens,
                    reasoning: 0,
                    total: u.input_tokens + u.output_tokens,
                    cost: cost_from_usage(&self.model_id, u),
                };
                false
            }
            "message_stop" => {
                send_event(cancel, out, Event::Final(std::mem::take(&mut self.resp))).await;
                true
            }
            "content_block_start" => {
                let block = event.content_block;
                match block.kind.as_str() {
                    "thinking" => self.resp.messages.push(Msg::reasoning("", "")),
                    "text" => self
                        .resp
                        .messages
                        .push(Msg::content(Role::Assistant, "")),
                    // Tool use blocks already carry the id and name here;
                    // only the arguments stream in afterwards.
                    "tool_use" => self
                        .resp
                        .messages
                        .push(Msg::tool_call(block.id, block.name, "")),
                    other => {
                        debug!(kind = other, "ignoring unknown content block type");
                    }
                }
                false
            }
            "content_block_delta" => self.apply_delta(event.delta, cancel, out).await,
            "content_block_stop" => {
                let Some(last) = self.resp.messages.last() else {
                    return false;
                };
                match last.body() {
                    MsgBody::ToolCall {
                        id,
                        name,
                        arguments,
                    } => {
                        // Tool calls are surfaced only once fully assembled.
                        let call = ToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                        };
                        !send_event(cancel, out, Event::ToolCall(call)).await
                    }
                    // Reasoning is surfaced as one whole segment per block.
                    MsgBody::Reasoning { text, .. } => {
                        !send_event(cancel, out, Event::ReasonDelta(text.clone())).await
                    }
                    _ => false,
                }
            }
            other => {
                debug!(kind = other, "ignoring unknown messages event");
                false
            }
        }
    }

    async fn apply_delta(
        &mut self,
        delta: RawDelta,
        cancel: &CancellationToken,
        out: &mpsc::Sender<Event>,
    ) -> bool {
        let Some(last) = self.resp.messages.last_mut() else {
            send_event(
                cancel,
                out,
                Event::Error(ProviderError::Protocol(
                    "content delta before any content block".into(),
                )),
            )
            .await;
            return true;
        };

        match (delta.kind.as_str(), last.body_mut()) {
            ("thinking_delta", MsgBody::Reasoning { text, .. }) => {
                text.push_str(&delta.thinking);
                false
            }
            ("signature_delta", MsgBody::Reasoning { encrypted, .. }) => {
                encrypted.push_str(&delta.signature);
                false
            }
            ("text_delta", MsgBody::Content { text, .. }) => {
                // Text deltas are the one block kind relayed immediately.
                text.push_str(&delta.text);
                !send_event(cancel, out, Event::ContentDelta(delta.text)).await
            }
            ("input_json_delta", MsgBody::ToolCall { arguments, .. }) => {
                arguments.push_str(&delta.partial_json);
                false
            }
            (kind, _) => {
                send_event(
                    cancel,
                    out,
                    Event::Error(ProviderError::Protocol(format!(
                        "delta {kind} does not match the open content block"
                    ))),
                )
                .await;
                true
            }
        }
    }
}

async fn send_event(cancel: &CancellationToken, out: &mpsc::Sender<Event>, event: Event) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = out.send(event) => sent.is_ok(),
    }
}

// --- Wire encoding ---

#[derive(Serialize)]
struct RequestBody<'a> {
    max_tokens: i64,
    messages: Vec<WireMsg>,
    model: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingCfg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Serialize)]
struct ThinkingCfg {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: i64,
}

#[derive(Debug, Serialize, PartialEq)]
struct WireMsg {
    role: &'static str,
    content: Vec<Value>,
}

// --- SSE payload types ---

#[derive(Deserialize)]
struct RawSse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: RawMessageStart,
    #[serde(default)]
    usage: RawUsage,
    #[serde(default)]
    content_block: RawContentBlock,
    #[serde(default)]
    delta: RawDelta,
}

#[derive(Deserialize, Default)]
struct RawMessageStart {
    #[serde(default)]
    model: String,
}

#[derive(Deserialize, Default)]
struct RawUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    cache_creation_input_tokens: i64,
    #[serde(default)]
    cache_read_input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

#[derive(Deserialize, Default)]
struct RawContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize, Default)]
struct RawDelta {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    thinking: String,
    #[serde(default)]
    signature: String,
    #[serde(default)]
    partial_json: String,
}

// --- Pricing ---

/// Per-token rates in units of 10⁻⁹ USD. Cache writes bill at 1.25× the
/// input rate and cache reads at 0.1×.
struct ModelRates {
    input: i64,
    cache_write: i64,
    cache_read: i64,
    output: i64,
}

fn model_rates(model: &str) -> Option<ModelRates> {
    let rates = match model {
        // $1 / $5 per 1M
        "claude-haiku-4-5-20251001" => ModelRates {
            input: 1_000,
            cache_write: 1_250,
            cache_read: 100,
            output: 5_000,
        },
        // $3 / $15 per 1M
        "claude-sonnet-4-5-20250929" => ModelRates {
            input: 3_000,
            cache_write: 3_750,
            cache_read: 300,
            output: 15_000,
        },
        // $5 / $25 per 1M
        "claude-opus-4-5-20251101" => ModelRates {
            input: 5_000,
            cache_write: 6_250,
            cache_read: 500,
            output: 25_000,
        },
        _ => return None,
    };
    Some(rates)
}

fn cost_from_usage(model: &str, usage: &RawUsage) -> i64 {
    let rates = model_rates(model).expect("model id validated at construction");
    rates.input * usage.input_tokens
        + rates.cache_write * usage.cache_creation_input_tokens
        + rates.cache_read * usage.cache_read_input_tokens
        + rates.output * usage.output_tokens
}
