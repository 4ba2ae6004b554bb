//! OpenAI native provider implementation.
//!
//! Uses OpenAI's Responses API (not the chat-completions protocol).
//!
//! Features:
//! - Flattened input items (reasoning marker / message / function_call /
//!   function_call_output)
//! - Strict function tool schemas
//! - Encrypted reasoning passthrough via `include`
//! - Streaming via SSE with lifecycle + item + text + reasoning events
//! - Usage and cost projection from the completed-response object

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// OpenAI Responses API model adapter.
pub struct OpenAiModel {
    model: String,
    reasoning_effort: Option<String>,
    api_key: String,
    base_url: String,
}

impl OpenAiModel {
    /// Create a new adapter for `model`.
    ///
    /// Reads `OPENAI_API_KEY` from the environment and validates the model
    /// id against the pricing table; both failures are configuration
    /// errors, surfaced here rather than at run time.
    pub fn new(
        model: impl Into<String>,
        reasoning_effort: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let model = model.into();
        if model_rates(&model).is_none() {
            return Err(ConfigError::UnknownModel(model));
        }
        let api_key =
            std::env::var(API_KEY_ENV).map_err(|_| ConfigError::MissingEnv(API_KEY_ENV))?;

        Ok(Self {
            model,
            reasoning_effort: reasoning_effort.map(str::to_string),
            api_key,
            base_url: DEFAULT_BASE_URL.into(),
        })
    }

    /// Use a custom base URL (e.g., for proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Model for OpenAiModel {
    async fn open_stream(
        &self,
        http: &reqwest::Client,
        msgs: &[Msg],
        tools: &[ToolSpec],
        cfg: StreamCfg,
    ) -> Result<Box<dyn ResponseStream>, ProviderError> {
        let payload = RequestBody {
            include: &["reasoning.encrypted_content"],
            input: encode_input(msgs),
            model: &self.model,
            reasoning: self.reasoning_effort.as_deref().map(|effort| ReasoningCfg {
                effort,
                summary: if cfg.detailed_reasoning {
                    "detailed"
                } else {
                    "concise"
                },
            }),
            store: false,
            stream: true,
            tools: encode_tools(tools),
        };

        debug!(model = %self.model, msgs = msgs.len(), "opening responses stream");

        let response = http
            .post(format!("{}/v1/responses", self.base_url))
            .bearer_auth(&self.api_key)
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

        Ok(Box::new(OpenAiStream {
            response,
            state: StreamState::new(self.model.clone()),
        }))
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Responses
    }
}

/// Read at most 1 KiB of an error response body.
async fn body_snippet(response: reqwest::Response) -> String {
    let bytes = response.bytes().await.unwrap_or_default();
    String::from_utf8_lossy(&bytes[..bytes.len().min(1024)]).into_owned()
}

struct OpenAiStream {
    response: reqwest::Response,
    state: StreamState,
}

#[async_trait]
impl ResponseStream for OpenAiStream {
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

        // The connection may end with one unterminated event still buffered.
        if let Some(payload) = parser.finish() {
            if state.dispatch(&payload, &cancel, &out).await {
                return;
            }
        }

        if !state.completed {
            send_event(
                &cancel,
                &out,
                Event::Error(ProviderError::Interrupted(
                    "connection closed before response completed".into(),
                )),
            )
            .await;
        }
    }
}

struct StreamState {
    model_id: String,
    completed: bool,
}

impl StreamState {
    fn new(model_id: String) -> Self {
        Self {
            model_id,
            completed: false,
        }
    }

    /// Decode one SSE payload and emit the corresponding events. Returns
    /// true when the caller should stop consuming.
    async fn dispatch(
        &mut self,
        payload: &str,
        cancel: &CancellationToken,
        out: &mpsc::Sender<Event>,
    ) -> bool {
        let event: RawEvent = match serde_json::from_str(payload) {
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
            "response.created" | "response.in_progress" => false,
            "response.completed" => {
                let Some(raw) = event.response else {
                    send_event(
                        cancel,
                        out,
                        Event::Error(ProviderError::Protocol(
                            "completed event without response object".into(),
                        )),
                    )
                    .await;
                    return true;
                };
                match self.project_response(raw) {
                    Ok(response) => {
                        self.completed = true;
                        send_event(cancel, out, Event::Final(response)).await;
                    }
                    Err(e) => {
                        send_event(cancel, out, Event::Error(e)).await;
                    }
                }
                // Stop listening once the response is complete.
                true
            }
            "response.output_item.done" => {
                if let Some(item) = event.item {
                    if item.kind == "function_call" {
                        return !send_event(
                            cancel,
                            out,
                            Event::ToolCall(ToolCall {
                                id: item.call_id,
                                name: item.name,
                                arguments: item.arguments,
                            }),
                        )
                        .await;
                    }
                }
                false
            }
            "response.output_text.delta" => {
                !send_event(cancel, out, Event::ContentDelta(event.delta)).await
            }
            // Reasoning is surfaced as whole summary chunks, not individual
            // characters: the per-chunk done event always precedes the
            // part-level done, so this is the earliest complete segment.
            "response.reasoning_summary_text.done" => {
                !send_event(cancel, out, Event::ReasonDelta(event.text)).await
            }
            "error" => {
                send_event(
                    cancel,
                    out,
                    Event::Error(ProviderError::Model(payload.to_string())),
                )
                .await;
                true
            }
            "response.output_item.added"
            | "response.content_part.added"
            | "response.content_part.done"
            | "response.output_text.done"
            | "response.function_call_arguments.delta"
            | "response.function_call_arguments.done"
            | "response.reasoning_summary_part.added"
            | "response.reasoning_summary_text.delta"
            | "response.reasoning_summary_part.done" => false,
            other => {
                debug!(kind = other, "ignoring unknown responses event");
                false
            }
        }
    }

    fn project_response(&self, raw: RawResponse) -> Result<Response, ProviderError> {
        Ok(Response {
            usage: project_usage(&self.model_id, &raw.usage),
            messages: output_to_msgs(raw.output)?,
            model: raw.model,
        })
    }
}

fn output_to_msgs(output: Vec<RawItem>) -> Result<Vec<Msg>, ProviderError> {
    let mut msgs = Vec::with_capacity(output.len());

    for item in output {
        match item.kind.as_str() {
            "reasoning" => msgs.push(Msg::reasoning(item.encrypted_content, "")),
            "message" => {
                let role = match item.role.as_str() {
                    "assistant" => Role::Assistant,
                    "user" => Role::User,
                    "system" => Role::System,
                    other => {
                        return Err(ProviderError::Protocol(format!(
                            "unknown output role: {other}"
                        )))
                    }
                };
                let [content] = item.content.as_slice() else {
                    return Err(ProviderError::Protocol(format!(
                        "expected 1 content part, got {}",
                        item.content.len()
                    )));
                };
                msgs.push(Msg::content(role, content.text.clone()));
            }
            "function_call" => msgs.push(Msg::tool_call(item.call_id, item.name, item.arguments)),
            other => {
                return Err(ProviderError::Protocol(format!(
                    "unknown output item type: {other}"
                )))
            }
        }
    }

    Ok(msgs)
}

fn project_usage(model: &str, raw: &RawUsage) -> Usage {
    let cached = raw.input_tokens_details.cached_tokens;
    // Cached tokens are a subset of input tokens; anything else is a bug in
    // the projection, not a runtime condition.
    assert!(
        cached <= raw.input_tokens,
        "cached tokens ({cached}) exceed input tokens ({})",
        raw.input_tokens
    );
    let regular = raw.input_tokens - cached;

    let rates = model_rates(model).expect("model id validated at construction");

    Usage {
        input: regular,
        cached,
        output: raw.output_tokens,
        reasoning: raw.output_tokens_details.reasoning_tokens,
        total: raw.input_tokens + raw.output_tokens,
        cost: rates.input * regular + rates.cached_input * cached + rates.output * raw.output_tokens,
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
    include: &'a [&'a str],
    input: Vec<Value>,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningCfg<'a>>,
    store: bool,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Serialize)]
struct ReasoningCfg<'a> {
    effort: &'a str,
    summary: &'static str,
}

fn encode_input(msgs: &[Msg]) -> Vec<Value> {
    msgs.iter()
        .map(|m| m.wire_or_encode(ProviderKind::Responses, encode_msg).clone())
        .collect()
}

fn encode_msg(body: &MsgBody) -> Value {
    match body {
        MsgBody::Reasoning { encrypted, .. } => json!({
            "type": "reasoning",
            "encrypted_content": encrypted,
            "summary": [],
        }),
        MsgBody::Content { role, text } => json!({
            "type": "message",
            "role": role.as_str(),
            "content": text,
        }),
        MsgBody::ToolCall {
            id,
            name,
            arguments,
        } => json!({
            "type": "function_call",
            "call_id": id,
            "name": name,
            "arguments": arguments,
        }),
        MsgBody::ToolResult { id, result } => json!({
            "type": "function_call_output",
            "call_id": id,
            "output": result,
        }),
    }
}

fn encode_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools.iter().map(encode_tool).collect()
}

fn encode_tool(spec: &ToolSpec) -> Value {
    let required: Vec<&String> = spec.params.keys().collect();
    json!({
        "type": "function",
        "name": &spec.name,
        "description": &spec.desc,
        "parameters": {
            "type": "object",
            "properties": &spec.params,
            "required": required,
            "additionalProperties": false,
        },
        "strict": true,
    })
}

// --- SSE payload types ---

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    response: Option<RawResponse>,
    #[serde(default)]
    item: Option<RawItem>,
    #[serde(default)]
    delta: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct RawResponse {
    model: String,
    #[serde(default)]
    output: Vec<RawItem>,
    #[serde(default)]
    usage: RawUsage,
}

#[derive(Deserialize, Default)]
struct RawItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    encrypted_content: String,
    #[serde(default)]
    content: Vec<RawContent>,
    #[serde(default)]
    arguments: String,
    #[serde(default)]
    call_id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct RawContent {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct RawUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    input_tokens_details: RawInputDetails,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    output_tokens_details: RawOutputDetails,
}

#[derive(Deserialize, Default)]
struct RawInputDetails {
    #[serde(default)]
    cached_tokens: i64,
}

#[derive(Deserialize, Default)]
struct RawOutputDetails {
    #[serde(default)]
    reasoning_tokens: i64,
}

// --- Pricing ---

/// Per-token rates in units of 10⁻⁹ USD.
struct ModelRates {
    input: i64,
    cached_input: i64,
    output: i64,
}

fn model_rates(model: &str) -> Option<ModelRates> {
    let rates = match model {
        // $1.25 / $0.125 / $10 per 1M
        "gpt-5" => ModelRates {
            input: 1250,
            cached_input: 125,
            output: 10_000,
        },
        // $0.25 / $0.025 / $2 per 1M
        "gpt-5-mini" => ModelRates {
            input: 250,
            cached_input: 25,
            output: 2_000,
        },
        // $0.05 / $0.005 / $0.40 per 1M
        "gpt-5-nano" => ModelRates {
            input: 50,
            cached_input: 5,
            output: 400,
        },
        _ => return None,
    };
    Some(rates)
}
