//! The round-loop orchestrator.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tandem_core::error::{Error, ToolError};
use tandem_core::event::{Event, ToolCall};
use tandem_core::message::{Msg, Role};
use tandem_core::model::{Model, ProviderKind, StreamCfg};
use tandem_core::response::{Response, Usage};
use tandem_core::store::Store;
use tandem_core::tool::ToolSpec;

use crate::registry::{Tool, ToolRegistry};

/// Upper bound on request/response cycles per run. The final round is
/// steered so the model produces a user-visible reply instead of more tool
/// calls.
pub const MAX_ROUNDS: usize = 4;

/// Injected into the request history on the final round for providers that
/// support mid-conversation system messages. Forbidding tools through
/// config alone makes those models emit a confused reply, because the tool
/// specs disappear from the request.
const FINAL_ROUND_STEER: &str = "Tool budget for this turn is exhausted. \
    Answer the user now with what you already have, and defer any further \
    tool use to their next message.";

/// Composes a model, a session store, a system prompt, and a set of tools
/// into a conversational agent.
pub struct Agent {
    sys_prompt: String,
    model: Arc<dyn Model>,
    store: Arc<dyn Store>,
    registry: ToolRegistry,
    tool_specs: Vec<ToolSpec>,
}

impl Agent {
    /// Build an agent. Panics if two tools share a name — that is a bug in
    /// the caller, not a runtime condition.
    pub fn new(
        sys_prompt: impl Into<String>,
        model: Arc<dyn Model>,
        store: Arc<dyn Store>,
        tools: Vec<Tool>,
    ) -> Self {
        let mut registry = ToolRegistry::new();
        let mut tool_specs = Vec::with_capacity(tools.len());
        for tool in tools {
            registry.register(tool.spec.name.clone(), tool.handler);
            tool_specs.push(tool.spec);
        }

        Self {
            sys_prompt: sys_prompt.into(),
            model,
            store,
            registry,
            tool_specs,
        }
    }

    /// Run one user turn to completion and return the assembled reply.
    ///
    /// With `include_internals`, tool calls, tool results, and reasoning
    /// segments are rendered into the transcript as bracketed markers.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        http: &reqwest::Client,
        session: &str,
        input: &str,
        include_internals: bool,
    ) -> Result<String, Error> {
        let mut sink = TranscriptSink {
            internals: include_internals,
            out: String::new(),
            assembly: Assembly::default(),
        };
        self.drive(cancel, http, session, input, &mut sink).await?;

        // The bracketed transcript only makes sense when the model actually
        // produced terminal content; otherwise fall back to raw deltas.
        if sink.assembly.content.is_empty() {
            Ok(sink.assembly.deltas)
        } else {
            Ok(sink.out)
        }
    }

    /// Like `run`, but invokes `on_event` for every stream event as it
    /// arrives. Returns the final content if the terminal message carried
    /// any, else the concatenated content deltas.
    pub async fn run_stream(
        &self,
        cancel: CancellationToken,
        http: &reqwest::Client,
        session: &str,
        input: &str,
        on_event: impl FnMut(&Event) + Send,
    ) -> Result<String, Error> {
        let mut sink = CallbackSink {
            on_event,
            assembly: Assembly::default(),
        };
        self.drive(cancel, http, session, input, &mut sink).await?;
        Ok(sink.assembly.into_text())
    }

    async fn drive(
        &self,
        cancel: CancellationToken,
        http: &reqwest::Client,
        session: &str,
        input: &str,
        sink: &mut dyn RunSink,
    ) -> Result<(), Error> {
        // Every run gets a derived token: an error or an early drop cancels
        // the stream consumer and any in-flight tool workers.
        let cancel = cancel.child_token();
        let _guard = cancel.clone().drop_guard();

        let mut msgs = self.store.messages(session).await;
        // Everything before this index is already persisted.
        let persist_from = msgs.len();

        if msgs.is_empty() {
            msgs.push(Msg::content(Role::System, &self.sys_prompt));
        }
        msgs.push(Msg::content(Role::User, input));

        info!(session, history = persist_from, "starting run");

        let mut usage = Usage::default();

        for round in 0..MAX_ROUNDS {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut cfg = StreamCfg::default();
            let mut steer = false;
            if round == MAX_ROUNDS - 1 {
                match self.model.provider() {
                    ProviderKind::Responses => steer = true,
                    ProviderKind::Messages => cfg.disable_tools = true,
                }
            }

            debug!(session, round, steer, "opening round stream");

            let stream = if steer {
                // The steering message belongs to this request only; it is
                // never part of the session history and never persists.
                let mut request = msgs.clone();
                request.push(Msg::content(Role::System, FINAL_ROUND_STEER));
                self.model
                    .open_stream(http, &request, &self.tool_specs, cfg)
                    .await?
            } else {
                self.model
                    .open_stream(http, &msgs, &self.tool_specs, cfg)
                    .await?
            };

            let (event_tx, mut events) = mpsc::channel(16);
            tokio::spawn(stream.consume(cancel.child_token(), event_tx));

            let (result_tx, mut results) = mpsc::channel(4);
            let mut pending = 0usize;
            let mut response: Option<Response> = None;

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                sink.on_event(&event);

                match event {
                    Event::ToolCall(call) => {
                        // Start the handler immediately; results are
                        // collected after the stream ends.
                        pending += 1;
                        self.spawn_tool(&cancel, call, result_tx.clone());
                    }
                    Event::ReasonDelta(_) | Event::ContentDelta(_) => {}
                    Event::Final(resp) => response = Some(resp),
                    Event::Error(e) => {
                        cancel.cancel();
                        return Err(Error::Provider(e));
                    }
                }
            }

            let Some(response) = response else {
                // The adapter dropped the channel without a final response
                // or an error: it observed our cancellation.
                return Err(Error::Cancelled);
            };

            msgs.extend(response.messages);
            usage.accumulate(response.usage);

            if pending == 0 {
                // Terminal message: no tools requested this round.
                break;
            }

            // Collect exactly `pending` results, in completion order. The
            // call ids keep the pairing unambiguous for the model.
            for _ in 0..pending {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    outcome = results.recv() => outcome,
                };
                let Some(outcome) = outcome else {
                    return Err(Error::Cancelled);
                };

                sink.on_tool_result(&outcome.id, &outcome.result);
                msgs.push(Msg::tool_result(outcome.id, outcome.result));
            }
        }

        // Persist the new slice, minus reasoning: neither provider reads
        // reasoning from history once the tool calls it preceded are
        // resolved.
        let to_persist: Vec<Msg> = msgs[persist_from..]
            .iter()
            .filter(|m| !m.is_reasoning())
            .cloned()
            .collect();
        self.store
            .extend(session, &to_persist, usage)
            .await
            .map_err(Error::Store)?;

        Ok(())
    }

    fn spawn_tool(
        &self,
        cancel: &CancellationToken,
        call: ToolCall,
        results: mpsc::Sender<ToolOutcome>,
    ) {
        let handler = self.registry.handler(&call.name);
        let cancel = cancel.child_token();

        tokio::spawn(async move {
            let outcome = match handler {
                Some(handler) => handler(cancel.clone(), call.arguments.into_bytes()).await,
                None => Err(ToolError::Unknown(call.name.clone())),
            };

            // Handler failures never abort the run; the stringified error
            // becomes the result so the model can react.
            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "tool handler failed");
                    format!("error calling tool {}: {e}", call.name)
                }
            };

            let outcome = ToolOutcome {
                id: call.id,
                result,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = results.send(outcome) => {}
            }
        });
    }
}

struct ToolOutcome {
    id: String,
    result: String,
}

/// Where drive() reports progress. `run` renders a transcript; `run_stream`
/// forwards to the caller.
trait RunSink: Send {
    fn on_event(&mut self, event: &Event);
    fn on_tool_result(&mut self, _id: &str, _result: &str) {}
}

/// Tracks the two candidate return texts: explicit terminal content and
/// the concatenation of content deltas.
#[derive(Default)]
struct Assembly {
    content: String,
    deltas: String,
}

impl Assembly {
    fn note(&mut self, event: &Event) {
        match event {
            Event::ContentDelta(delta) => self.deltas.push_str(delta),
            Event::Final(resp) => {
                if let Some((Role::Assistant, text)) =
                    resp.messages.last().and_then(|m| m.content_text())
                {
                    self.content.push_str(text);
                }
            }
            _ => {}
        }
    }

    fn into_text(self) -> String {
        if self.content.is_empty() {
            self.deltas
        } else {
            self.content
        }
    }
}

struct TranscriptSink {
    internals: bool,
    out: String,
    assembly: Assembly,
}

impl RunSink for TranscriptSink {
    fn on_event(&mut self, event: &Event) {
        self.assembly.note(event);
        match event {
            Event::ToolCall(call) if self.internals => {
                let _ = write!(
                    self.out,
                    "\n[Tool Call: {}, {}, {}]\n\n",
                    call.name, call.id, call.arguments
                );
            }
            Event::ReasonDelta(delta) if self.internals => {
                let _ = write!(self.out, "\n[Reasoning: {delta}]\n\n");
            }
            Event::Final(resp) => {
                if let Some((Role::Assistant, text)) =
                    resp.messages.last().and_then(|m| m.content_text())
                {
                    self.out.push_str(text);
                }
            }
            _ => {}
        }
    }

    fn on_tool_result(&mut self, id: &str, result: &str) {
        if self.internals {
            let _ = write!(self.out, "\n[Tool Result: {id}, {result}]\n\n");
        }
    }
}

struct CallbackSink<F: FnMut(&Event) + Send> {
    on_event: F,
    assembly: Assembly,
}

impl<F: FnMut(&Event) + Send> RunSink for CallbackSink<F> {
    fn on_event(&mut self, event: &Event) {
        self.assembly.note(event);
        (self.on_event)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde::Deserialize;

    use tandem_core::error::ProviderError;
    use tandem_core::message::MsgBody;
    use tandem_core::model::ResponseStream;
    use tandem_core::tool::ToolParam;
    use tandem_store::EphemeralStore;

    /// A model that replays scripted event rounds and records every
    /// request it receives.
    struct ScriptedModel {
        kind: ProviderKind,
        rounds: Mutex<VecDeque<Vec<Event>>>,
        requests: Mutex<Vec<(Vec<Msg>, StreamCfg)>>,
    }

    impl ScriptedModel {
        fn new(kind: ProviderKind, rounds: Vec<Vec<Event>>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                rounds: Mutex::new(rounds.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<(Vec<Msg>, StreamCfg)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Model for ScriptedModel {
        async fn open_stream(
            &self,
            _http: &reqwest::Client,
            msgs: &[Msg],
            _tools: &[ToolSpec],
            cfg: StreamCfg,
        ) -> Result<Box<dyn ResponseStream>, ProviderError> {
            self.requests.lock().unwrap().push((msgs.to_vec(), cfg));
            let events = self.rounds.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedStream { events }))
        }

        fn provider(&self) -> ProviderKind {
            self.kind
        }
    }

    struct ScriptedStream {
        events: Vec<Event>,
    }

    #[async_trait]
    impl ResponseStream for ScriptedStream {
        async fn consume(self: Box<Self>, cancel: CancellationToken, out: mpsc::Sender<Event>) {
            for event in self.events {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = out.send(event) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// A stream that produces nothing until cancelled.
    struct HangingModel;

    #[async_trait]
    impl Model for HangingModel {
        async fn open_stream(
            &self,
            _http: &reqwest::Client,
            _msgs: &[Msg],
            _tools: &[ToolSpec],
            _cfg: StreamCfg,
        ) -> Result<Box<dyn ResponseStream>, ProviderError> {
            Ok(Box::new(HangingStream))
        }

        fn provider(&self) -> ProviderKind {
            ProviderKind::Responses
        }
    }

    struct HangingStream;

    #[async_trait]
    impl ResponseStream for HangingStream {
        async fn consume(self: Box<Self>, cancel: CancellationToken, _out: mpsc::Sender<Event>) {
            cancel.cancelled().await;
        }
    }

    fn final_content(text: &str, usage: Usage) -> Event {
        Event::Final(Response {
            model: "scripted".into(),
            usage,
            messages: vec![Msg::content(Role::Assistant, text)],
        })
    }

    fn round_usage() -> Usage {
        Usage {
            input: 10,
            output: 5,
            total: 15,
            ..Usage::default()
        }
    }

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct WeatherArgs {
        location: String,
        units: String,
    }

    fn weather_tool() -> Tool {
        Tool::new(
            ToolSpec::new("getWeather", "Look up the weather")
                .param("location", ToolParam::string("The city"))
                .param(
                    "units",
                    ToolParam::string("Units").with_choices(["Celsius", "Fahrenheit"]),
                ),
            |_cancel, args: WeatherArgs| async move {
                Ok(format!(
                    r#"{{"temperature":25,"description":"Sunny","location":"{}","units":"{}"}}"#,
                    args.location, args.units
                ))
            },
        )
    }

    fn failing_tool() -> Tool {
        Tool::new(
            ToolSpec::new("broken", "Always fails"),
            |_cancel, _args: serde_json::Value| async move {
                Err(ToolError::Failed("backend unavailable".into()))
            },
        )
    }

    fn agent(model: Arc<dyn Model>, store: Arc<dyn Store>, tools: Vec<Tool>) -> Agent {
        Agent::new("You are a helpful assistant.", model, store, tools)
    }

    #[tokio::test]
    async fn simple_echo_round() {
        let model = ScriptedModel::new(
            ProviderKind::Responses,
            vec![vec![
                Event::ContentDelta("The capital of France ".into()),
                Event::ContentDelta("is Paris.".into()),
                final_content("The capital of France is Paris.", round_usage()),
            ]],
        );
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![]);

        let text = agent
            .run(
                CancellationToken::new(),
                &reqwest::Client::new(),
                "s1",
                "What is the capital of France?",
                false,
            )
            .await
            .unwrap();
        assert!(text.contains("Paris"));

        // First turn: system prompt + user + assistant persisted.
        let persisted = store.messages("s1").await;
        assert_eq!(persisted.len(), 3);
        assert_eq!(persisted[0].content_text().unwrap().0, Role::System);
        assert_eq!(
            persisted[1].content_text(),
            Some((Role::User, "What is the capital of France?"))
        );
        assert_eq!(store.usage("s1").await.total, 15);

        // One round, no tools requested.
        assert_eq!(model.requests().len(), 1);
    }

    #[tokio::test]
    async fn second_turn_reuses_history_without_new_system_prompt() {
        let store = Arc::new(EphemeralStore::new());
        let model = ScriptedModel::new(
            ProviderKind::Responses,
            vec![
                vec![final_content("Hi Victhor, I'm the assistant.", round_usage())],
                vec![final_content("Your name is Victhor.", round_usage())],
            ],
        );
        let agent = agent(model.clone(), store.clone(), vec![]);
        let http = reqwest::Client::new();

        agent
            .run(
                CancellationToken::new(),
                &http,
                "s1",
                "My name is Victhor, what is yours?",
                false,
            )
            .await
            .unwrap();
        let text = agent
            .run(CancellationToken::new(), &http, "s1", "Repeat my name.", false)
            .await
            .unwrap();
        assert!(text.contains("Victhor"));

        let requests = model.requests();
        // Second request: persisted history (3) + new user message, with
        // exactly one system message at the front.
        let (msgs, _) = &requests[1];
        assert_eq!(msgs.len(), 4);
        let system_count = msgs
            .iter()
            .filter(|m| matches!(m.content_text(), Some((Role::System, _))))
            .count();
        assert_eq!(system_count, 1);

        assert_eq!(store.messages("s1").await.len(), 5);
        assert_eq!(store.usage("s1").await.total, 30);
    }

    #[tokio::test]
    async fn tool_round_trip() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "getWeather".into(),
            arguments: r#"{"location":"Tokyo","units":"Celsius"}"#.into(),
        };
        let model = ScriptedModel::new(
            ProviderKind::Messages,
            vec![
                vec![
                    Event::ToolCall(call.clone()),
                    Event::Final(Response {
                        model: "scripted".into(),
                        usage: round_usage(),
                        messages: vec![Msg::tool_call(
                            call.id.clone(),
                            call.name.clone(),
                            call.arguments.clone(),
                        )],
                    }),
                ],
                vec![final_content("It is 25 and sunny in Tokyo.", round_usage())],
            ],
        );
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![weather_tool()]);

        let text = agent
            .run(
                CancellationToken::new(),
                &reqwest::Client::new(),
                "s1",
                "Weather in Tokyo? In Celsius",
                false,
            )
            .await
            .unwrap();
        assert!(text.contains("25"));
        assert!(text.to_lowercase().contains("sunny"));

        // The second request must carry the tool result keyed by call id.
        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        let (msgs, _) = &requests[1];
        let tool_result = msgs
            .iter()
            .find_map(|m| match m.body() {
                MsgBody::ToolResult { id, result } => Some((id.clone(), result.clone())),
                _ => None,
            })
            .expect("tool result in second request");
        assert_eq!(tool_result.0, "call_1");
        assert!(tool_result.1.contains("Sunny"));
        assert!(tool_result.1.contains("Tokyo"));

        // Exactly one tool result persisted for one tool call.
        let persisted = store.messages("s1").await;
        let result_count = persisted
            .iter()
            .filter(|m| matches!(m.body(), MsgBody::ToolResult { .. }))
            .count();
        assert_eq!(result_count, 1);
    }

    #[tokio::test]
    async fn tool_results_match_tool_calls_per_round() {
        let calls: Vec<ToolCall> = (0..3)
            .map(|i| ToolCall {
                id: format!("call_{i}"),
                name: "getWeather".into(),
                arguments: r#"{"location":"Tokyo","units":"Celsius"}"#.into(),
            })
            .collect();
        let mut round_one: Vec<Event> = calls.iter().cloned().map(Event::ToolCall).collect();
        round_one.push(Event::Final(Response {
            model: "scripted".into(),
            usage: round_usage(),
            messages: calls
                .iter()
                .map(|c| Msg::tool_call(c.id.clone(), c.name.clone(), c.arguments.clone()))
                .collect(),
        }));

        let model = ScriptedModel::new(
            ProviderKind::Messages,
            vec![round_one, vec![final_content("done", round_usage())]],
        );
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![weather_tool()]);

        agent
            .run(
                CancellationToken::new(),
                &reqwest::Client::new(),
                "s1",
                "weather",
                false,
            )
            .await
            .unwrap();

        // Every call id got exactly one result, regardless of completion
        // order.
        let persisted = store.messages("s1").await;
        let mut result_ids: Vec<String> = persisted
            .iter()
            .filter_map(|m| match m.body() {
                MsgBody::ToolResult { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();
        result_ids.sort();
        assert_eq!(result_ids, vec!["call_0", "call_1", "call_2"]);
    }

    #[tokio::test]
    async fn tool_errors_become_result_text() {
        let model = ScriptedModel::new(
            ProviderKind::Messages,
            vec![
                vec![
                    Event::ToolCall(ToolCall {
                        id: "c1".into(),
                        name: "broken".into(),
                        arguments: "{}".into(),
                    }),
                    Event::Final(Response {
                        model: "scripted".into(),
                        usage: round_usage(),
                        messages: vec![Msg::tool_call("c1", "broken", "{}")],
                    }),
                ],
                vec![final_content("I could not reach the backend.", round_usage())],
            ],
        );
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![failing_tool()]);

        let text = agent
            .run(
                CancellationToken::new(),
                &reqwest::Client::new(),
                "s1",
                "try the tool",
                false,
            )
            .await
            .unwrap();
        // The run survived the handler failure.
        assert!(text.contains("could not reach"));

        let (msgs, _) = &model.requests()[1];
        let result = msgs
            .iter()
            .find_map(|m| match m.body() {
                MsgBody::ToolResult { result, .. } => Some(result.clone()),
                _ => None,
            })
            .unwrap();
        assert!(result.contains("error calling tool broken"));
        assert!(result.contains("backend unavailable"));
    }

    #[tokio::test]
    async fn unknown_tool_becomes_result_text() {
        let model = ScriptedModel::new(
            ProviderKind::Messages,
            vec![
                vec![
                    Event::ToolCall(ToolCall {
                        id: "c1".into(),
                        name: "nonexistent".into(),
                        arguments: "{}".into(),
                    }),
                    Event::Final(Response {
                        model: "scripted".into(),
                        usage: round_usage(),
                        messages: vec![Msg::tool_call("c1", "nonexistent", "{}")],
                    }),
                ],
                vec![final_content("That tool does not exist.", round_usage())],
            ],
        );
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![weather_tool()]);

        agent
            .run(
                CancellationToken::new(),
                &reqwest::Client::new(),
                "s1",
                "go",
                false,
            )
            .await
            .unwrap();

        let (msgs, _) = &model.requests()[1];
        let result = msgs
            .iter()
            .find_map(|m| match m.body() {
                MsgBody::ToolResult { result, .. } => Some(result.clone()),
                _ => None,
            })
            .unwrap();
        assert!(result.contains("unknown tool"));
    }

    #[tokio::test]
    async fn reasoning_is_never_persisted() {
        let model = ScriptedModel::new(
            ProviderKind::Responses,
            vec![vec![
                Event::ReasonDelta("Thinking it through.".into()),
                Event::Final(Response {
                    model: "scripted".into(),
                    usage: round_usage(),
                    messages: vec![
                        Msg::reasoning("blob==", ""),
                        Msg::content(Role::Assistant, "Answer."),
                    ],
                }),
            ]],
        );
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![]);

        agent
            .run(
                CancellationToken::new(),
                &reqwest::Client::new(),
                "s1",
                "question",
                false,
            )
            .await
            .unwrap();

        let persisted = store.messages("s1").await;
        assert!(persisted.iter().all(|m| !m.is_reasoning()));
        // system + user + assistant, with the reasoning block filtered.
        assert_eq!(persisted.len(), 3);
    }

    fn tool_call_round(id: &str) -> Vec<Event> {
        vec![
            Event::ToolCall(ToolCall {
                id: id.into(),
                name: "getWeather".into(),
                arguments: r#"{"location":"Tokyo","units":"Celsius"}"#.into(),
            }),
            Event::Final(Response {
                model: "scripted".into(),
                usage: round_usage(),
                messages: vec![Msg::tool_call(
                    id,
                    "getWeather",
                    r#"{"location":"Tokyo","units":"Celsius"}"#,
                )],
            }),
        ]
    }

    #[tokio::test]
    async fn final_round_steers_responses_kind_with_system_message() {
        // The model asks for a tool on every round.
        let rounds: Vec<Vec<Event>> = (0..MAX_ROUNDS)
            .map(|i| tool_call_round(&format!("call_{i}")))
            .collect();
        let model = ScriptedModel::new(ProviderKind::Responses, rounds);
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![weather_tool()]);

        agent
            .run(
                CancellationToken::new(),
                &reqwest::Client::new(),
                "s1",
                "weather forever",
                false,
            )
            .await
            .unwrap();

        let requests = model.requests();
        assert_eq!(requests.len(), MAX_ROUNDS);

        // Earlier rounds carry no steering message and no disable flag.
        for (msgs, cfg) in &requests[..MAX_ROUNDS - 1] {
            assert!(!cfg.disable_tools);
            assert!(!msgs
                .iter()
                .any(|m| matches!(m.content_text(), Some((Role::System, text)) if text.contains("Tool budget"))));
        }

        // The final round's request history ends with the injected steer.
        let (last_msgs, last_cfg) = requests.last().unwrap();
        assert!(!last_cfg.disable_tools);
        assert_eq!(
            last_msgs.last().and_then(|m| m.content_text()).map(|c| c.0),
            Some(Role::System)
        );

        // The steer is transient: nothing persisted mentions it.
        let persisted = store.messages("s1").await;
        assert!(!persisted
            .iter()
            .any(|m| matches!(m.content_text(), Some((_, text)) if text.contains("Tool budget"))));
    }

    #[tokio::test]
    async fn final_round_disables_tools_for_messages_kind() {
        let rounds: Vec<Vec<Event>> = (0..MAX_ROUNDS)
            .map(|i| tool_call_round(&format!("call_{i}")))
            .collect();
        let model = ScriptedModel::new(ProviderKind::Messages, rounds);
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![weather_tool()]);

        agent
            .run(
                CancellationToken::new(),
                &reqwest::Client::new(),
                "s1",
                "weather forever",
                false,
            )
            .await
            .unwrap();

        let requests = model.requests();
        assert_eq!(requests.len(), MAX_ROUNDS);
        for (msgs, cfg) in &requests[..MAX_ROUNDS - 1] {
            assert!(!cfg.disable_tools);
            // No mid-history system injection on this protocol.
            let system_count = msgs
                .iter()
                .filter(|m| matches!(m.content_text(), Some((Role::System, _))))
                .count();
            assert_eq!(system_count, 1);
        }
        assert!(requests.last().unwrap().1.disable_tools);
    }

    #[tokio::test]
    async fn stream_error_aborts_without_persisting() {
        let model = ScriptedModel::new(
            ProviderKind::Responses,
            vec![vec![
                Event::ContentDelta("partial".into()),
                Event::Error(ProviderError::Protocol("bad frame".into())),
            ]],
        );
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![]);

        let err = agent
            .run(
                CancellationToken::new(),
                &reqwest::Client::new(),
                "s1",
                "hello",
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::Protocol(_))));

        // Lossy on purpose: a failed run persists nothing.
        assert!(store.messages("s1").await.is_empty());
        assert_eq!(store.usage("s1").await.total, 0);
    }

    #[tokio::test]
    async fn run_stream_forwards_events_and_aggregates_deltas() {
        let model = ScriptedModel::new(
            ProviderKind::Responses,
            vec![vec![
                Event::ReasonDelta("Mulling.".into()),
                Event::ContentDelta("Pa".into()),
                Event::ContentDelta("ris".into()),
                Event::Final(Response {
                    model: "scripted".into(),
                    usage: round_usage(),
                    // No terminal content message: the return text falls
                    // back to the aggregated deltas.
                    messages: vec![],
                }),
            ]],
        );
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![]);

        let mut seen = Vec::new();
        let text = agent
            .run_stream(
                CancellationToken::new(),
                &reqwest::Client::new(),
                "s1",
                "capital?",
                |event| seen.push(format!("{event:?}")),
            )
            .await
            .unwrap();

        assert_eq!(text, "Paris");
        assert_eq!(seen.len(), 4);
        assert!(seen[0].contains("ReasonDelta"));
        assert!(seen[3].contains("Final"));
    }

    #[tokio::test]
    async fn run_stream_prefers_explicit_final_content() {
        let model = ScriptedModel::new(
            ProviderKind::Responses,
            vec![vec![
                Event::ContentDelta("partial deltas".into()),
                final_content("Full final answer.", round_usage()),
            ]],
        );
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![]);

        let text = agent
            .run_stream(
                CancellationToken::new(),
                &reqwest::Client::new(),
                "s1",
                "q",
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(text, "Full final answer.");
    }

    #[tokio::test]
    async fn internals_render_tool_markers() {
        let model = ScriptedModel::new(
            ProviderKind::Messages,
            vec![
                vec![
                    Event::ToolCall(ToolCall {
                        id: "c1".into(),
                        name: "getWeather".into(),
                        arguments: r#"{"location":"Tokyo","units":"Celsius"}"#.into(),
                    }),
                    Event::Final(Response {
                        model: "scripted".into(),
                        usage: round_usage(),
                        messages: vec![Msg::tool_call(
                            "c1",
                            "getWeather",
                            r#"{"location":"Tokyo","units":"Celsius"}"#,
                        )],
                    }),
                ],
                vec![final_content("Sunny.", round_usage())],
            ],
        );
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![weather_tool()]);

        let text = agent
            .run(
                CancellationToken::new(),
                &reqwest::Client::new(),
                "s1",
                "weather",
                true,
            )
            .await
            .unwrap();
        assert!(text.contains("[Tool Call: getWeather, c1,"));
        assert!(text.contains("[Tool Result: c1,"));
        assert!(text.contains("Sunny."));
    }

    #[tokio::test]
    async fn pre_cancelled_run_fails_fast() {
        let model = ScriptedModel::new(
            ProviderKind::Responses,
            vec![vec![final_content("never seen", round_usage())]],
        );
        let store = Arc::new(EphemeralStore::new());
        let agent = agent(model.clone(), store.clone(), vec![]);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = agent
            .run(cancel, &reqwest::Client::new(), "s1", "hello", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(store.messages("s1").await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_stream_aborts_cleanly() {
        let store = Arc::new(EphemeralStore::new());
        let agent = Arc::new(agent(Arc::new(HangingModel), store.clone(), vec![]));

        let cancel = CancellationToken::new();
        let task = {
            let agent = agent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                agent
                    .run(cancel, &reqwest::Client::new(), "s1", "hello", false)
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(store.messages("s1").await.is_empty());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_tool_names_abort_construction() {
        let model = ScriptedModel::new(ProviderKind::Responses, vec![]);
        let store = Arc::new(EphemeralStore::new());
        Agent::new(
            "prompt",
            model,
            store,
            vec![weather_tool(), weather_tool()],
        );
    }
}
