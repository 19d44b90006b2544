mod accumulator;
mod literal;
mod providers;
mod stream;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
#[path = "test/unit/agent_loop_test.rs"]
mod agent_loop_test;

pub use accumulator::{PendingToolCall, ToolCallAccumulator};
pub use literal::{parse_arguments, parse_literal};
pub use providers::{
    ChatDelta, ChatTransport, HttpTransport, Message, Ollama, OllamaStreamParser,
    OpenAiCompatible, OpenAiStreamParser, ProviderConfig, ProviderError, ProviderKind,
    ProviderRegistry, ProviderRequest, ProviderSpec, Role, StreamParser, ToolCall, ToolCallDelta,
    classify_error,
};
pub use stream::{EventStream, LineStream, StreamLineDecoder, decode_stream, split_lines};

use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

use crate::tools::{ToolCatalog, ToolContent, ToolDescriptor};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are good at analyzing user questions and choosing the appropriate tools to solve user problems. Think step by step, but keep only a minimum draft for each thinking step, and finally choose the appropriate tool to solve the problem. Note: Only use the tools you have been provided with.";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Keep the conversation across commands
    pub use_history: bool,
    pub stream: bool,
    pub max_rounds: usize,
    /// Sent as the system message; empty disables it
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            use_history: true,
            stream: true,
            max_rounds: 20,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Incremental progress of a command, for UIs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Content(String),
    Reasoning(String),
    ToolCallStart {
        id: String,
        name: String,
        arguments: String,
    },
    ToolCallEnd {
        id: String,
        name: String,
        output: String,
    },
    Done(String),
}

pub type EventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// Cooperative cancellation. `stop` ends the worker, `skip` only the
/// command in flight; both abort the current round.
#[derive(Debug, Clone, Default)]
pub struct CancelFlags {
    stop: Arc<AtomicBool>,
    skip: Arc<AtomicBool>,
}

impl CancelFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn request_skip(&self) {
        self.skip.store(true, Ordering::SeqCst);
    }

    pub fn reset_skip(&self) {
        self.skip.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_stopped() || self.skip.load(Ordering::SeqCst)
    }
}

struct RoundOutcome {
    text: String,
    called_tools: bool,
}

pub struct Agent {
    config: AgentConfig,
    spec: Arc<dyn ProviderSpec>,
    provider_config: ProviderConfig,
    catalog: Arc<dyn ToolCatalog>,
    transport: Arc<dyn ChatTransport>,
    cancel: CancelFlags,
    events: Option<EventSink>,
    history: Vec<Message>,
    accumulator: ToolCallAccumulator,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        spec: Arc<dyn ProviderSpec>,
        provider_config: ProviderConfig,
        catalog: Arc<dyn ToolCatalog>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            config,
            spec,
            provider_config,
            catalog,
            transport,
            cancel: CancelFlags::new(),
            events: None,
            history: Vec::new(),
            accumulator: ToolCallAccumulator::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlags) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn kind(&self) -> ProviderKind {
        self.spec.kind()
    }

    pub fn model(&self) -> &str {
        &self.provider_config.model
    }

    pub fn cancel_flags(&self) -> &CancelFlags {
        &self.cancel
    }

    /// Apply new settings. Takes effect from the next round.
    pub fn reconfigure(&mut self, config: AgentConfig, provider_config: ProviderConfig) {
        if provider_config != self.provider_config {
            info!("{} now using model {}", self.spec.kind(), provider_config.model);
        }
        self.config = config;
        self.provider_config = provider_config;
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        debug!("Clearing {} history messages", self.history.len());
        self.history.clear();
    }

    /// Process one user command to completion. Returns the assistant's
    /// final text.
    pub async fn run(&mut self, command: &str) -> Result<String> {
        if !self.config.use_history {
            self.history.clear();
        }
        self.history.push(Message::user(command));

        let mut final_text = String::new();
        let mut round = 0;

        loop {
            if self.cancel.is_cancelled() {
                info!("Command cancelled before round {}", round + 1);
                break;
            }

            round += 1;
            if round > self.config.max_rounds {
                anyhow::bail!("Max rounds ({}) exceeded", self.config.max_rounds);
            }

            // Re-fetched each round: packages may be toggled between rounds
            let tools = self.catalog.list_tools();
            debug!("Round {} with {} tools", round, tools.len());

            let outcome = self.run_round(&tools).await?;
            if !outcome.text.is_empty() {
                final_text = outcome.text;
            }
            if !outcome.called_tools {
                break;
            }
        }

        self.emit(AgentEvent::Done(final_text.clone()));
        Ok(final_text)
    }

    async fn run_round(&mut self, tools: &[ToolDescriptor]) -> Result<RoundOutcome> {
        let system_prompt = Some(self.config.system_prompt.as_str()).filter(|p| !p.is_empty());
        let request = self.spec.build_request(
            &self.provider_config,
            system_prompt,
            &self.history,
            tools,
            self.config.stream,
        );

        let lines = match self.transport.open_stream(&request).await {
            Ok(lines) => lines,
            Err(e) => return Err(self.report(e)),
        };

        let mut events = decode_stream(lines);
        let mut parser = self.spec.stream_parser();
        self.accumulator.reset();

        let mut round_text = String::new();
        // Text not yet written to history
        let mut unsaved_text = String::new();

        while let Some(event) = events.next().await {
            if self.cancel.is_cancelled() {
                info!("Round cancelled mid-stream");
                break;
            }

            let event = match event {
                Ok(event) => event,
                Err(e) => return Err(self.report(e)),
            };
            let delta = match parser.parse(&event) {
                Ok(delta) => delta,
                Err(e) => return Err(self.report(e)),
            };

            if let Some(reasoning) = delta.reasoning {
                self.emit(AgentEvent::Reasoning(reasoning));
            }
            if let Some(content) = delta.content {
                round_text.push_str(&content);
                unsaved_text.push_str(&content);
                self.emit(AgentEvent::Content(content));
            }

            for call_delta in &delta.tool_calls {
                let Some(index) = self.accumulator.apply(call_delta) else {
                    continue;
                };
                // One event may carry several ready calls
                if self.cancel.is_cancelled() {
                    break;
                }
                if let Some(call) = self.accumulator.take(index) {
                    self.save_text(&mut unsaved_text);
                    self.execute(call).await;
                }
            }
        }

        if self.cancel.is_cancelled() {
            // Partial calls are abandoned, not executed
            let abandoned = self.accumulator.drain_unexecuted();
            if !abandoned.is_empty() {
                info!("Abandoned {} unfinished tool calls", abandoned.len());
            }
        } else {
            let trailing = self.accumulator.drain_unexecuted();
            if !trailing.is_empty() {
                self.save_text(&mut unsaved_text);
            }
            for call in trailing {
                if self.cancel.is_cancelled() {
                    info!("Dropped forced tool call #{} after cancel", call.index);
                    continue;
                }
                debug!("Forcing tool call #{} at end of stream", call.index);
                self.execute(call).await;
            }
        }
        self.save_text(&mut unsaved_text);

        Ok(RoundOutcome {
            text: round_text,
            called_tools: self.accumulator.opened_any(),
        })
    }

    fn save_text(&mut self, text: &mut String) {
        if !text.is_empty() {
            self.history.push(Message::assistant(std::mem::take(text)));
        }
    }

    /// Run one tool call and append the request and its results to history.
    async fn execute(&mut self, pending: PendingToolCall) {
        let call = ToolCall {
            id: pending.id,
            name: pending.name,
            arguments: pending.arguments,
        };
        info!("Calling tool {} with {}", call.name, call.arguments);
        self.emit(AgentEvent::ToolCallStart {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let contents = match parse_arguments(&call.arguments) {
            Ok(arguments) => self.catalog.invoke(&call.name, arguments).await,
            Err(e) => {
                warn!("Bad arguments for {}: {}", call.name, e);
                vec![ToolContent::error(format!("invalid tool arguments: {}", e))]
            }
        };

        self.history.push(Message::tool_request(call.clone()));

        let mut outputs = Vec::new();
        for content in &contents {
            if content.is_error() {
                warn!("Tool {} failed: {:?}", call.name, content);
            }
            let message = match content {
                ToolContent::Text(text) => Message::tool_response(&call, text.as_str()),
                ToolContent::Image { data, mime_type } => {
                    let mut message = Message::tool_response(&call, "");
                    message.images.push(format!("data:{};base64,{}", mime_type, data));
                    message
                }
                ToolContent::Resource(resource) => Message::tool_response(&call, resource.to_string()),
            };
            outputs.push(message.content.clone());
            self.history.push(message);
        }
        if contents.is_empty() {
            // Every tool call needs a response in history
            self.history.push(Message::tool_response(&call, ""));
        }

        self.emit(AgentEvent::ToolCallEnd {
            id: call.id,
            name: call.name,
            output: outputs.join("\n"),
        });
    }

    fn report(&self, e: ProviderError) -> anyhow::Error {
        if e.is_tools_unsupported() {
            error!(
                "Model {} on {} does not support tool calling: {}",
                self.provider_config.model,
                self.spec.kind(),
                e
            );
        } else {
            warn!("{} request failed: {}", self.spec.kind(), e);
        }
        e.into()
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(ref sink) = self.events {
            sink(event);
        }
    }
}
