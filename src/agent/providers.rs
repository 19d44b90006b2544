use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::stream::{LineStream, split_lines};
use crate::tools::ToolDescriptor;

/// Error payload substrings meaning "this model cannot call tools".
const TOOLS_UNSUPPORTED_MARKERS: &[&str] = &[
    "tools is not supported",
    "does not support Function Calling",
    "Function call is not supported for this model",
    "does not support tools",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name, set on tool responses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Images as `data:<mime>;base64,<payload>` URLs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            images: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// The assistant's request for one tool call.
    pub fn tool_request(call: ToolCall) -> Self {
        Self {
            tool_calls: Some(vec![call]),
            ..Self::new(Role::Assistant, "")
        }
    }

    /// One content item of a tool's response.
    pub fn tool_response(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            ..Self::new(Role::Tool, content)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text as assembled from the stream
    pub arguments: String,
}

/// Incremental tool-call data from one stream event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Everything one stream event contributes to a round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatDelta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("model does not support tool calling: {message}")]
    ToolsUnsupported { message: String },

    #[error("stream error: {0}")]
    Stream(String),
}

impl ProviderError {
    pub fn is_tools_unsupported(&self) -> bool {
        matches!(self, ProviderError::ToolsUnsupported { .. })
    }
}

/// Turn an error response body into a typed error.
pub fn classify_error(status: Option<u16>, body: &str) -> ProviderError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| error_message(&v))
        .unwrap_or_else(|| body.trim().to_string());

    if TOOLS_UNSUPPORTED_MARKERS.iter().any(|m| message.contains(m)) {
        return ProviderError::ToolsUnsupported { message };
    }
    match status {
        Some(status) => ProviderError::Status { status, message },
        None => ProviderError::Stream(message),
    }
}

/// Error text carried by a JSON payload: `error.message`, `error` as a
/// string, or a top-level `message` string.
fn error_message(payload: &Value) -> Option<String> {
    let error = &payload["error"];
    error["message"]
        .as_str()
        .or_else(|| error.as_str())
        .or_else(|| payload["message"].as_str())
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    DeepSeek,
    SiliconFlow,
    OpenRouter,
    OneApi,
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        ProviderKind::OpenAi,
        ProviderKind::DeepSeek,
        ProviderKind::SiliconFlow,
        ProviderKind::OpenRouter,
        ProviderKind::OneApi,
        ProviderKind::Ollama,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::SiliconFlow => "siliconflow",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::OneApi => "oneapi",
            ProviderKind::Ollama => "ollama",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown provider '{}'. Expected one of: {}",
                    s,
                    ProviderKind::ALL.map(|k| k.as_str()).join(", ")
                )
            })
    }
}

/// Resolved connection settings for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// A fully described HTTP request, independent of the HTTP client.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub stream: bool,
}

/// Converts decoded stream events into deltas. One instance per round.
pub trait StreamParser: Send {
    fn parse(&mut self, event: &Value) -> Result<ChatDelta, ProviderError>;
}

/// Capability interface implemented by every provider variant.
pub trait ProviderSpec: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn default_config(&self) -> ProviderConfig;

    fn build_request(
        &self,
        config: &ProviderConfig,
        system_prompt: Option<&str>,
        messages: &[Message],
        tools: &[ToolDescriptor],
        stream: bool,
    ) -> ProviderRequest;

    fn stream_parser(&self) -> Box<dyn StreamParser>;

    fn models_request(&self, config: &ProviderConfig) -> ProviderRequest;

    fn parse_models(&self, body: &Value) -> Vec<String>;
}

/// Explicit table of provider variants.
#[derive(Clone)]
pub struct ProviderRegistry {
    specs: Vec<Arc<dyn ProviderSpec>>,
}

impl ProviderRegistry {
    pub fn builtin() -> Self {
        let specs: Vec<Arc<dyn ProviderSpec>> = vec![
            Arc::new(OpenAiCompatible {
                kind: ProviderKind::OpenAi,
                base_url: "https://api.openai.com",
                chat_path: "/v1/chat/completions",
                models_path: "/v1/models",
                model: "gpt-4o-mini",
            }),
            Arc::new(OpenAiCompatible {
                kind: ProviderKind::DeepSeek,
                base_url: "https://api.deepseek.com",
                chat_path: "/chat/completions",
                models_path: "/models",
                model: "deepseek-chat",
            }),
            Arc::new(OpenAiCompatible {
                kind: ProviderKind::SiliconFlow,
                base_url: "https://api.siliconflow.cn",
                chat_path: "/v1/chat/completions",
                models_path: "/v1/models",
                model: "Qwen/Qwen2.5-7B-Instruct",
            }),
            Arc::new(OpenAiCompatible {
                kind: ProviderKind::OpenRouter,
                base_url: "https://openrouter.ai/api",
                chat_path: "/v1/chat/completions",
                models_path: "/v1/models",
                model: "anthropic/claude-3.5-haiku",
            }),
            Arc::new(OpenAiCompatible {
                kind: ProviderKind::OneApi,
                base_url: "https://openai.justsong.cn",
                chat_path: "/v1/chat/completions",
                models_path: "/v1/models",
                model: "Qwen/Qwen2.5-7B-Instruct",
            }),
            Arc::new(Ollama),
        ];
        Self { specs }
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderSpec>> {
        self.specs.iter().find(|s| s.kind() == kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.specs.iter().map(|s| s.kind()).collect()
    }
}

fn json_headers(api_key: &str) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("Accept".to_string(), "application/json".to_string()),
    ];
    if !api_key.is_empty() {
        headers.push(("Authorization".to_string(), format!("Bearer {}", api_key)));
    }
    headers
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

// OpenAI-compatible providers

/// OpenAI wire shape; vendors differ only in endpoints and defaults.
pub struct OpenAiCompatible {
    kind: ProviderKind,
    base_url: &'static str,
    chat_path: &'static str,
    models_path: &'static str,
    model: &'static str,
}

impl OpenAiCompatible {
    fn format_tools(&self, tools: &[ToolDescriptor]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": compact_description(&t.description, &t.parameters),
                        "parameters": t.parameters
                    }
                })
            })
            .collect()
    }

    fn format_messages(&self, system_prompt: Option<&str>, messages: &[Message]) -> Vec<Value> {
        let system = system_prompt.map(|p| json!({"role": "system", "content": p}));

        system
            .into_iter()
            .chain(messages.iter().map(|m| {
                let mut msg = json!({
                    "role": m.role.as_str(),
                    "content": m.content
                });

                if !m.images.is_empty() {
                    let mut parts = vec![json!({"type": "text", "text": m.content})];
                    parts.extend(
                        m.images
                            .iter()
                            .map(|url| json!({"type": "image_url", "image_url": {"url": url}})),
                    );
                    msg["content"] = json!(parts);
                }

                if let Some(ref tool_calls) = m.tool_calls {
                    msg["tool_calls"] = json!(
                        tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments
                                    }
                                })
                            })
                            .collect::<Vec<_>>()
                    );
                }

                if let Some(ref tool_call_id) = m.tool_call_id {
                    msg["tool_call_id"] = json!(tool_call_id);
                }

                msg
            }))
            .collect()
    }
}

impl ProviderSpec for OpenAiCompatible {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn default_config(&self) -> ProviderConfig {
        ProviderConfig {
            base_url: self.base_url.to_string(),
            api_key: String::new(),
            model: self.model.to_string(),
        }
    }

    fn build_request(
        &self,
        config: &ProviderConfig,
        system_prompt: Option<&str>,
        messages: &[Message],
        tools: &[ToolDescriptor],
        stream: bool,
    ) -> ProviderRequest {
        let mut body = json!({
            "model": config.model,
            "messages": self.format_messages(system_prompt, messages),
            "stream": stream
        });
        if !tools.is_empty() {
            body["tools"] = json!(self.format_tools(tools));
        }

        ProviderRequest {
            method: Method::POST,
            url: join_url(&config.base_url, self.chat_path),
            headers: json_headers(&config.api_key),
            body: Some(body),
            stream,
        }
    }

    fn stream_parser(&self) -> Box<dyn StreamParser> {
        Box::new(OpenAiStreamParser)
    }

    fn models_request(&self, config: &ProviderConfig) -> ProviderRequest {
        ProviderRequest {
            method: Method::GET,
            url: join_url(&config.base_url, self.models_path),
            headers: json_headers(&config.api_key),
            body: None,
            stream: false,
        }
    }

    fn parse_models(&self, body: &Value) -> Vec<String> {
        body["data"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parses `choices[0].delta` chunks, or `choices[0].message` when the
/// response was not streamed.
pub struct OpenAiStreamParser;

impl StreamParser for OpenAiStreamParser {
    fn parse(&mut self, event: &Value) -> Result<ChatDelta, ProviderError> {
        if event["type"].as_str() == Some("ping") {
            return Ok(ChatDelta::default());
        }
        if let Some(message) = error_message(event) {
            let err = classify_error(None, &message);
            if err.is_tools_unsupported() {
                return Err(err);
            }
            warn!("Provider error event: {}", message);
            return Ok(ChatDelta::default());
        }

        let choice = &event["choices"][0];
        let delta = match choice.get("delta") {
            Some(delta) => delta,
            None => &choice["message"],
        };

        let tool_calls = delta["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .enumerate()
                    .map(|(position, tc)| ToolCallDelta {
                        index: tc["index"]
                            .as_u64()
                            .and_then(|i| u32::try_from(i).ok())
                            .unwrap_or(position as u32),
                        id: tc["id"].as_str().map(str::to_string),
                        name: tc["function"]["name"].as_str().map(str::to_string),
                        arguments: match &tc["function"]["arguments"] {
                            Value::Null => None,
                            Value::String(s) => Some(s.clone()),
                            other => Some(other.to_string()),
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ChatDelta {
            content: non_empty(&delta["content"]),
            reasoning: non_empty(&delta["reasoning_content"]).or_else(|| non_empty(&delta["reasoning"])),
            tool_calls,
        })
    }
}

fn non_empty(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

// Ollama

/// Drop the docstring `Args:` block from a tool description. The schema
/// already carries each parameter, so `- name: ...` lines only cost tokens.
fn compact_description(description: &str, parameters: &Value) -> String {
    let mut text = description.replace("Args:", "");
    if let Some(props) = parameters["properties"].as_object() {
        for name in props.keys() {
            let marker = format!("- {}: ", name);
            let Some(start) = text.find(&marker) else {
                continue;
            };
            if let Some(len) = text[start..].find('\n') {
                text.replace_range(start..=start + len, "");
            }
        }
    }
    text.replace('\n', "")
        .split(' ')
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ollama's native chat API: NDJSON stream, complete tool calls per line.
pub struct Ollama;

impl Ollama {
    /// Ollama rejects `title` keys in parameter schemas.
    fn strip_titles(parameters: &Value) -> Value {
        let mut parameters = parameters.clone();
        if let Some(obj) = parameters.as_object_mut() {
            obj.remove("title");
            if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
                for prop in props.values_mut() {
                    if let Some(prop) = prop.as_object_mut() {
                        prop.remove("title");
                    }
                }
            }
        }
        parameters
    }

    fn format_messages(&self, system_prompt: Option<&str>, messages: &[Message]) -> Vec<Value> {
        let system = system_prompt.map(|p| json!({"role": "system", "content": p}));

        system
            .into_iter()
            .chain(messages.iter().map(|m| {
                let mut msg = json!({
                    "role": m.role.as_str(),
                    "content": m.content
                });

                if let Some(ref tool_calls) = m.tool_calls {
                    // Ollama expects arguments as an object, not a string
                    msg["tool_calls"] = json!(
                        tool_calls
                            .iter()
                            .map(|tc| {
                                let arguments: Value =
                                    serde_json::from_str(&tc.arguments).unwrap_or_else(|_| json!({}));
                                json!({"function": {"name": tc.name, "arguments": arguments}})
                            })
                            .collect::<Vec<_>>()
                    );
                }

                if let Some(ref name) = m.name {
                    msg["name"] = json!(name);
                }

                if !m.images.is_empty() {
                    let raw: Vec<&str> = m
                        .images
                        .iter()
                        .map(|url| url.split_once("base64,").map_or(url.as_str(), |(_, data)| data))
                        .collect();
                    msg["images"] = json!(raw);
                }

                msg
            }))
            .collect()
    }
}

impl ProviderSpec for Ollama {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn default_config(&self) -> ProviderConfig {
        ProviderConfig {
            base_url: "http://localhost:11434".to_string(),
            api_key: String::new(),
            model: "qwen2.5".to_string(),
        }
    }

    fn build_request(
        &self,
        config: &ProviderConfig,
        system_prompt: Option<&str>,
        messages: &[Message],
        tools: &[ToolDescriptor],
        stream: bool,
    ) -> ProviderRequest {
        let mut body = json!({
            "model": config.model,
            "messages": self.format_messages(system_prompt, messages),
            "stream": stream
        });
        if !tools.is_empty() {
            body["tools"] = json!(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": Self::strip_titles(&t.parameters)
                            }
                        })
                    })
                    .collect::<Vec<_>>()
            );
        }

        ProviderRequest {
            method: Method::POST,
            url: join_url(&config.base_url, "/api/chat"),
            headers: json_headers(&config.api_key),
            body: Some(body),
            stream,
        }
    }

    fn stream_parser(&self) -> Box<dyn StreamParser> {
        Box::new(OllamaStreamParser::default())
    }

    fn models_request(&self, config: &ProviderConfig) -> ProviderRequest {
        ProviderRequest {
            method: Method::GET,
            url: join_url(&config.base_url, "/api/tags"),
            headers: json_headers(&config.api_key),
            body: None,
            stream: false,
        }
    }

    fn parse_models(&self, body: &Value) -> Vec<String> {
        body["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Ollama sends each tool call whole, without an index; calls are numbered
/// in arrival order so they stay distinct within a round.
#[derive(Default)]
pub struct OllamaStreamParser {
    next_index: u32,
}

impl StreamParser for OllamaStreamParser {
    fn parse(&mut self, event: &Value) -> Result<ChatDelta, ProviderError> {
        if let Some(message) = event["error"].as_str() {
            let err = classify_error(None, message);
            if err.is_tools_unsupported() {
                return Err(err);
            }
            warn!("Ollama error: {}", message);
            return Ok(ChatDelta::default());
        }

        let message = &event["message"];
        let mut tool_calls = Vec::new();
        for tc in message["tool_calls"].as_array().into_iter().flatten() {
            let function = &tc["function"];
            let Some(name) = function["name"].as_str().filter(|n| !n.is_empty()) else {
                continue;
            };
            let arguments = match &function["arguments"] {
                Value::Null => "{}".to_string(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            tool_calls.push(ToolCallDelta {
                index: self.next_index,
                id: tc["id"].as_str().map(str::to_string),
                name: Some(name.to_string()),
                arguments: Some(arguments),
            });
            self.next_index += 1;
        }

        Ok(ChatDelta {
            content: non_empty(&message["content"]),
            reasoning: non_empty(&message["thinking"]),
            tool_calls,
        })
    }
}

// Transport

/// Sends provider requests. Abstracted so the agent loop can be driven by
/// scripted responses in tests.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a chat request and return the response body as lines.
    async fn open_stream(&self, request: &ProviderRequest) -> Result<LineStream, ProviderError>;

    /// Send a request and parse the whole body as JSON.
    async fn fetch_json(&self, request: &ProviderRequest) -> Result<Value, ProviderError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    async fn send(&self, request: &ProviderRequest) -> Result<reqwest::Response, ProviderError> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(ref body) = request.body {
            debug!("{} {}: {}", request.method, request.url, body);
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(Some(status.as_u16()), &body));
        }
        Ok(response)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open_stream(&self, request: &ProviderRequest) -> Result<LineStream, ProviderError> {
        let response = self.send(request).await?;

        if request.stream {
            Ok(split_lines(response.bytes_stream()))
        } else {
            // A non-streamed body is one event, whatever its line breaks
            let body = response.text().await?;
            Ok(Box::pin(futures::stream::once(async move { Ok(body) })))
        }
    }

    async fn fetch_json(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }
}
