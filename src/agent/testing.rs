//! Scripted stand-ins for the network and the tool catalog.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{ChatTransport, LineStream, ProviderError, ProviderRequest};
use crate::tools::{ToolCatalog, ToolContent, ToolDescriptor};

/// One step of a scripted response body.
pub enum Step {
    Line(String),
    /// Runs when the stream reaches this point
    Call(Box<dyn FnOnce() + Send>),
}

pub enum Reply {
    Lines(Vec<Step>),
    Status(u16, String),
}

/// Transport that replays queued replies, one per request.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_lines(&self, lines: Vec<String>) -> &Self {
        self.push(Reply::Lines(lines.into_iter().map(Step::Line).collect()))
    }

    pub fn push(&self, reply: Reply) -> &Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn open_stream(&self, request: &ProviderRequest) -> Result<LineStream, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::Lines(vec![Step::Line(done())]));

        match reply {
            Reply::Status(status, body) => Err(super::classify_error(Some(status), &body)),
            Reply::Lines(steps) => Ok(Box::pin(async_stream::stream! {
                for step in steps {
                    match step {
                        Step::Line(line) => yield Ok(line),
                        Step::Call(f) => f(),
                    }
                }
            })),
        }
    }

    async fn fetch_json(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(json!({"data": [{"id": "scripted-model"}]}))
    }
}

pub fn sse(chunk: Value) -> String {
    format!("data: {}", chunk)
}

pub fn text_chunk(text: &str) -> String {
    sse(json!({"choices": [{"index": 0, "delta": {"content": text}}]}))
}

pub fn call_open(index: u32, id: &str, name: &str) -> String {
    sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
        {"index": index, "id": id, "type": "function", "function": {"name": name, "arguments": ""}}
    ]}}]}))
}

pub fn call_args(index: u32, fragment: &str) -> String {
    sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
        {"index": index, "function": {"arguments": fragment}}
    ]}}]}))
}

pub fn done() -> String {
    "data: [DONE]".to_string()
}

/// Catalog that records invocations and answers from a fixed table.
#[derive(Default)]
pub struct RecordingCatalog {
    tools: Vec<ToolDescriptor>,
    responses: HashMap<String, Vec<ToolContent>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl RecordingCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, name: &str, response: Vec<ToolContent>) -> Self {
        self.tools.push(ToolDescriptor {
            name: name.to_string(),
            description: format!("{} tool", name),
            parameters: json!({"type": "object", "properties": {}}),
        });
        self.responses.insert(name.to_string(), response);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolCatalog for RecordingCatalog {
    fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }

    async fn invoke(&self, name: &str, arguments: Value) -> Vec<ToolContent> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments));
        self.responses
            .get(name)
            .cloned()
            .unwrap_or_else(|| vec![ToolContent::error(format!("Unknown tool: {}", name))])
    }
}
