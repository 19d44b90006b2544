//! Per-round assembly of streamed tool calls.
//!
//! Providers stream a tool call as a name followed by argument fragments,
//! keyed by a wire index. Calls for different indices may interleave. A call
//! becomes ready the moment its buffer parses as a JSON object, so it can
//! run while the rest of the stream is still arriving.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use super::providers::ToolCallDelta;

/// A tool call that has been opened but not yet executed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    pending: HashMap<u32, PendingToolCall>,
    /// Indices in the order they were opened.
    opened: Vec<u32>,
    executed: HashSet<u32>,
    last_opened: Option<u32>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything. Called at the start of every round.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.opened.clear();
        self.executed.clear();
        self.last_opened = None;
    }

    /// Feed one delta. Returns the index if that call just became ready.
    pub fn apply(&mut self, delta: &ToolCallDelta) -> Option<u32> {
        let index = delta.index;
        if self.executed.contains(&index) {
            debug!("Ignoring delta for executed tool call #{}", index);
            return None;
        }

        if let Some(name) = delta.name.as_deref().filter(|n| !n.is_empty())
            && !self.pending.contains_key(&index)
        {
            let id = delta
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            debug!("Tool call #{} opened: {}", index, name);
            self.pending.insert(
                index,
                PendingToolCall {
                    index,
                    id,
                    name: name.to_string(),
                    arguments: String::new(),
                },
            );
            self.opened.push(index);
            self.last_opened = Some(index);
        }

        let Some(call) = self.pending.get_mut(&index) else {
            debug!("Dropping fragment for unopened tool call #{}", index);
            return None;
        };

        match delta.arguments.as_deref() {
            Some(fragment) if !fragment.is_empty() => call.arguments.push_str(fragment),
            _ => return None,
        }

        is_complete(&call.arguments).then_some(index)
    }

    /// Remove a call for execution. Subsequent deltas for it are ignored.
    pub fn take(&mut self, index: u32) -> Option<PendingToolCall> {
        let call = self.pending.remove(&index)?;
        self.executed.insert(index);
        Some(call)
    }

    /// Every opened call that never became ready, in opening order.
    /// Empty buffers are normalised to `{}`.
    pub fn drain_unexecuted(&mut self) -> Vec<PendingToolCall> {
        let order = std::mem::take(&mut self.opened);
        let mut calls = Vec::new();
        for index in order {
            if let Some(mut call) = self.take(index) {
                if call.arguments.trim().is_empty() {
                    call.arguments = "{}".to_string();
                }
                calls.push(call);
            }
        }
        calls
    }

    /// Whether this round opened any tool call at all.
    pub fn opened_any(&self) -> bool {
        self.last_opened.is_some()
    }

    pub fn is_pending(&self, index: u32) -> bool {
        self.pending.contains_key(&index)
    }
}

fn is_complete(arguments: &str) -> bool {
    matches!(serde_json::from_str::<Value>(arguments), Ok(Value::Object(_)))
}
