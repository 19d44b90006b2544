//! Tool catalog: the tools the model may call and how a call reaches the host.
//!
//! The agent loop only sees the [`ToolCatalog`] trait. [`HostToolCatalog`]
//! is the host-backed implementation: every tool is a plain function over
//! the host state `H`, grouped into togglable packages, and every invocation
//! is sent through the dispatch bridge so it runs on the host thread.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::dispatch::Dispatcher;

/// Prefix marking a textual tool result as a failure.
pub const ERROR_PREFIX: &str = "Error: ";

/// Decimal places kept for floats in serialised host results.
const RESULT_PRECISION: i32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One item of a tool response.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolContent {
    Text(String),
    /// Base64-encoded image payload
    Image { data: String, mime_type: String },
    Resource(Value),
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::Text(format!("{}{}", ERROR_PREFIX, message))
    }

    /// Errors travel as text starting with "Error", by convention.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Text(t) if t.starts_with("Error"))
    }
}

#[async_trait]
pub trait ToolCatalog: Send + Sync {
    /// Snapshot of the currently available tools.
    fn list_tools(&self) -> Vec<ToolDescriptor>;

    /// Invoke a tool. Failures are reported as [`ToolContent::error`] items.
    async fn invoke(&self, name: &str, arguments: Value) -> Vec<ToolContent>;
}

pub type HostHandler<H> = Arc<dyn Fn(&mut H, Value) -> Result<Value> + Send + Sync>;

/// A host function exposed as a tool.
pub struct HostTool<H> {
    descriptor: ToolDescriptor,
    handler: HostHandler<H>,
}

impl<H> Clone for HostTool<H> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<H> HostTool<H> {
    pub fn new<F>(name: &str, description: &str, parameters: Value, handler: F) -> Self
    where
        F: Fn(&mut H, Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            descriptor: ToolDescriptor {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
            handler: Arc::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }
}

/// A named group of tools that is enabled or disabled as a unit.
pub struct ToolPackage<H> {
    name: String,
    description: String,
    tools: Vec<HostTool<H>>,
}

impl<H> ToolPackage<H> {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            tools: Vec::new(),
        }
    }

    pub fn with_tool(mut self, tool: HostTool<H>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tools(&self) -> &[HostTool<H>] {
        &self.tools
    }
}

/// Catalog of host functions, executed on the host thread via a [`Dispatcher`].
pub struct HostToolCatalog<H> {
    dispatcher: Dispatcher<H>,
    packages: RwLock<Vec<ToolPackage<H>>>,
    disabled: RwLock<HashSet<String>>,
}

impl<H: 'static> HostToolCatalog<H> {
    pub fn new(dispatcher: Dispatcher<H>) -> Self {
        Self {
            dispatcher,
            packages: RwLock::new(Vec::new()),
            disabled: RwLock::new(HashSet::new()),
        }
    }

    /// Add a package. A package with the same name is replaced.
    pub fn register(&self, package: ToolPackage<H>) {
        let mut packages = write_lock(&self.packages);
        packages.retain(|p| p.name != package.name);
        debug!(
            "Registered tool package '{}' ({} tools)",
            package.name,
            package.tools.len()
        );
        packages.push(package);
    }

    pub fn set_enabled(&self, package: &str, enabled: bool) {
        let mut disabled = write_lock(&self.disabled);
        if enabled {
            disabled.remove(package);
        } else {
            disabled.insert(package.to_string());
        }
    }

    pub fn is_enabled(&self, package: &str) -> bool {
        !read_lock(&self.disabled).contains(package)
    }

    /// Package names with their enabled state, in registration order.
    pub fn packages(&self) -> Vec<(String, bool)> {
        let disabled = read_lock(&self.disabled);
        read_lock(&self.packages)
            .iter()
            .map(|p| (p.name.clone(), !disabled.contains(&p.name)))
            .collect()
    }

    fn find(&self, name: &str) -> Option<HostTool<H>> {
        let disabled = read_lock(&self.disabled);
        read_lock(&self.packages)
            .iter()
            .filter(|p| !disabled.contains(&p.name))
            .flat_map(|p| p.tools.iter())
            .find(|t| t.name() == name)
            .cloned()
    }
}

#[async_trait]
impl<H: 'static> ToolCatalog for HostToolCatalog<H> {
    fn list_tools(&self) -> Vec<ToolDescriptor> {
        let disabled = read_lock(&self.disabled);
        read_lock(&self.packages)
            .iter()
            .filter(|p| !disabled.contains(&p.name))
            .flat_map(|p| p.tools.iter().map(|t| t.descriptor.clone()))
            .collect()
    }

    async fn invoke(&self, name: &str, arguments: Value) -> Vec<ToolContent> {
        let Some(tool) = self.find(name) else {
            return vec![ToolContent::error(format!("Unknown tool: {}", name))];
        };

        let handler = tool.handler.clone();
        match self
            .dispatcher
            .call(name, move |host: &mut H| handler(host, arguments))
            .await
        {
            Ok(value) => vec![ToolContent::Text(rounding_dumps(&value, RESULT_PRECISION))],
            Err(e) => {
                warn!("Host error in {}: {}", name, e);
                vec![ToolContent::error(e)]
            }
        }
    }
}

/// Deserialize tool arguments into a typed struct.
pub fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T> {
    serde_json::from_value(arguments).context("invalid arguments")
}

/// Serialise `value` to JSON with every float rounded to `precision` places.
pub fn rounding_dumps(value: &Value, precision: i32) -> String {
    round_floats(value, precision).to_string()
}

fn round_floats(value: &Value, precision: i32) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => {
            let factor = 10f64.powi(precision);
            let rounded = n.as_f64().map(|f| (f * factor).round() / factor);
            rounded
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| round_floats(v, precision)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), round_floats(v, precision)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// A poisoned lock only means another thread panicked mid-update; the
// catalog data itself stays usable.
fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
