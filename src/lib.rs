//! Genesis - an LLM agent that drives a single-threaded 3D host through tools
//!
//! This crate provides:
//! - A streaming tool-call agent loop over OpenAI-compatible and Ollama providers
//! - A dispatch bridge that runs host functions on the host's own thread
//! - Per-provider worker threads with command queues and cooperative cancellation
//! - A headless in-memory scene host and, with the `gen` feature, a Bevy host

pub mod agent;
pub mod cli;
pub mod client;
pub mod config;
pub mod dispatch;
#[cfg(feature = "gen")]
pub mod gen3d;
pub mod host;
pub mod paths;
pub mod tools;

pub use config::Config;
