//! Terminal rendering of worker events.

use std::io::{self, Write};

use crate::agent::AgentEvent;
use crate::client::WorkerEvent;

const MAX_TOOL_OUTPUT: usize = 200;

/// Prints worker events as they arrive. Streamed text goes to stdout,
/// tool activity and failures to stderr.
#[derive(Default)]
pub struct EventPrinter {
    show_reasoning: bool,
    mid_line: bool,
}

impl EventPrinter {
    pub fn new(show_reasoning: bool) -> Self {
        Self {
            show_reasoning,
            mid_line: false,
        }
    }

    /// Render one event. Returns true when it ends a command.
    pub fn print(&mut self, event: &WorkerEvent) -> bool {
        match event {
            WorkerEvent::Agent { event, .. } => self.print_agent(event),
            WorkerEvent::CommandFailed {
                provider,
                message,
                tools_unsupported,
            } => {
                self.end_line();
                if *tools_unsupported {
                    eprintln!(
                        "Error: the selected {} model does not support tool calling. \
                         Pick a different model in the config.",
                        provider
                    );
                } else {
                    eprintln!("Error: {}", message);
                }
                true
            }
            WorkerEvent::Stopped(provider) => {
                self.end_line();
                eprintln!("[{} client stopped]", provider);
                false
            }
        }
    }

    fn print_agent(&mut self, event: &AgentEvent) -> bool {
        match event {
            AgentEvent::Content(text) => {
                print!("{}", text);
                let _ = io::stdout().flush();
                self.mid_line = !text.ends_with('\n');
                false
            }
            AgentEvent::Reasoning(text) => {
                if self.show_reasoning {
                    eprint!("{}", text);
                }
                false
            }
            AgentEvent::ToolCallStart {
                name, arguments, ..
            } => {
                self.end_line();
                eprintln!("[tool] {}({})", name, arguments);
                false
            }
            AgentEvent::ToolCallEnd { output, .. } => {
                eprintln!("  -> {}", truncate(output, MAX_TOOL_OUTPUT));
                false
            }
            AgentEvent::Done(_) => {
                self.end_line();
                true
            }
        }
    }

    fn end_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}
