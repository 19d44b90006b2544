use anyhow::Result;
use clap::Args;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::runtime::Runtime;

use super::SceneSession;
use super::render::EventPrinter;
use crate::agent::ProviderKind;
use crate::client::ClientRegistry;
use crate::config::Config;
use crate::host::HeadlessHost;
use crate::host::scene::MemoryScene;
use crate::tools::HostToolCatalog;

#[derive(Args)]
pub struct ChatArgs {
    /// Print model reasoning as it streams
    #[arg(long)]
    pub reasoning: bool,
}

/// Interactive session. The main thread is the host thread: it drains the
/// dispatch queue and renders worker events each tick, while a separate
/// input thread reads lines and feeds the current client.
pub fn run(args: ChatArgs, config: Config) -> Result<()> {
    let tick = config.tick_interval();
    let history_path = config.paths.chat_history();
    let provider = config.provider_kind()?;

    let session = SceneSession::new(config);
    let registry = session.registry.clone();
    registry.switch(provider)?;

    println!(
        "Genesis v{} | Provider: {}\n",
        env!("CARGO_PKG_VERSION"),
        provider
    );
    println!("Type /help for commands, /quit to exit\n");

    let shutdown = Arc::new(AtomicBool::new(false));
    let busy = Arc::new(AtomicBool::new(false));

    let input = {
        let registry = registry.clone();
        let catalog = session.catalog.clone();
        let busy = busy.clone();
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("genesis-input".into())
            .spawn(move || {
                let result = input_loop(&registry, &catalog, &busy, history_path);
                shutdown.store(true, Ordering::SeqCst);
                result
            })?
    };

    let mut host = HeadlessHost::new(MemoryScene::starter(), session.queue, tick);
    {
        let events = session.events;
        let busy = busy.clone();
        let mut printer = EventPrinter::new(args.reasoning);
        host.add_tick_hook(move |_scene: &mut MemoryScene| {
            while let Ok(event) = events.try_recv() {
                if printer.print(&event) {
                    busy.store(false, Ordering::SeqCst);
                }
            }
        });
    }
    host.run(&shutdown);

    // Workers are not joined: one may be blocked in a network read
    registry.stop_all();

    match input.join() {
        Ok(result) => result,
        Err(_) => anyhow::bail!("Input thread panicked"),
    }
}

fn input_loop(
    registry: &ClientRegistry,
    catalog: &HostToolCatalog<MemoryScene>,
    busy: &AtomicBool,
    history_path: PathBuf,
) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    // Only used to watch for Ctrl+C while a command runs
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    loop {
        wait_until_idle(&rt, registry, busy);

        let input = match rl.readline("You: ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        };

        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(input);

        if input.starts_with('/') {
            match handle_command(input, registry, catalog) {
                CommandResult::Continue => continue,
                CommandResult::Quit => break,
                CommandResult::Error(e) => {
                    eprintln!("Error: {}", e);
                    continue;
                }
            }
        }

        let submitted = registry.current().and_then(|client| {
            busy.store(true, Ordering::SeqCst);
            client.submit(input)
        });
        if let Err(e) = submitted {
            busy.store(false, Ordering::SeqCst);
            eprintln!("Error: {}", e);
        }
    }

    if let Some(parent) = history_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = rl.save_history(&history_path);
    Ok(())
}

/// Block while a command runs. Ctrl+C skips it.
fn wait_until_idle(rt: &Runtime, registry: &ClientRegistry, busy: &AtomicBool) {
    if !busy.load(Ordering::SeqCst) {
        return;
    }
    rt.block_on(async {
        while busy.load(Ordering::SeqCst) {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if signal.is_ok() {
                        eprintln!("^C (skipping current command)");
                        skip_all(registry);
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    });
}

fn skip_all(registry: &ClientRegistry) {
    for kind in registry.live_kinds() {
        if let Some(client) = registry.get(kind) {
            client.skip_current();
        }
    }
}

enum CommandResult {
    Continue,
    Quit,
    Error(String),
}

fn handle_command(
    input: &str,
    registry: &ClientRegistry,
    catalog: &HostToolCatalog<MemoryScene>,
) -> CommandResult {
    let parts: Vec<&str> = input.split_whitespace().collect();
    let cmd = parts[0];

    match cmd {
        "/quit" | "/exit" | "/q" => CommandResult::Quit,

        "/help" | "/h" | "/?" => {
            println!("\nCommands:");
            println!("  /help               Show this help");
            println!("  /quit               Exit");
            println!("  /skip               Abort the command in flight (or press Ctrl+C)");
            println!("  /clear              Forget the conversation");
            println!("  /provider [name]    Show or switch the provider");
            println!("  /stop               Stop the current provider's worker");
            println!("  /tools              List tool packages");
            println!("  /enable <package>   Offer a tool package to the model");
            println!("  /disable <package>  Hide a tool package from the model");
            println!();
            CommandResult::Continue
        }

        "/skip" => {
            skip_all(registry);
            CommandResult::Continue
        }

        "/clear" => match registry.current() {
            Ok(client) => {
                client.clear_history();
                println!("Conversation cleared.\n");
                CommandResult::Continue
            }
            Err(e) => CommandResult::Error(e.to_string()),
        },

        "/provider" => {
            let Some(name) = parts.get(1) else {
                let live: Vec<&str> = registry.live_kinds().iter().map(|k| k.as_str()).collect();
                println!(
                    "\nProvider: {} (live: {})",
                    registry.config().agent.provider,
                    if live.is_empty() {
                        "none".to_string()
                    } else {
                        live.join(", ")
                    }
                );
                let all: Vec<&str> = ProviderKind::ALL.iter().map(|k| k.as_str()).collect();
                println!("Available: {}\n", all.join(", "));
                return CommandResult::Continue;
            };
            let kind: ProviderKind = match name.parse() {
                Ok(kind) => kind,
                Err(e) => return CommandResult::Error(e.to_string()),
            };
            registry.update_config(|c| c.agent.provider = kind.as_str().to_string());
            match registry.switch(kind) {
                Ok(_) => {
                    println!("Switched to {}\n", kind);
                    CommandResult::Continue
                }
                Err(e) => CommandResult::Error(format!("Failed to switch provider: {}", e)),
            }
        }

        "/stop" => {
            match registry.config().provider_kind() {
                Ok(kind) => {
                    if registry.stop(kind).is_some() {
                        println!("Stopped {}. The next message starts a fresh client.\n", kind);
                    } else {
                        println!("{} is not running.\n", kind);
                    }
                }
                Err(e) => return CommandResult::Error(e.to_string()),
            }
            CommandResult::Continue
        }

        "/tools" => {
            println!("\nTool packages:");
            for (name, enabled) in catalog.packages() {
                println!("  [{}] {}", if enabled { "x" } else { " " }, name);
            }
            println!();
            CommandResult::Continue
        }

        "/enable" | "/disable" => {
            let Some(package) = parts.get(1) else {
                return CommandResult::Error(format!("Usage: {} <package>", cmd));
            };
            if !catalog.packages().iter().any(|(name, _)| name == package) {
                return CommandResult::Error(format!("Unknown tool package: {}", package));
            }
            let enabled = cmd == "/enable";
            catalog.set_enabled(package, enabled);
            println!(
                "{} {}\n",
                if enabled { "Enabled" } else { "Disabled" },
                package
            );
            CommandResult::Continue
        }

        _ => CommandResult::Error(format!("Unknown command: {}. Type /help", cmd)),
    }
}
