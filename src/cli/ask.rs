use anyhow::Result;
use clap::Args;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::SceneSession;
use super::render::EventPrinter;
use crate::agent::AgentEvent;
use crate::client::WorkerEvent;
use crate::config::Config;
use crate::host::HeadlessHost;
use crate::host::scene::MemoryScene;

#[derive(Args)]
pub struct AskArgs {
    /// The command to run against the scene
    pub prompt: String,

    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

/// Run one command on the main (host) thread, then shut the worker down.
pub fn run(args: AskArgs, config: Config) -> Result<()> {
    let tick = config.tick_interval();
    let session = SceneSession::new(config);
    let client = session.registry.current()?;
    let provider = client.kind();
    client.submit(&args.prompt)?;

    let json = args.format == "json";
    let shutdown = Arc::new(AtomicBool::new(false));
    let outcome: Rc<RefCell<Option<Result<String, String>>>> = Rc::new(RefCell::new(None));

    let mut host = HeadlessHost::new(MemoryScene::starter(), session.queue, tick);
    {
        let events = session.events;
        let flag = shutdown.clone();
        let outcome = outcome.clone();
        let mut printer = EventPrinter::new(false);
        host.add_tick_hook(move |_scene: &mut MemoryScene| {
            while let Ok(event) = events.try_recv() {
                if !json {
                    printer.print(&event);
                }
                let finished = match event {
                    WorkerEvent::Agent {
                        event: AgentEvent::Done(text),
                        ..
                    } => Some(Ok(text)),
                    WorkerEvent::CommandFailed { message, .. } => Some(Err(message)),
                    _ => None,
                };
                if let Some(result) = finished {
                    *outcome.borrow_mut() = Some(result);
                    flag.store(true, Ordering::SeqCst);
                }
            }
        });
    }
    host.run(&shutdown);

    for handle in session.registry.stop_all() {
        handle.join();
    }

    let result = outcome.borrow_mut().take();
    match result {
        Some(Ok(response)) => {
            if json {
                let scene = host.state();
                let output = serde_json::json!({
                    "prompt": args.prompt,
                    "response": response,
                    "provider": provider.as_str(),
                    "objects": scene.objects(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            Ok(())
        }
        Some(Err(message)) => anyhow::bail!(message),
        None => anyhow::bail!("Command ended without a result"),
    }
}
