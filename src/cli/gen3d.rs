//! CLI subcommand for Genesis Gen: Bevy window on the main thread, agent
//! worker in the background.

use anyhow::Result;
use clap::Args;
use std::io::{self, BufRead};
use std::sync::Arc;
use std::sync::mpsc;

use crate::agent::HttpTransport;
use crate::client::ClientRegistry;
use crate::config::Config;
use crate::dispatch::{HostQueue, dispatch_channel};
use crate::gen3d;
use crate::tools::HostToolCatalog;

#[derive(Args)]
pub struct GenArgs {
    /// Initial prompt to send (optional)
    pub prompt: Option<String>,
}

pub fn run(args: GenArgs, config: Config) -> Result<()> {
    let (dispatcher, queue) = dispatch_channel::<bevy::prelude::World>();
    let dispatcher = dispatcher.with_timeout(config.dispatch_timeout());

    let catalog = Arc::new(HostToolCatalog::new(dispatcher));
    catalog.register(gen3d::tools::scene_package());
    for name in &config.tools.disabled_packages {
        catalog.set_enabled(name, false);
    }

    let (tx, events) = mpsc::channel();
    let registry = ClientRegistry::new(config, catalog, Arc::new(HttpTransport::default()))
        .with_events(tx);
    let client = registry.current()?;
    if let Some(prompt) = args.prompt {
        client.submit(&prompt)?;
    }

    // Stdin feeds the worker; the thread is detached so closing the window exits
    std::thread::Builder::new()
        .name("genesis-input".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let line = line.trim();
                match line {
                    "" => continue,
                    "/quit" | "/exit" | "/q" => break,
                    "/skip" => client.skip_current(),
                    "/clear" => client.clear_history(),
                    _ => {
                        if let Err(e) = client.submit(line) {
                            eprintln!("Error: {}", e);
                            break;
                        }
                    }
                }
            }
            registry.stop_all();
        })?;

    run_bevy_app(queue, events)
}

/// Set up and run the Bevy application on the main thread.
fn run_bevy_app(
    queue: HostQueue<bevy::prelude::World>,
    events: mpsc::Receiver<crate::client::WorkerEvent>,
) -> Result<()> {
    use bevy::prelude::*;

    let mut app = App::new();

    app.add_plugins(
        DefaultPlugins
            .set(WindowPlugin {
                primary_window: Some(Window {
                    title: "Genesis Gen".into(),
                    resolution: bevy::window::WindowResolution::new(1280.0, 720.0),
                    ..default()
                }),
                ..default()
            })
            .disable::<bevy::log::LogPlugin>(),
    );

    gen3d::plugin::setup_gen_app(&mut app, queue, events);

    app.run();

    Ok(())
}
