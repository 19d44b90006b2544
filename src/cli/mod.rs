pub mod ask;
pub mod chat;
pub mod config;
#[cfg(feature = "gen")]
pub mod gen3d;
pub mod models;
pub mod render;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::agent::{HttpTransport, ProviderKind};
use crate::client::{ClientRegistry, WorkerEvent};
use crate::config::Config;
use crate::dispatch::{HostQueue, dispatch_channel};
use crate::host::scene::{self, MemoryScene};
use crate::paths::Paths;
use crate::tools::HostToolCatalog;

#[derive(Parser)]
#[command(name = "genesis")]
#[command(author, version, about = "LLM tool-calling agent for 3D scenes")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration directory (holds config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Provider to use (overrides config): openai, deepseek, siliconflow, openrouter, oneapi, ollama
    #[arg(short, long, global = true, env = "GENESIS_PROVIDER")]
    pub provider: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive chat session
    Chat(chat::ChatArgs),

    /// Run a single command against the scene
    Ask(ask::AskArgs),

    /// List the models a provider offers
    Models,

    /// Configuration management
    Config(config::ConfigArgs),

    /// Launch the Bevy 3D host
    #[cfg(feature = "gen")]
    Gen(gen3d::GenArgs),
}

impl Cli {
    pub fn paths(&self) -> Result<Paths> {
        let mut paths = Paths::resolve()?;
        if let Some(ref dir) = self.config {
            paths.config_dir = PathBuf::from(dir);
        }
        Ok(paths)
    }

    /// Load the config, applying command-line overrides.
    pub fn load_config(&self, paths: Paths) -> Result<Config> {
        paths.ensure_dirs()?;
        let mut config = Config::load_from(paths)?;
        if let Some(ref provider) = self.provider {
            let kind: ProviderKind = provider.parse()?;
            config.agent.provider = kind.as_str().to_string();
        }
        Ok(config)
    }

    /// Log filter used when RUST_LOG is unset.
    pub fn log_level(&self, config: Option<&Config>) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            config
                .map(|c| c.logging.level.clone())
                .unwrap_or_else(|| "info".to_string())
        }
    }
}

/// Everything a headless scene session needs, wired together.
pub struct SceneSession {
    pub registry: Arc<ClientRegistry>,
    pub catalog: Arc<HostToolCatalog<MemoryScene>>,
    pub queue: HostQueue<MemoryScene>,
    pub events: Receiver<WorkerEvent>,
}

impl SceneSession {
    pub fn new(config: Config) -> Self {
        let (dispatcher, queue) = dispatch_channel();
        let dispatcher = dispatcher.with_timeout(config.dispatch_timeout());

        let catalog = Arc::new(HostToolCatalog::new(dispatcher));
        for package in scene::packages() {
            catalog.register(package);
        }
        for name in &config.tools.disabled_packages {
            catalog.set_enabled(name, false);
        }

        let (tx, events) = mpsc::channel();
        let registry = ClientRegistry::new(
            config,
            catalog.clone(),
            Arc::new(HttpTransport::default()),
        )
        .with_events(tx);

        Self {
            registry: Arc::new(registry),
            catalog,
            queue,
            events,
        }
    }
}
