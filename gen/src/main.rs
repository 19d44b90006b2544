use anyhow::Result;
use clap::Parser;

use genesis::cli::gen3d::GenArgs;
use genesis::paths::Paths;

/// Genesis Gen: an LLM agent driving a Bevy 3D scene
#[derive(Parser)]
#[command(name = "genesis-gen", version)]
struct Args {
    /// Initial prompt to send (optional)
    prompt: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Provider to use (overrides config)
    #[arg(short, long, env = "GENESIS_PROVIDER")]
    provider: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let paths = Paths::resolve()?;
    paths.ensure_dirs()?;
    let mut config = genesis::Config::load_from(paths)?;
    if let Some(provider) = args.provider {
        let kind: genesis::agent::ProviderKind = provider.parse()?;
        config.agent.provider = kind.as_str().to_string();
    }

    // Initialize logging before handing off to Bevy
    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    // Bevy must own the main thread
    genesis::cli::gen3d::run(
        GenArgs {
            prompt: args.prompt,
        },
        config,
    )
}
