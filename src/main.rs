use anyhow::Result;
use clap::Parser;

use genesis::cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = cli.paths()?;
    let early_level = cli.log_level(None);

    // Config commands must work before a config file exists
    if let Commands::Config(args) = cli.command {
        init_logging(&early_level);
        return genesis::cli::config::run(args, paths);
    }

    let config = cli.load_config(paths)?;
    init_logging(&cli.log_level(Some(&config)));

    match cli.command {
        // The main thread is the host thread; workers bring their own runtimes
        Commands::Chat(args) => genesis::cli::chat::run(args, config),
        Commands::Ask(args) => genesis::cli::ask::run(args, config),
        #[cfg(feature = "gen")]
        Commands::Gen(args) => genesis::cli::gen3d::run(args, config),
        Commands::Models => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(genesis::cli::models::run(config)),
        Commands::Config(_) => unreachable!("Config is handled before loading the config"),
    }
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();
}
