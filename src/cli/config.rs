use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::Config;
use crate::paths::Paths;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub fn run(args: ConfigArgs, paths: Paths) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(paths, &format),
        ConfigCommands::Path => {
            println!("{}", paths.config_file().display());
            Ok(())
        }
        ConfigCommands::Init { force } => init_config(paths, force),
    }
}

fn show_config(paths: Paths, format: &str) -> Result<()> {
    let mut config = Config::load_from(paths)?;
    redact_keys(&mut config);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        _ => println!("{}", toml::to_string_pretty(&config)?),
    }
    Ok(())
}

fn redact_keys(config: &mut Config) {
    for settings in config.providers.values_mut() {
        if let Some(ref mut key) = settings.api_key
            && !key.is_empty()
        {
            *key = "***".to_string();
        }
    }
}

fn init_config(paths: Paths, force: bool) -> Result<()> {
    let path = paths.config_file();
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    let config = Config {
        paths,
        ..Config::default()
    };
    config.save_with_template()?;
    Ok(())
}
