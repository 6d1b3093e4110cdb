//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};

use hearth_config::{ConfigSearch, HearthConfig, ProviderConfig};

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: Option<ConfigCommand>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the resolved configuration as TOML (default)
    Show,

    /// Show which config locations are searched and which one is used
    Which,

    /// Write a starter config file
    Init {
        /// Create project-local config (./hearth.toml) instead of user config
        #[arg(long)]
        local: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command.unwrap_or(ConfigCommand::Show) {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Init { local, force } => cmd_init(local, force),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;
    match loaded.source {
        Some(ref path) => println!("# Loaded from {}", path.display()),
        None => println!("# No config file found, using defaults"),
    }
    print!("{}", loaded.config.redacted().to_toml()?);
    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    let search = ConfigSearch::from_env(ctx.config_path.as_deref());
    let mut used = false;
    for path in search.candidates() {
        let marker = if !used && path.is_file() {
            used = true;
            "*"
        } else if path.is_file() {
            "+"
        } else {
            " "
        };
        println!("{} {}", marker, path.display());
    }
    if !used {
        println!("No config file found, using defaults");
    }
    Ok(())
}

fn cmd_init(local: bool, force: bool) -> Result<()> {
    let path = if local {
        PathBuf::from("hearth.toml")
    } else {
        match hearth_config::user_config_dir() {
            Some(dir) => dir.join("config.toml"),
            None => bail!("could not determine the user config directory"),
        }
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let mut config = HearthConfig::new();
    config.llm.primary = Some(
        ProviderConfig::new("openai")
            .with_model("gpt-4o-mini")
            .with_api_key_env("OPENAI_API_KEY"),
    );
    hearth_config::save_config(&config, &path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
