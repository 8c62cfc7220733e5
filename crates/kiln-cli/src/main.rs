//! Kiln CLI - install and run sandboxed JavaScript/TypeScript plugins.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln_config::LoadOptions;
use kiln_plugins::InstallOptions;

mod commands;
mod config_bridge;
mod theme;

use commands::{info, install, invoke, list, remove, search};
use theme::Theme;

/// Kiln - sandboxed plugin host
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level filter (overrides config and `KILN_LOG_LEVEL`)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format: pretty, compact, json or full
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Path to a config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Plugin directory (overrides config and `KILN_PLUGIN_DIR`)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a plugin from the registry, a repository or a local path
    Install {
        /// `name[@version]`, `@scope/name`, a git URL (`#ref` allowed) or a path
        source: String,
        /// Skip the TypeScript transform
        #[arg(long)]
        no_transpile: bool,
        /// Skip dependency bundling
        #[arg(long)]
        no_bundle: bool,
        /// Registry version to install
        #[arg(long)]
        version: Option<String>,
    },
    /// List installed plugins
    List {
        /// Also check installed artifacts against the lockfile
        #[arg(long)]
        verify: bool,
    },
    /// Remove an installed plugin and purge its memory
    Remove {
        /// Plugin ID
        name: String,
    },
    /// Search the registry
    Search {
        /// Search terms
        query: String,
        /// Maximum number of results
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show detailed plugin information
    Info {
        /// Plugin ID
        name: String,
    },
    /// Call a tool of an installed plugin
    Invoke {
        /// Plugin ID
        name: String,
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
    /// Send a query to a plugin's skills
    Skill {
        /// Plugin ID
        name: String,
        /// Free-text query
        query: String,
        /// Call this skill instead of matching patterns
        #[arg(long)]
        skill: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let resolved = kiln_config::load(&LoadOptions {
        config_file: cli.config.clone(),
        home_override: None,
    })
    .context("failed to load configuration")?;

    let mut cfg = resolved.config.clone();
    if let Some(level) = &cli.log_level {
        cfg.logging.level.clone_from(level);
    }
    if let Some(format) = &cli.log_format {
        cfg.logging.format.clone_from(format);
    }
    if let Err(e) = kiln_telemetry::setup_logging(&config_bridge::to_log_config(&cfg)) {
        eprintln!("Failed to initialize logging: {e}");
    }
    tracing::debug!(
        files = ?resolved.loaded_files,
        env_overrides = resolved.env_overrides,
        "Configuration loaded"
    );

    let ctx = config_bridge::build_host(&resolved, cli.dir.as_deref())?;
    let host = &ctx.host;

    let outcome = match cli.command {
        Commands::Install {
            source,
            no_transpile,
            no_bundle,
            version,
        } => {
            let options = InstallOptions {
                transpile: !no_transpile,
                bundle: !no_bundle,
                version,
            };
            install::install_plugin(host, &source, &options).await
        },
        Commands::List { verify } => list::list_plugins(host, &ctx.plugin_dir, verify).await,
        Commands::Remove { name } => remove::remove_plugin(host, &name).await,
        Commands::Search { query, limit } => search::search_registry(host, &query, limit).await,
        Commands::Info { name } => info::plugin_info(host, &name).await,
        Commands::Invoke { name, tool, args } => {
            invoke::invoke_tool(host, &name, &tool, args.as_deref()).await
        },
        Commands::Skill { name, query, skill } => {
            invoke::invoke_skill(host, &name, &query, skill.as_deref()).await
        },
    };

    if let Err(e) = &outcome {
        eprintln!("{}", Theme::error(&format!("{e:#}")));
        std::process::exit(1);
    }
    Ok(())
}
