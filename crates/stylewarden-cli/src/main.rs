//! Stylewarden CLI: entry point.

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use url::Url;

use stylewarden_cli::commands;
use stylewarden_cli::output;
use stylewarden_cli::Workspace;

#[derive(Parser)]
#[command(
    name = "stylewarden",
    about = "Keep a remote stylesheet applied to pages that keep dropping it",
    version
)]
struct Cli {
    /// State directory (defaults to $STYLEWARDEN_HOME or ~/.stylewarden).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Site registry file (defaults to $STYLEWARDEN_SITES or <home>/sites.json).
    #[arg(long, global = true)]
    sites: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a page in Chromium and keep its site stylesheet applied until Ctrl-C.
    Run {
        /// Page to open.
        url: Url,

        /// Site id (default: matched from the page host).
        #[arg(long)]
        site: Option<String>,

        /// Run Chromium without a window.
        #[arg(long)]
        headless: bool,

        /// Apply once into an in-memory document instead of a browser.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the fetch pipeline for a site and print every attempt.
    Fetch {
        /// Site id.
        site: String,
    },

    /// Show configured sites, their enabled flag and cache.
    Status,

    /// Enable a site.
    Enable { site: String },

    /// Disable a site.
    Disable { site: String },

    /// Manage the payload cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   stylewarden completions bash > ~/.local/share/bash-completion/completions/stylewarden
    ///   stylewarden completions zsh > ~/.zfunc/_stylewarden
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Drop cached payloads (one site, or all).
    Clear { site: Option<String> },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Returns `Ok(false)` when the command ran but did not succeed.
async fn dispatch(cli: Cli) -> anyhow::Result<bool> {
    let ws = Workspace::resolve(cli.home.as_deref(), cli.sites.as_deref());
    let json = cli.json;

    match cli.command {
        Commands::Run {
            url,
            site,
            headless,
            dry_run,
        } => {
            let snapshot = if dry_run {
                commands::dry_run(&ws, &url, site.as_deref()).await?
            } else {
                commands::run(&ws, &url, site.as_deref(), headless, json).await?
            };
            if json {
                output::print_json(&snapshot)?;
            } else {
                print!("{}", output::render_snapshot(&snapshot));
            }
            Ok(snapshot.state == stylewarden::ApplicationState::Applied)
        }

        Commands::Fetch { site } => {
            let report = commands::fetch(&ws, &site).await?;
            if json {
                output::print_json(&report)?;
            } else {
                print!("{}", output::render_fetch(&report));
            }
            Ok(report.succeeded())
        }

        Commands::Status => {
            let sites = commands::status(&ws)?;
            if json {
                output::print_json(&sites)?;
            } else {
                print!("{}", output::render_status(&sites));
            }
            Ok(true)
        }

        Commands::Enable { site } => {
            commands::set_enabled(&ws, &site, true)?;
            Ok(true)
        }

        Commands::Disable { site } => {
            commands::set_enabled(&ws, &site, false)?;
            Ok(true)
        }

        Commands::Cache {
            action: CacheAction::Clear { site },
        } => {
            let removed = commands::clear_cache(&ws, site.as_deref())?;
            if json {
                output::print_json(&serde_json::json!({ "removed": removed }))?;
            } else {
                println!("Removed {removed} cache entries");
            }
            Ok(true)
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "stylewarden", &mut std::io::stdout());
            Ok(true)
        }
    }
}
