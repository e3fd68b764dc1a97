use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use automation_sync::config::{load_config, Config};
use automation_sync::engine::Engine;
use automation_sync::mode::Mode;
use automation_sync::repo::Repo;
use automation_sync::transport::HttpTransport;

/// Sync automation objects between a management server and a git repository.
#[derive(Parser)]
#[command(name = "autosync", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "autosync.toml", global = true)]
    config: PathBuf,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Decrease log verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    quiet: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the repository and populate it from the server
    Init,

    /// Send changes committed since the last sync to the server
    Push {
        /// Sync these files even if change detection would skip them
        paths: Vec<String>,

        /// Also retry objects whose previous sync failed
        #[arg(long)]
        retry_errors: bool,

        /// Report what would be done without touching the server or the repo
        #[arg(long)]
        dry_run: bool,
    },

    /// Compare the repository with the server and report discrepancies
    Check {
        /// Only inspect local repository state, skip the server
        #[arg(long)]
        local_only: bool,
    },

    /// Print a file's content, optionally rebuilt from the server's state
    Cat {
        path: String,

        /// Fetch the current server version instead of the committed one
        #[arg(long)]
        api: bool,
    },

    /// Print the sync annotation a file resolves to
    ShowMetadata { path: String },

    /// Re-derive a file's server id from its unique attributes
    Relink {
        path: String,

        /// Report the outcome without rewriting the annotation
        #[arg(long)]
        dry_run: bool,
    },

    /// Download one object into the repository and commit it
    Fetch {
        path: String,

        /// Server id to fetch; required for files not yet in the repository
        #[arg(long)]
        id: Option<i64>,

        /// Allow replacing a file linked to a different server id
        #[arg(long)]
        overwrite: bool,
    },
}

fn init_logging(verbose: u8, quiet: u8) {
    // info is the baseline; each -v/-q moves one level
    let level = match 2 + verbose as i16 - quiet as i16 {
        i16::MIN..=0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn open_engine(config: Config, mode: Mode) -> Result<Engine> {
    let repo = Repo::open(&config.repo.root, &config.repo.branch, mode)?;
    let transport = HttpTransport::new(&config.remote)?;
    Ok(Engine::new(config, repo, Box::new(transport), mode))
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    match cli.command {
        Command::Init => {
            let repo = Repo::init_empty(&config.repo.root, &config.repo.branch, Mode::Live)?;
            let transport = HttpTransport::new(&config.remote)?;
            Engine::new(config, repo, Box::new(transport), Mode::Live).export()
        }
        Command::Push {
            paths,
            retry_errors,
            dry_run,
        } => {
            let engine = open_engine(config, Mode::from_dry_run(dry_run))?;
            if paths.is_empty() {
                engine.push(retry_errors)
            } else {
                engine.force_push(&paths)
            }
        }
        Command::Check { local_only } => {
            let engine = open_engine(config, Mode::Live)?;
            let (in_sync, problems) = engine.check(local_only)?;
            if !in_sync {
                warn!("{problems} problem(s) found");
                std::process::exit(2);
            }
            Ok(())
        }
        Command::Cat { path, api } => {
            let engine = open_engine(config, Mode::Live)?;
            print!("{}", engine.cat(&path, api)?);
            Ok(())
        }
        Command::ShowMetadata { path } => {
            let engine = open_engine(config, Mode::Live)?;
            println!("{}", engine.show_metadata(&path)?);
            Ok(())
        }
        Command::Relink { path, dry_run } => {
            open_engine(config, Mode::from_dry_run(dry_run))?.relink(&path)
        }
        Command::Fetch {
            path,
            id,
            overwrite,
        } => open_engine(config, Mode::Live)?.fetch(&path, id, overwrite),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    if let Err(err) = run(cli) {
        error!("{err:#}");
        std::process::exit(1);
    }
}
