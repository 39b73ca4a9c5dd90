use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{ConfigLoader, CONFIG_ENV, DATA_ENV};
use crate::persistence::SqliteNoteStore;
use crate::storage;

pub mod commands;

use self::commands::{AttachArgs, DeleteArgs, EditArgs, ListArgs, NewArgs, NoteArgs};

#[derive(Parser, Debug)]
#[command(
    name = "notedraft",
    version,
    about = "Rich-text notes with debounced autosave"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the config file location (takes precedence over NOTEDRAFT_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over NOTEDRAFT_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Act as this user instead of identity.user from the config
    #[arg(long)]
    pub user: Option<String>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new note
    New(NewArgs),
    /// List your notes, newest first
    List(ListArgs),
    /// Print a single note
    Show(NoteArgs),
    /// Delete a note and its images
    Delete(DeleteArgs),
    /// Upload an image and append it to a note
    Attach(AttachArgs),
    /// Edit a note line by line with autosave
    Edit(EditArgs),
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var(CONFIG_ENV, path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var(DATA_ENV, path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let mut config = loader.load_or_init()?;
    if let Some(user) = cli.user.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        config.identity.user = user.to_string();
    }
    let storage = storage::init(&paths, &config.storage, config.limits)?;
    let store = SqliteNoteStore::new(storage, config.identity.owner());

    match cli.command {
        Commands::New(args) => commands::new_note(&store, args).await,
        Commands::List(args) => commands::list_notes(&store, args).await,
        Commands::Show(args) => commands::show_note(&store, args).await,
        Commands::Delete(args) => commands::delete_note(&store, &config, args).await,
        Commands::Attach(args) => commands::attach_image(&store, &config, args).await,
        Commands::Edit(args) => commands::edit_note(&store, &config, args).await,
    }
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
