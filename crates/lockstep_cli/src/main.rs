//! Lockstep CLI
//!
//! Command-line front end for Lockstep password databases.
//!
//! # Commands
//!
//! - `list` - Show recently opened files
//! - `open` - Open a database and list its entries
//! - `sync` - Reconcile a database with its backend
//! - `new` - Create a fresh database
//! - `import` - Build a database from a cleartext XML export
//! - `remove-info` - Forget a file and its cached bytes
//! - `clear-key-files` - Strip stored key-file hints

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Lockstep command-line password database tools.
#[derive(Parser)]
#[command(name = "lockstep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Application data directory (registry and cache)
    #[arg(global = true, short, long, default_value = ".lockstep")]
    dir: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show recently opened files
    List,

    /// Open a database and list its entries
    Open {
        /// Display name for the database
        name: String,

        /// Path to the database file
        #[arg(short, long)]
        path: Option<String>,

        /// Master password
        #[arg(short = 'P', long)]
        password: String,

        /// Key file to unlock with
        #[arg(short, long)]
        key_file: Option<PathBuf>,
    },

    /// Reconcile a database with its backend
    Sync {
        /// Name of a previously opened database
        name: String,

        /// Master password
        #[arg(short = 'P', long)]
        password: String,
    },

    /// Create a fresh database
    New {
        /// Display name for the database
        name: String,

        /// Master password
        #[arg(short = 'P', long)]
        password: String,
    },

    /// Build a database from a cleartext XML export
    Import {
        /// Display name for the database
        name: String,

        /// Path to the XML export
        xml: PathBuf,

        /// Master password
        #[arg(short = 'P', long)]
        password: String,
    },

    /// Forget a file and its cached bytes
    RemoveInfo {
        /// Name of the registry record to drop
        name: String,
    },

    /// Strip stored key-file hints from the registry
    ClearKeyFiles,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::List => commands::list::run(&cli.dir)?,
        Commands::Open {
            name,
            path,
            password,
            key_file,
        } => commands::open::run(&cli.dir, &name, path.as_deref(), &password, key_file.as_deref())?,
        Commands::Sync { name, password } => commands::sync::run(&cli.dir, &name, &password)?,
        Commands::New { name, password } => commands::new::run(&cli.dir, &name, &password)?,
        Commands::Import {
            name,
            xml,
            password,
        } => commands::import::run(&cli.dir, &name, &xml, &password)?,
        Commands::RemoveInfo { name } => commands::manage::remove_info(&cli.dir, &name)?,
        Commands::ClearKeyFiles => commands::manage::clear_key_files(&cli.dir)?,
    }

    Ok(())
}
