//! FileDist CLI - operator interface to the local artifact store.
//!
//! Provides store inspection (`list`, `verify`) and a direct fetch against
//! HTTP artifact servers (`fetch`).

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "filedist", version, about = "Content-addressed artifact distribution")]
struct Cli {
    /// Root directory of the local artifact store.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List artifacts present in the local store.
    List {
        /// Emit machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Check every artifact in the store and report corruption.
    Verify,

    /// Download an artifact from one or more servers into the store.
    Fetch {
        /// Content fingerprint of the artifact.
        fingerprint: String,

        /// Server base URL; repeat for failover (tried round-robin).
        #[arg(long = "server", required = true)]
        servers: Vec<String>,

        /// Overall download timeout in seconds.
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,

        /// Sleep between retries in seconds.
        #[arg(long, default_value_t = 10)]
        retry_interval_secs: u64,
    },
}

fn main() {
    filedist::logging::init("info");
    let cli = Cli::parse();
    let dir = cli.dir.unwrap_or_else(default_store_dir);

    let result = match cli.command {
        Command::List { json } => commands::list::run(&dir, json),
        Command::Verify => commands::verify::run(&dir),
        Command::Fetch {
            fingerprint,
            servers,
            timeout_secs,
            retry_interval_secs,
        } => commands::fetch::run(
            &dir,
            &fingerprint,
            &servers,
            timeout_secs,
            retry_interval_secs,
        ),
    };

    if let Err(error) = result {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

/// Documented fallback store location: `<platform data dir>/filedist/store`.
fn default_store_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("filedist")
        .join("store")
}
