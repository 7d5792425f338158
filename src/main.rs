//! webpad - browser code pad with a live streaming terminal.
//!
//! Usage:
//!   webpad serve [--port 5000] [--data-dir .] [--python python3] [--retention-days 7]

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use webpad::cleanup;
use webpad::http_server;
use webpad::state::{AppState, Config};
use webpad::store::Store;

#[derive(Parser, Debug)]
#[command(name = "webpad")]
#[command(about = "Browser code pad with a live streaming terminal")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "5000")]
        port: u16,

        /// Directory holding the database, code files and virtualenv
        #[arg(long, default_value = ".")]
        data_dir: PathBuf,

        /// Interpreter used to run saved files and create the virtualenv
        #[arg(long, default_value = "python3")]
        python: String,

        /// Materialized files older than this many days are swept
        #[arg(long, default_value = "7")]
        retention_days: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    match args.command {
        Commands::Serve {
            port,
            data_dir,
            python,
            retention_days,
        } => {
            let config = Arc::new(Config {
                data_dir,
                python,
                retention_days,
            });
            ensure_venv(&config).await;

            let store = match Store::open(config.db_path()) {
                Ok(store) => store,
                Err(e) => {
                    eprintln!("Error: failed to open database: {e}");
                    std::process::exit(1);
                }
            };
            info!(db = %config.db_path().display(), "database ready");

            let state = AppState::new(config.clone(), store);
            tokio::spawn(cleanup::run_periodic(config));
            http_server::run_server(port, state).await;
        }
    }
}

/// Create the Python virtual environment on first start. A failure is
/// logged and the server falls back to the bare interpreter.
async fn ensure_venv(config: &Config) {
    if config.venv_dir().exists() {
        return;
    }
    info!(python = %config.python, "creating virtual environment");
    match tokio::process::Command::new(&config.python)
        .arg("-m")
        .arg("venv")
        .arg(config.venv_dir())
        .status()
        .await
    {
        Ok(status) if status.success() => info!("virtual environment created"),
        Ok(status) => warn!(code = ?status.code(), "venv creation failed"),
        Err(e) => warn!(error = %e, "could not launch interpreter for venv creation"),
    }
}
