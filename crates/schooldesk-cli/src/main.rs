//! schooldesk - command-line front end for the school administration
//! console session.
//!
//! Logs in against the backend, keeps the session between runs, and lets
//! you make authenticated requests the same way the console does.

mod commands;

use std::io;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use schooldesk_core::config::API_URL_ENV;

#[derive(Parser)]
#[command(name = "schooldesk")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Backend base URL, e.g. http://localhost:5000/api/v1
    #[arg(long, global = true, env = API_URL_ENV)]
    pub api_url: Option<String>,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Log in and keep the session for later commands
    Login {
        #[arg(short, long, env = commands::USERNAME_ENV)]
        username: Option<String>,
    },

    /// End the session and forget stored credentials
    Logout,

    /// Show the logged-in user
    Whoami,

    /// Show session state and token expiry
    Status,

    /// Make an authenticated GET request and print the response
    Get {
        /// Path relative to the base URL, e.g. /estudiantes/
        path: String,

        /// Run the route guard for this console view first
        #[arg(long, value_name = "VIEW")]
        open: Option<String>,

        /// Query parameters as key=value
        #[arg(short, long = "query", value_name = "KEY=VALUE")]
        query: Vec<String>,
    },

    /// Change the logged-in user's password
    ChangePassword,
}

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    init_tracing();
    info!("schooldesk starting");

    let ctx = commands::Context::new(cli.api_url.as_deref(), cli.json)?;
    match cli.command {
        Command::Login { username } => commands::login(&ctx, username).await,
        Command::Logout => commands::logout(&ctx),
        Command::Whoami => commands::whoami(&ctx).await,
        Command::Status => commands::status(&ctx).await,
        Command::Get { path, open, query } => commands::get(&ctx, &path, open.as_deref(), &query).await,
        Command::ChangePassword => commands::change_password(&ctx).await,
    }
}
