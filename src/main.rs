//! ea-license - session console for the Expert Advisor license dashboard
//!
//! Signs in against the dashboard's identity provider, keeps the session
//! fresh, and talks to the license API on the user's behalf.

mod api;
mod auth;
mod commands;
mod config;
mod models;
mod session;
mod storage;
mod watch;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commands::App;

#[derive(Parser)]
#[command(name = "ea-license")]
#[command(about = "Session console for the EA license dashboard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default settings file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Sign in with email and password
    Login {
        /// Account email (prompted if omitted)
        #[arg(short, long)]
        email: Option<String>,

        /// Page to continue to afterwards (the login page's returnUrl)
        #[arg(long)]
        return_url: Option<String>,
    },

    /// Sign out and clear stored credentials
    Logout,

    /// Show current session status
    Status,

    /// Show the signed-in user
    Whoami,

    /// Print a valid access token, refreshing it if needed
    Token,

    /// Show what a dashboard route renders for the current session
    Check {
        /// Route path, e.g. /admin/licenses
        path: String,

        /// Role every protected route requires (admin always passes)
        #[arg(long)]
        role: Option<String>,
    },

    /// GET a license API path and print the JSON response
    Api {
        /// Path under api_base_url, e.g. /licenses
        path: String,
    },

    /// Keep the session open, re-checking it when the terminal regains focus
    Watch {
        /// Route to re-render on every session change
        #[arg(short, long, default_value = "/")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let command = match cli.command {
        Commands::Init { force } => return commands::init(cli.config, force),
        command => command,
    };

    let app = App::open(cli.config.as_deref())?;
    let result = match command {
        Commands::Init { .. } => Ok(()),
        Commands::Login { email, return_url } => commands::login(&app, email, return_url).await,
        Commands::Logout => {
            tracing::info!("Logging out...");
            commands::logout(&app)
        }
        Commands::Status => commands::status(&app).await,
        Commands::Whoami => commands::whoami(&app).await,
        Commands::Token => commands::token(&app).await,
        Commands::Check { path, role } => commands::check(&app, &path, role).await,
        Commands::Api { path } => commands::api(&app, &path).await,
        Commands::Watch { path } => commands::watch(&app, &path).await,
    };

    app.session.shutdown();
    result
}
