//! StudyHub CLI - a command-line client for the StudyHub learning platform.
//!
//! Signs in, keeps the session alive across invocations, and lets you issue
//! authenticated requests against the platform API.

mod commands;

use std::io;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use studyhub_core::{Config, Session};

const USAGE: &str = "\
Usage: studyhub <command> [args]

Commands:
  login [username]                 Sign in (prompts for the password)
  logout                           Sign out and revoke the session
  whoami                           Show the signed-in user
  get <path>                       GET a path relative to the API base URL
  request <METHOD> <path> [json]   Send any request with an optional JSON body";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let mut config = Config::load().context("Failed to load configuration")?;
    let store = config
        .credential_store()
        .context("Failed to open credential store")?;
    let session = Session::from_config(&config, store).context("Failed to create API client")?;
    let mut events = session.subscribe();

    let state = session.initialize();
    info!(?state, base_url = %config.base_url, "Session initialized");

    let result = match command.as_str() {
        "login" => commands::login(&session, &mut config, args.get(1).cloned()).await,
        "logout" => commands::logout(&session).await,
        "whoami" => commands::whoami(&session),
        "get" => match args.get(1) {
            Some(path) => commands::request(&session, "GET", path, None).await,
            None => Err(anyhow::anyhow!("Missing path\n\n{}", USAGE)),
        },
        "request" => match (args.get(1), args.get(2)) {
            (Some(method), Some(path)) => {
                commands::request(&session, method, path, args.get(3).map(String::as_str)).await
            }
            _ => Err(anyhow::anyhow!("Missing method or path\n\n{}", USAGE)),
        },
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => Err(anyhow::anyhow!("Unknown command: {}\n\n{}", other, USAGE)),
    };

    commands::report_session_events(&mut events);
    result
}
