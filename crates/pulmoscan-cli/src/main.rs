//! PulmoScan CLI - command-line access to a PulmoScan Pro session.

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pulmoscan_session::{
    ApiError, Config, GuardDecision, RequestSpec, Role, SessionEvent, SessionManager,
};

#[derive(Parser)]
#[command(name = "pulmoscan", version, about = "PulmoScan Pro session client")]
struct Cli {
    /// Override the API base URL from the config file
    #[arg(long, env = "PULMOSCAN_API_BASE_URL", global = true)]
    api: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and persist the session
    Login {
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Show the signed-in user
    Whoami {
        /// Fail unless the user holds one of these roles (comma-separated)
        #[arg(long = "role", value_delimiter = ',')]
        roles: Vec<Role>,
    },
    /// End the session and revoke the refresh token
    Logout,
    /// Send an authorized GET request and print the JSON response
    Get {
        /// Path relative to the API base, e.g. `medicines/`
        path: String,
    },
    /// Send an authorized POST request with a JSON body
    Post {
        /// Path relative to the API base
        path: String,
        /// JSON request body, e.g. `{"name": "Salbutamol"}`
        body: String,
    },
    /// Keep the session fresh in the background until Ctrl-C
    Watch,
}

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // RUST_LOG controls the level (e.g. RUST_LOG=pulmoscan_session=debug)
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
    init_tracing();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(api) = cli.api {
        config.api_base_url = api;
        config.validate()?;
    }
    let storage = config.open_storage()?;
    let session = SessionManager::new(&config, storage)?;
    info!(api = %config.api_base_url, "PulmoScan CLI starting");

    match cli.command {
        Command::Login { username } => login(&session, &mut config, username).await,
        Command::Whoami { roles } => whoami(&session, &roles).await,
        Command::Logout => {
            session.logout().await;
            println!("Logged out.");
            Ok(())
        }
        Command::Get { path } => send(&session, RequestSpec::get(path)).await,
        Command::Post { path, body } => {
            let body = serde_json::from_str(&body).context("Request body is not valid JSON")?;
            send(&session, RequestSpec::post(path).json(body)).await
        }
        Command::Watch => watch(&session).await,
    }
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{}", label);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn login(session: &SessionManager, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username {
        Some(u) => u,
        None => match config.last_username.as_deref() {
            Some(last) => {
                let entered = prompt(&format!("Username [{}]: ", last))?;
                if entered.is_empty() {
                    last.to_string()
                } else {
                    entered
                }
            }
            None => prompt("Username: ")?,
        },
    };
    if username.is_empty() {
        bail!("A username is required");
    }
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

    let outcome = session.login(&username, &password).await;
    if !outcome.success {
        bail!(outcome.error.unwrap_or_else(|| "Login failed".to_string()));
    }

    config.last_username = Some(username);
    config.save()?;

    match session.current_user() {
        Some(user) => println!("Logged in as {} ({}).", user.username, user.role),
        None => println!("Logged in."),
    }
    Ok(())
}

async fn whoami(session: &SessionManager, roles: &[Role]) -> Result<()> {
    let Some(user) = session.bootstrap().await else {
        bail!("Not logged in");
    };
    println!("{}", serde_json::to_string_pretty(&user)?);

    if !roles.is_empty() && session.guard(roles) != GuardDecision::Permit {
        bail!("{} is not permitted (role: {})", user.username, user.role);
    }
    Ok(())
}

async fn send(session: &SessionManager, spec: RequestSpec) -> Result<()> {
    let body: serde_json::Value = match session.client().send_json(spec).await {
        Ok(body) => body,
        Err(e) if e.is_session_ending() => {
            bail!("{}. Run `pulmoscan login` to start a new session.", e)
        }
        Err(ApiError::Forbidden(_)) => bail!("Your role does not allow this request"),
        Err(e) => return Err(e.into()),
    };
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn watch(session: &SessionManager) -> Result<()> {
    let Some(user) = session.bootstrap().await else {
        bail!("Not logged in");
    };
    println!("Keeping session for {} fresh. Press Ctrl-C to stop.", user.username);

    let mut events = session.events();
    let renewal = session.start_renewal();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Refreshed) => println!("Session refreshed."),
                Ok(SessionEvent::Expired { reason }) => {
                    println!("Session expired: {}", reason);
                    break;
                }
                Ok(SessionEvent::LoggedOut) => break,
                Ok(SessionEvent::LoggedIn { .. }) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    renewal.shutdown();
    Ok(())
}
