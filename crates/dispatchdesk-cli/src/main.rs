//! dispatchdesk - command-line front end for the dispatch backend session.
//!
//! Logs in, shows who the saved session belongs to, and issues authenticated
//! requests against protected endpoints. The session is persisted between
//! runs by the configured credential backend.

use std::io::{self, Write};

use anyhow::{Context, Result};
use dispatchdesk_core::{ApiError, ApiRequest, Config, SessionClient};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file name prefix in the data directory
const LOG_FILE_PREFIX: &str = "dispatchdesk.log";

/// Set to `1` to also write logs to a daily rolling file
const ENV_LOG_FILE: &str = "DISPATCHDESK_LOG_FILE";

const USAGE: &str = "\
Usage: dispatchdesk <command>

Commands:
  login [username]   Log in (prompts for password)
  logout             End the session, locally and on the server
  whoami             Re-check the session with the server
  status             Show the saved session without contacting the server
  get <path>         Authenticated GET, prints the JSON response
";

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG to control the level (e.g. RUST_LOG=dispatchdesk_core=debug).
/// The returned guard must stay alive for the file writer to flush.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr);

    let file_enabled = std::env::var(ENV_LOG_FILE).map(|v| v == "1").unwrap_or(false);
    let log_dir = config.data_dir().ok().filter(|_| file_enabled);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = Config::load().context("Failed to load configuration")?;
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprint!("{}", USAGE);
        return Ok(());
    };

    let store = config.open_credential_store()?;
    let session = SessionClient::new(&config, store).context("Failed to create HTTP client")?;
    let state = session.restore().await?;
    info!(api_url = %config.api_url, ?state, "dispatchdesk starting");

    let result = match command {
        "login" => login(&session, &config, args.get(1).cloned()).await,
        "logout" => logout(&session).await,
        "whoami" => whoami(&session).await,
        "status" => status(&session).await,
        "get" => match args.get(1) {
            Some(path) => get(&session, path).await,
            None => Err(anyhow::anyhow!("Missing path\n\n{}", USAGE)),
        },
        "help" | "--help" | "-h" => {
            print!("{}", USAGE);
            Ok(())
        }
        other => Err(anyhow::anyhow!("Unknown command '{}'\n\n{}", other, USAGE)),
    };

    if let Err(e) = result {
        if let Some(ApiError::SessionExpired) = e.downcast_ref::<ApiError>() {
            eprintln!("Session expired. Run `dispatchdesk login` to sign in again.");
            std::process::exit(2);
        }
        return Err(e);
    }
    Ok(())
}

async fn login(session: &SessionClient, config: &Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(name) => name,
        None => prompt("Username: ")?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", username))
        .context("Failed to read password")?;

    match session.login(&username, &password).await {
        Ok(user) => {
            println!("Logged in as {}", user.display_name());
            Config::remember_username(&username).context("Failed to save configuration")?;
            Ok(())
        }
        Err(ApiError::InvalidCredentials) => Err(anyhow::anyhow!("Invalid username or password")),
        Err(e) => Err(e.into()),
    }
}

async fn logout(session: &SessionClient) -> Result<()> {
    session.logout().await?;
    println!("Logged out");
    Ok(())
}

async fn whoami(session: &SessionClient) -> Result<()> {
    if session.credentials().await?.is_empty() {
        println!("Not logged in");
        return Ok(());
    }
    let user = session.fetch_identity().await?;
    println!("{} (id {})", user.display_name(), user.id);
    Ok(())
}

async fn status(session: &SessionClient) -> Result<()> {
    let credentials = session.credentials().await?;
    match &credentials.user {
        Some(user) => println!("Logged in as {}", user.display_name()),
        None if credentials.access_token().is_some() => {
            println!("Credentials saved, identity not confirmed")
        }
        None => println!("Not logged in"),
    }
    if !credentials.is_empty() {
        println!("Tokens updated {}", credentials.age_display());
        println!(
            "Refresh credential: {}",
            if credentials.refresh_token().is_some() { "stored" } else { "server cookie or none" }
        );
    }
    Ok(())
}

async fn get(session: &SessionClient, path: &str) -> Result<()> {
    let response = session.api().call(&ApiRequest::get(path)).await?;
    let body: serde_json::Value = response.json().await.context("Response was not JSON")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        anyhow::bail!("No username given");
    }
    Ok(value)
}
