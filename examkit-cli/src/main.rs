//! examkit CLI
//!
//! Command-line client for the examkit service. Signs in, issues
//! authenticated requests and inspects the stored session.
//!
//! # Usage
//!
//! ```bash
//! # Store the tokens returned by the login endpoint
//! examkit login --access-token eyJ... --refresh-token 3f9c...
//!
//! # Call the API; credentials are renewed as needed
//! examkit request GET exams?page=1
//!
//! # Show the current session
//! examkit status --format json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use examkit_core::{
    ApiClient, CredentialPair, NewSession, RenewalPath, SecretStore, SessionEvent, codec,
    create_store,
};
use reqwest::Method;
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "examkit")]
#[command(about = "Command-line client for the examkit exam-preparation service")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the API base URL
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a new session from login, registration or OAuth credentials
    Login {
        /// Access token issued by the server
        #[arg(long, required_unless_present = "response", conflicts_with = "response")]
        access_token: Option<String>,

        /// Refresh token issued alongside the access token
        #[arg(long)]
        refresh_token: Option<String>,

        /// User profile as JSON
        #[arg(long)]
        user: Option<String>,

        /// File holding the raw JSON body of a login response
        #[arg(long)]
        response: Option<PathBuf>,
    },

    /// Show the stored session
    Status {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Send a request through the authenticated pipeline
    Request {
        /// HTTP method (GET, POST, ...)
        method: String,

        /// Path relative to the base URL, or an absolute URL
        path: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Renew the credentials now; a failure ends the session
    Refresh,

    /// Decode a token's claims without contacting the server
    Inspect {
        /// The token to decode
        token: String,
    },

    /// Set the preferred response language
    Locale {
        /// Language tag, e.g. en, ru, uz
        tag: String,
    },

    /// Remove the stored session
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(cli.config.as_deref())?;
    if let Some(base_url) = cli.base_url {
        config.client.base_url = base_url;
    }

    init_logging(&config.client.log_level, cli.verbose);
    info!("Loaded configuration from {:?}", config.config_path);

    run(cli.command, &config).await
}

async fn run(command: Commands, config: &CliConfig) -> Result<()> {
    match command {
        Commands::Login {
            access_token,
            refresh_token,
            user,
            response,
        } => {
            let client = build_client(config)?;
            login(&client, access_token, refresh_token, user, response).await
        }
        Commands::Status { format } => status(&build_client(config)?, format).await,
        Commands::Request { method, path, data } => {
            request(&build_client(config)?, &method, &path, data.as_deref()).await
        }
        Commands::Refresh => refresh(&build_client(config)?).await,
        Commands::Inspect { token } => inspect(&token, config),
        Commands::Locale { tag } => set_locale(&build_client(config)?, &tag).await,
        Commands::Logout => logout(&build_client(config)?).await,
    }
}

fn init_logging(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_client(config: &CliConfig) -> Result<ApiClient> {
    let data_dir = config.data_dir();
    let store: Arc<dyn SecretStore> = create_store(config.client.store, &data_dir)
        .with_context(|| format!("Failed to open session store in {:?}", data_dir))?
        .into();

    ApiClient::builder(config.client.clone())
        .store(store)
        .build()
        .context("Failed to build API client")
}

async fn login(
    client: &ApiClient,
    access_token: Option<String>,
    refresh_token: Option<String>,
    user: Option<String>,
    response: Option<PathBuf>,
) -> Result<()> {
    let session = match (response, access_token) {
        (Some(path), _) => {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {:?}", path))?;
            let body: Value = serde_json::from_str(&contents)
                .with_context(|| format!("{:?} is not valid JSON", path))?;
            NewSession::from_response(&body)
                .with_context(|| format!("No accessToken found in {:?}", path))?
        }
        (None, Some(access_token)) => {
            let mut credentials = CredentialPair::new(access_token);
            if let Some(refresh_token) = refresh_token {
                credentials = credentials.with_refresh_token(refresh_token);
            }
            let mut session = NewSession::new(credentials);
            if let Some(user) = user {
                let user: Value =
                    serde_json::from_str(&user).context("--user is not valid JSON")?;
                session = session.with_user(user);
            }
            session
        }
        (None, None) => bail!("either --access-token or --response is required"),
    };

    client.session().establish(session).await?;
    println!("Signed in");
    Ok(())
}

async fn status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let snapshot = client.session().snapshot().await?;
    let locale = client.session().locale().await?;

    match format {
        OutputFormat::Json => {
            let out = match &snapshot {
                Some(session) => json!({
                    "logged_in": true,
                    "expires_at": session.expires_at.map(|t| t.to_rfc3339()),
                    "has_refresh_token": session.credentials.refresh_token.is_some(),
                    "user": session.user,
                    "locale": locale,
                }),
                None => json!({ "logged_in": false, "locale": locale }),
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => match snapshot {
            Some(session) => {
                println!("Signed in");
                if let Some(expires_at) = session.expires_at {
                    println!("  Expires: {}", expires_at.to_rfc3339());
                }
                println!(
                    "  Refresh token: {}",
                    if session.credentials.refresh_token.is_some() {
                        "present"
                    } else {
                        "none"
                    }
                );
                if let Some(user) = session.user {
                    println!("  User: {}", user);
                }
                if let Some(locale) = locale {
                    println!("  Locale: {}", locale);
                }
            }
            None => println!("Not signed in"),
        },
    }
    Ok(())
}

async fn request(client: &ApiClient, method: &str, path: &str, data: Option<&str>) -> Result<()> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method {:?}", method))?;

    let mut builder = client.request(method, path);
    if let Some(data) = data {
        let body: Value = serde_json::from_str(data).context("--data is not valid JSON")?;
        builder = builder.json(&body);
    }

    let mut events = client.events().subscribe();
    let outcome = client.send(builder).await;

    while let Ok(event) = events.try_recv() {
        report_event(&event);
    }

    let response = outcome?;
    eprintln!("{}", response.status());
    let text = response.text().await?;
    match serde_json::from_str::<Value>(&text) {
        Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
        Err(_) => println!("{}", text),
    }
    Ok(())
}

fn report_event(event: &SessionEvent) {
    match event {
        SessionEvent::ForcedLogout => eprintln!("Session ended, sign in again"),
        SessionEvent::ApiError(e) => match &e.url {
            Some(url) => eprintln!("{:?}: {} ({})", e.kind, e.message, url),
            None => eprintln!("{:?}: {}", e.kind, e.message),
        },
    }
}

async fn refresh(client: &ApiClient) -> Result<()> {
    client
        .coordinator()
        .renew(RenewalPath::Reactive)
        .await
        .context("Renewal failed")?;
    println!("Credentials renewed");
    Ok(())
}

fn inspect(token: &str, config: &CliConfig) -> Result<()> {
    let Some(claims) = codec::decode_claims(token) else {
        bail!("Not a decodable token");
    };

    println!("{}", serde_json::to_string_pretty(&claims)?);
    match codec::decode_expiry(token) {
        Some(expiry) => {
            println!("Expires: {}", expiry.to_rfc3339());
            if codec::is_expiring_soon(token, config.client.renewal_horizon()) {
                println!("Within the renewal horizon");
            }
        }
        None => println!("Expiry unknown"),
    }
    Ok(())
}

async fn set_locale(client: &ApiClient, tag: &str) -> Result<()> {
    client.session().set_locale(tag).await?;
    println!("Locale set to {}", tag);
    Ok(())
}

async fn logout(client: &ApiClient) -> Result<()> {
    if client.logout().await? {
        println!("Signed out");
    } else {
        println!("Not signed in");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use examkit_core::StoreBackend;
    use tempfile::TempDir;

    fn file_backed_config(dir: &TempDir) -> CliConfig {
        let mut config = CliConfig::default();
        config.client.store = StoreBackend::File;
        config.data_dir = Some(dir.path().to_path_buf());
        config
    }

    #[test]
    fn test_cli_parses_request() {
        let cli = Cli::try_parse_from([
            "examkit",
            "--base-url",
            "https://exams.example.com/api",
            "request",
            "post",
            "attempts",
            "--data",
            r#"{"examId":1}"#,
        ])
        .unwrap();

        assert_eq!(cli.base_url.as_deref(), Some("https://exams.example.com/api"));
        assert!(matches!(cli.command, Commands::Request { ref method, .. } if method == "post"));
    }

    #[test]
    fn test_login_requires_credentials() {
        assert!(Cli::try_parse_from(["examkit", "login"]).is_err());
        assert!(
            Cli::try_parse_from([
                "examkit",
                "login",
                "--access-token",
                "a",
                "--response",
                "body.json"
            ])
            .is_err()
        );
    }

    #[tokio::test]
    async fn test_session_survives_between_invocations() {
        let dir = TempDir::new().unwrap();
        let config = file_backed_config(&dir);

        let first = build_client(&config).unwrap();
        login(
            &first,
            Some("a1".into()),
            Some("r1".into()),
            Some(r#"{"name":"Ada"}"#.into()),
            None,
        )
        .await
        .unwrap();
        drop(first);

        let second = build_client(&config).unwrap();
        let snapshot = second.session().snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.credentials.access_token.expose(), "a1");
        assert_eq!(snapshot.user.unwrap()["name"], "Ada");

        logout(&second).await.unwrap();
        assert!(!second.session().is_logged_in().await.unwrap());
    }

    #[tokio::test]
    async fn test_login_from_response_file() {
        let dir = TempDir::new().unwrap();
        let body = dir.path().join("login.json");
        std::fs::write(
            &body,
            r#"{"data":{"accessToken":"a2","refreshToken":"r2","user":{"id":3}}}"#,
        )
        .unwrap();
        let client = build_client(&file_backed_config(&dir)).unwrap();

        login(&client, None, None, None, Some(body)).await.unwrap();

        let session = client.session();
        assert_eq!(session.refresh_token().await.unwrap().unwrap().expose(), "r2");
        assert_eq!(session.user().await.unwrap().unwrap()["id"], 3);
    }
}
