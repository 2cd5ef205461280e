//! creditdesk - command-line access to the billing/credits admin API.
//!
//! Every call goes through the same authenticated client the admin panel
//! uses, so expired tokens are refreshed transparently and a rejected
//! session is cleared.

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use creditdesk_core::api::{ApiClient, ApiRequest};
use creditdesk_core::auth::{SessionData, SignInNavigator};
use creditdesk_core::Config;
use reqwest::Method;
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directory for rolling log files; unset means stderr only.
const LOG_DIR_ENV: &str = "CREDITDESK_LOG_DIR";

#[derive(Parser)]
#[command(name = "creditdesk", version, about = "Admin API client for the credits platform")]
struct Cli {
    /// Backend base URL (overrides config and CREDITDESK_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a token issued by the sign-in flow
    Login {
        #[arg(long)]
        token: String,
    },
    /// Forget the stored session
    Logout,
    /// Show the stored session (token hidden)
    Session,
    /// Send an authenticated request and print the response
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,
        /// Route below the base URL, e.g. /api/plans
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
        /// Query parameter as key=value, repeatable
        #[arg(long = "query", value_parser = parse_pair)]
        query: Vec<(String, String)>,
    },
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

/// Tells the operator their session is gone and how to get a new one.
struct TerminalNavigator {
    base_url: String,
}

impl SignInNavigator for TerminalNavigator {
    fn navigate_to_sign_in(&self, route: &str) {
        eprintln!(
            "Session ended. Sign in again at {}{} and run `creditdesk login --token <TOKEN>`.",
            self.base_url.trim_end_matches('/'),
            route
        );
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "creditdesk.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _guard = init_tracing();
    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    config.apply_overrides(cli.api_url.clone(), None)?;
    info!(base_url = %config.base_url, backend = ?config.session_backend, "creditdesk starting");

    let store = config.session_store()?;
    let navigator = Arc::new(TerminalNavigator {
        base_url: config.base_url.clone(),
    });
    let api = ApiClient::new(config.client_config(), store, navigator)
        .context("Failed to create API client")?;

    match cli.command {
        Command::Login { token } => login(&api, token),
        Command::Logout => {
            api.logout();
            Ok(())
        }
        Command::Session => show_session(&api),
        Command::Request {
            method,
            path,
            data,
            query,
        } => send_request(&api, &method, path, data, query).await,
    }
}

fn login(api: &ApiClient, token: String) -> Result<()> {
    let token = token.trim().to_string();
    if token.is_empty() {
        anyhow::bail!("Token must not be empty");
    }
    api.session()
        .save(&SessionData::new(token))
        .context("Failed to store session")?;
    println!("Session stored.");
    Ok(())
}

fn show_session(api: &ApiClient) -> Result<()> {
    let Some(data) = api.session().load() else {
        println!("No session stored.");
        return Ok(());
    };

    println!("authenticated: {}", data.is_authenticated);
    println!("token:         {}", if data.bearer().is_some() { "present" } else { "missing" });
    match data.refreshed_minutes_ago() {
        Some(minutes) => println!("refreshed:     {}m ago", minutes),
        None => println!("refreshed:     never"),
    }
    if !data.profile.is_empty() {
        println!("{}", serde_json::to_string_pretty(&data.profile)?);
    }
    Ok(())
}

async fn send_request(
    api: &ApiClient,
    method: &str,
    path: String,
    data: Option<String>,
    query: Vec<(String, String)>,
) -> Result<()> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;

    let mut request = ApiRequest::new(method, path.clone());
    request.query = query;
    if let Some(data) = data {
        let body: Value = serde_json::from_str(&data).context("--data must be valid JSON")?;
        request = request.json(body);
    }

    let response = match api.execute(request).await {
        Ok(response) => response,
        Err(e) => {
            // Same status line as a success, when the server answered.
            if let Some(status) = e.status() {
                eprintln!("{}", status);
            }
            return Err(e).with_context(|| format!("Request to {} failed", path));
        }
    };

    let status = response.status();
    let text = response.text().await.context("Failed to read response body")?;
    eprintln!("{}", status);
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) if !text.is_empty() => println!("{}", text),
        Err(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        assert_eq!(parse_pair("page=2"), Ok(("page".to_string(), "2".to_string())));
        assert_eq!(parse_pair("q=a=b"), Ok(("q".to_string(), "a=b".to_string())));
        assert!(parse_pair("page").is_err());
    }

    #[test]
    fn test_cli_parses_request_command() {
        let cli = Cli::try_parse_from([
            "creditdesk",
            "request",
            "post",
            "/api/coupons",
            "--data",
            r#"{"code":"SAVE10"}"#,
            "--query",
            "notify=false",
        ])
        .unwrap();

        match cli.command {
            Command::Request { method, path, data, query } => {
                assert_eq!(method, "post");
                assert_eq!(path, "/api/coupons");
                assert!(data.is_some());
                assert_eq!(query, vec![("notify".to_string(), "false".to_string())]);
            }
            _ => panic!("expected request command"),
        }
    }
}
