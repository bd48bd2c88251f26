//! Token command implementation.
//!
//! Logs in and fetches one access token without opening a socket, which is
//! enough to check an account and the service endpoints.

use super::ServiceArgs;
use replicast_engine::{HttpAuthenticator, HttpClient, SessionAuthenticator};
use replicast_protocol::AccessToken;
use serde::Serialize;

/// Outcome of a login plus one refresh.
#[derive(Debug, Serialize)]
pub struct TokenReport {
    /// Login endpoint.
    pub login_url: String,
    /// Refresh endpoint.
    pub refresh_url: String,
    /// Cookies captured at login.
    pub cookies: usize,
    /// Whether the refresh returned a token.
    pub token_found: bool,
    /// Token length in characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_length: Option<usize>,
    /// Leading characters of the token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_preview: Option<String>,
}

/// Runs the token command.
pub async fn run(args: &ServiceArgs, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.replica_config(false)?;
    let authenticator = args.authenticator(&config)?;
    let report = fetch(&authenticator, &args.credentials()?).await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => print_text_output(&report),
    }
    Ok(())
}

/// Logs in and refreshes once.
pub async fn fetch<C: HttpClient>(
    authenticator: &HttpAuthenticator<C>,
    credentials: &replicast_engine::LoginCredentials,
) -> replicast_engine::EngineResult<TokenReport> {
    let session = authenticator.login(credentials).await?;
    let token = authenticator.refresh_access_token(&session).await?;

    Ok(TokenReport {
        login_url: authenticator.login_url().to_string(),
        refresh_url: authenticator.refresh_url().to_string(),
        cookies: session.cookie_count(),
        token_found: token.is_some(),
        token_length: token.as_ref().map(AccessToken::len),
        token_preview: token.as_ref().map(AccessToken::preview),
    })
}

fn print_text_output(report: &TokenReport) {
    println!("Replicast Token Check");
    println!("=====================");
    println!();
    println!("Login:   {}", report.login_url);
    println!("Refresh: {}", report.refresh_url);
    println!("Cookies: {}", report.cookies);
    println!();
    match (report.token_length, &report.token_preview) {
        (Some(length), Some(preview)) => {
            println!("Access token: {preview} ({length} characters)");
        }
        _ => println!("Access token: not found"),
    }
}
