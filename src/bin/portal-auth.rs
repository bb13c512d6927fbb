//! Command-line driver for the portal session authenticator.
//!
//! The session lives in a JSON file, so the redirect round trip can span
//! invocations:
//!
//! ```bash
//! portal-auth login --page https://gis.example.org/garage-sales/index.html
//! # open the printed URL, sign in, copy the callback URL from the browser
//! portal-auth complete 'https://gis.example.org/garage-sales/callback.html?code=...&state=...'
//! portal-auth status
//! portal-auth get https://www.arcgis.com/sharing/rest/portals/self
//! ```
//!
//! Configuration comes from `PORTAL_*` environment variables
//! (see [`AuthConfig::from_env`]).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portal_auth::{
    ApiRequest, AuthConfig, AuthEvent, Authenticator, CallbackParams, EventKind, JsonFileStorage,
    PortalClient, SignIn,
};
use tracing_subscriber::{EnvFilter, fmt};
use url::Url;

/// Sign in to a GIS portal with OAuth2 PKCE.
#[derive(Parser)]
#[command(name = "portal-auth")]
#[command(about = "OAuth2 PKCE sign-in for GIS portal editors", long_about = None)]
struct Cli {
    /// File holding the session and any pending sign-in
    #[arg(long, env = "PORTAL_AUTH_STATE", default_value = ".portal-auth-session.json")]
    state_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a sign-in and print the authorization URL.
    Login {
        /// Page the sign-in starts from; the callback is resolved next to it
        #[arg(long)]
        page: Url,
    },

    /// Finish a sign-in from the callback URL, then validate the profile.
    Complete {
        /// Full callback URL including `code` and `state`
        callback_url: Url,
    },

    /// Show whether a valid session exists.
    Status,

    /// Print the access token (exit code 1 if not signed in).
    Token,

    /// Refresh and print the portal profile.
    Whoami,

    /// Call a portal REST resource with the session token and print the reply.
    Get {
        /// Resource URL, e.g. `https://www.arcgis.com/sharing/rest/portals/self`
        url: Url,

        /// Extra query parameter as `key=value` (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Discard the session.
    Logout,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

type PortalAuthenticator = Authenticator<JsonFileStorage, PortalClient>;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("warn"))?;
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    let config = AuthConfig::from_env().context("loading portal configuration")?;
    let storage = JsonFileStorage::open(&cli.state_file)
        .with_context(|| format!("opening {}", cli.state_file.display()))?;
    let auth = Authenticator::portal(config, storage)?;

    auth.on(EventKind::Error, |event| {
        if let AuthEvent::Error { kind, message } = event {
            tracing::debug!(?kind, %message, "Auth error event");
        }
    });

    run(&auth, cli.command).await
}

async fn run(auth: &PortalAuthenticator, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Login { page } => match auth.begin_sign_in(&page)? {
            SignIn::AlreadySignedIn(user) => {
                println!(
                    "Already signed in as {}",
                    user.display_name().unwrap_or("unknown user")
                );
            }
            SignIn::Redirect(url) => {
                println!("Open this URL to sign in:\n{url}");
            }
        },
        Commands::Complete { callback_url } => {
            let done = auth
                .complete_sign_in(CallbackParams::from_url(&callback_url))
                .await?;
            let profile = auth.who_am_i().await?;
            println!(
                "Signed in as {}",
                profile
                    .full_name
                    .as_deref()
                    .or(done.user.username.as_deref())
                    .unwrap_or("unknown user")
            );
            println!("Return to: {}", done.return_url);
        }
        Commands::Status => match auth.get_user_info() {
            Some(user) if auth.is_signed_in() => {
                println!("Signed in");
                println!("{}", serde_json::to_string_pretty(&user)?);
            }
            Some(_) => {
                println!("Session present but organization not validated; run `whoami`");
                return Ok(ExitCode::FAILURE);
            }
            None => {
                println!("Not signed in");
                return Ok(ExitCode::FAILURE);
            }
        },
        Commands::Token => match auth.get_token() {
            Some(token) => println!("{token}"),
            None => return Ok(ExitCode::FAILURE),
        },
        Commands::Whoami => {
            let profile = auth.who_am_i().await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        Commands::Get { url, params } => {
            let request = params
                .into_iter()
                .fold(ApiRequest::get(url), |request, (k, v)| request.param(k, v));
            let response = auth.authenticated_request(&request).await?;
            println!("{}", response.body);
            if !(200..300).contains(&response.status) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Logout => {
            auth.sign_out()?;
            println!("Signed out");
        }
    }
    Ok(ExitCode::SUCCESS)
}
