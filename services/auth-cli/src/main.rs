//! School auth command-line host
//!
//! One-shot commands drive the session controller against the configured
//! Supabase project; `serve` keeps a session alive and accepts passive deep
//! links over local HTTP.

mod agent;
mod config;
mod loopback;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use auth_core::{FileCredentialStore, Role, RunMode};
use auth_session::{
    AuthBrowser, AuthSessionController, NoBrowser, Registration, RegistrationDetails,
};
use clap::{Parser, Subcommand};
use common::Secret;
use supabase_backend::SupabaseClient;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::loopback::LoopbackBrowser;

#[derive(Parser)]
#[command(name = "school-auth")]
#[command(about = "Sign in to the school platform and keep the session alive")]
#[command(version)]
struct Cli {
    /// Config file (falls back to CONFIG_PATH, then ./school-auth.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with email and password
    Login { email: String },
    /// Create an account
    Register {
        email: String,
        first_name: String,
        last_name: String,
        #[arg(default_value = "student")]
        role: Role,
        #[arg(long)]
        phone: Option<String>,
    },
    /// Sign out and forget stored credentials
    Logout,
    /// Exchange the stored refresh token for a new pair
    Refresh,
    /// Show the persisted session
    Status,
    /// Sign in through an external provider in the browser
    Oauth { provider: String },
    /// Complete a sign-in from a callback URL
    DeepLink { url: String },
    /// Send a password reset email
    ResetPassword { email: String },
    /// Run the session agent
    Serve,
}

/// Password from SCHOOL_AUTH_PASSWORD, kept out of argv and shell history.
fn password() -> Result<Secret<String>> {
    std::env::var("SCHOOL_AUTH_PASSWORD")
        .map(Secret::new)
        .context("set SCHOOL_AUTH_PASSWORD to the account password")
}

async fn build_controller(
    config: &Config,
    browser: Arc<dyn AuthBrowser>,
) -> Result<Arc<AuthSessionController>> {
    let anon_key = config.anon_key()?.clone();
    let client = Arc::new(
        SupabaseClient::new(&config.supabase.url, anon_key, config.timeout())
            .context("failed to create Supabase client")?,
    );
    let credentials = Arc::new(
        FileCredentialStore::load(config.auth.credentials_path.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to open credential store {}",
                    config.auth.credentials_path.display()
                )
            })?,
    );
    Ok(AuthSessionController::new(
        client.clone(),
        client,
        credentials,
        browser,
        config.controller_config(),
    ))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        supabase_url = %config.supabase.url,
        redirect_url = %config.oauth.run_mode.redirect_url(),
        "configuration loaded"
    );

    let browser: Arc<dyn AuthBrowser> = match config.oauth.run_mode {
        RunMode::Loopback { port } => Arc::new(LoopbackBrowser::new(port, config.browser_timeout())),
        _ => Arc::new(NoBrowser),
    };

    // Install the recorder before the controller emits anything.
    let prometheus = match cli.command {
        Command::Serve => Some(metrics::install_recorder().context("failed to install Prometheus recorder")?),
        _ => None,
    };

    let controller = build_controller(&config, browser).await?;

    match cli.command {
        Command::Login { email } => {
            let password = password()?;
            let session = controller.login(&email, password.expose()).await?;
            print_json(&session.user)?;
        }
        Command::Register {
            email,
            first_name,
            last_name,
            role,
            phone,
        } => {
            let password = password()?;
            let details = RegistrationDetails {
                first_name,
                last_name,
                role,
                phone,
            };
            match controller.register(&email, password.expose(), &details).await? {
                Registration::Active(session) => print_json(&session.user)?,
                Registration::ConfirmationPending(user) => {
                    print_json(&user)?;
                    eprintln!("Check {} for a confirmation link before signing in.", user.email);
                }
            }
        }
        Command::Logout => {
            // Installs the stored session so the provider can revoke it.
            let _ = controller.load_persisted_session().await;
            controller.logout().await?;
            eprintln!("Signed out.");
        }
        Command::Refresh => {
            controller
                .load_persisted_session()
                .await
                .context("no usable session to refresh")?;
            let session = controller.refresh().await?;
            print_json(&serde_json::json!({
                "user": session.user,
                "expires_at": session.expires_at,
            }))?;
        }
        Command::Status => {
            if let Err(e) = controller.load_persisted_session().await {
                info!(error = %e, "no session restored");
            }
            print_json(&controller.state().await)?;
        }
        Command::Oauth { provider } => {
            if matches!(config.oauth.run_mode, RunMode::Installed { .. } | RunMode::Development { .. }) {
                bail!("browser sign-in needs oauth mode = \"loopback\"; use deep-link with the callback URL instead");
            }
            let session = controller.oauth_sign_in(&provider).await?;
            print_json(&session.user)?;
        }
        Command::DeepLink { url } => match controller.handle_deep_link(&url).await? {
            Some(session) => print_json(&session.user)?,
            None => bail!("not an auth callback URL: {url}"),
        },
        Command::ResetPassword { email } => {
            controller.forgot_password(&email).await?;
            eprintln!("If {email} has an account, a reset link is on its way.");
        }
        Command::Serve => {
            let prometheus = prometheus.context("Prometheus recorder not installed")?;
            agent::serve(&config, controller, prometheus).await?;
        }
    }

    Ok(())
}
