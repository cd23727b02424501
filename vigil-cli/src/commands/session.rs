use anyhow::{Context, Result, bail};
use chrono::{TimeDelta, Utc};
use clap::Subcommand;
use engine::{AccessToken, HttpStack, token::SharedTokenStore};
use shared::config::Config;

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Show whether a usable session token is stored
    Status,

    /// Exchange the stored token for a fresh one
    Refresh,

    /// Store a token issued out of band and revive the session
    Login {
        /// Bearer token issued by the identity provider
        #[arg(long)]
        token: String,

        /// Seconds until the token expires
        #[arg(long, default_value_t = 3_600)]
        expires_in: i64,
    },

    /// Remove the stored session token
    Logout,
}

/// Runs a session subcommand against the shared token file.
///
/// # Errors
/// Returns an error if the token file cannot be written or the refresh fails.
pub async fn run(config: Config, command: &SessionCommand) -> Result<()> {
    let stack = HttpStack::from_config(&config).context("failed to initialise the engine")?;
    match command {
        SessionCommand::Status => status(&stack),
        SessionCommand::Refresh => refresh(&stack).await,
        SessionCommand::Login { token, expires_in } => login(&stack, token, *expires_in).await,
        SessionCommand::Logout => logout(&stack),
    }
}

fn status(stack: &HttpStack) -> Result<()> {
    let path = stack.token_store().path().display();
    let Some(token) = stack.token_store().load() else {
        println!("No session token stored at {path}");
        return Ok(());
    };

    let skew = TimeDelta::seconds(i64::try_from(stack.config().auth.refresh_skew_secs).unwrap_or(0));
    let now = Utc::now();
    if token.is_fresh(now, skew) {
        println!("Session valid until {} ({path})", token.expires_at.to_rfc3339());
    } else if token.expires_at > now {
        println!("Session expires at {}; it will be refreshed on next use ({path})", token.expires_at.to_rfc3339());
    } else {
        println!("Session expired at {}; it will be refreshed on next use ({path})", token.expires_at.to_rfc3339());
    }
    Ok(())
}

async fn refresh(stack: &HttpStack) -> Result<()> {
    let tokens = stack.tokens();
    let Some(current) = stack.token_store().load() else {
        bail!("no active session found; run `vigil session login` first");
    };
    tokens.reject(&current).await;
    let fresh = tokens
        .valid_token()
        .await
        .context("refresh failed; run `vigil session login` to sign in again")?;
    println!("Session refreshed; valid until {}", fresh.expires_at.to_rfc3339());
    Ok(())
}

async fn login(stack: &HttpStack, token: &str, expires_in: i64) -> Result<()> {
    if token.trim().is_empty() {
        bail!("token must not be empty");
    }
    if expires_in <= 0 {
        bail!("--expires-in must be positive");
    }
    let expires_at = TimeDelta::try_seconds(expires_in)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .context("--expires-in is out of range")?;
    stack
        .tokens()
        .reset_session(AccessToken::new(token.trim(), expires_at))
        .await;
    if stack.token_store().load().is_none() {
        bail!(
            "failed to store the session token at {}",
            stack.token_store().path().display()
        );
    }
    println!(
        "Stored session token at {} (valid until {})",
        stack.token_store().path().display(),
        expires_at.to_rfc3339()
    );
    Ok(())
}

fn logout(stack: &HttpStack) -> Result<()> {
    let store = stack.token_store();
    let path = store.path().display();
    if store.load().is_none() {
        println!("No session token found at {path}");
        return Ok(());
    }
    store
        .clear()
        .with_context(|| format!("failed to remove session token {path}"))?;
    println!("Removed session token at {path}");
    Ok(())
}
