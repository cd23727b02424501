use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::Args;
use engine::HttpStack;
use shared::config::Config;
use tracing::info;

use super::render::{print_health, print_view};

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Scope (role) to watch; defaults to the configured role
    #[arg(long, short)]
    pub scope: Option<String>,

    /// Identity presented to the realtime channel; defaults to the configured one
    #[arg(long)]
    pub identity: Option<String>,

    /// Print one JSON document per change instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Runs the reconciler for a scope until Ctrl+C or session expiry.
///
/// # Errors
/// Returns an error if the reconciler cannot start or the session expires.
pub async fn watch(mut config: Config, args: &WatchArgs) -> Result<()> {
    if let Some(identity) = &args.identity {
        config.identity.subject_id.clone_from(identity);
    }
    let scope = args.scope.clone().unwrap_or_else(|| config.identity.role.clone());

    let stack = HttpStack::from_config(&config).context("failed to initialise the engine")?;
    let reconciler = stack.reconciler().context("invalid reconciler settings")?;
    reconciler
        .start(&scope)
        .await
        .with_context(|| format!("failed to start watching scope '{scope}'; run `vigil session login` if your session expired"))?;
    info!(scope = %scope, "watching; press Ctrl+C to stop");

    let mut view = reconciler.view();
    let mut health = reconciler.health();
    print_view(&view.borrow_and_update().clone(), args.json, Utc::now())?;
    print_health(*health.borrow_and_update(), args.json)?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            changed = view.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = view.borrow_and_update().clone();
                print_view(&current, args.json, Utc::now())?;
            }
            changed = health.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = *health.borrow_and_update();
                print_health(current, args.json)?;
                if current.is_terminal() {
                    break Err(anyhow!("session expired; run `vigil session login` to continue"));
                }
            }
        }
    };

    reconciler.stop().await;
    outcome
}
