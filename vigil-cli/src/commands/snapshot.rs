use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use engine::{HttpStack, LocationStore};
use shared::{config::Config, models::ActiveView};

use super::render::print_view;

#[derive(Args, Debug)]
pub struct SnapshotArgs {
    /// Scope (role) to fetch; defaults to the configured role
    #[arg(long, short)]
    pub scope: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Fetches one snapshot and prints its active, deduplicated records.
///
/// # Errors
/// Returns an error if the snapshot cannot be fetched.
pub async fn snapshot(config: Config, args: &SnapshotArgs) -> Result<()> {
    let scope = args.scope.clone().unwrap_or_else(|| config.identity.role.clone());
    let stack = HttpStack::from_config(&config).context("failed to initialise the engine")?;

    let patches = stack
        .snapshot_fetcher()
        .fetch(&scope)
        .await
        .with_context(|| format!("failed to fetch snapshot for scope '{scope}'"))?;

    let mut store = LocationStore::new(config.reconciler.staleness_policy()?);
    for patch in patches {
        store.merge(patch);
    }
    let now = Utc::now();
    let view = ActiveView {
        scope,
        records: store.active_snapshot(now),
        computed_at: Some(now),
    };
    print_view(&view, args.json, now)
}
