use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use engine::HttpStack;
use shared::{config::Config, models::ChannelPhase};
use tokio::time::timeout;

#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Latitude in decimal degrees
    #[arg(long, allow_hyphen_values = true)]
    pub lat: f64,

    /// Longitude in decimal degrees
    #[arg(long, allow_hyphen_values = true)]
    pub lng: f64,

    /// Seconds to wait for the realtime channel
    #[arg(long, default_value_t = 15)]
    pub timeout: u64,
}

/// Publishes the caller's own location over the realtime channel.
///
/// # Errors
/// Returns an error if the channel does not connect in time or the server
/// refuses the update.
pub async fn report(config: Config, args: &ReportArgs) -> Result<()> {
    let stack = HttpStack::from_config(&config).context("failed to initialise the engine")?;
    let channel = stack.channel();
    channel.connect(stack.identity());

    let mut state = channel.watch_state();
    let ready = timeout(
        Duration::from_secs(args.timeout),
        state.wait_for(|state| state.is_connected() || state.auth_failed),
    )
    .await
    .context("timed out waiting for the realtime channel")?
    .context("realtime channel stopped")?
    .clone();
    if ready.auth_failed || ready.phase != ChannelPhase::Connected {
        bail!("session is not valid; run `vigil session login` first");
    }

    let result = channel.publish_location(args.lat, args.lng).await;
    channel.disconnect();
    result.context("failed to report location")?;

    println!("Reported location {:.5}, {:.5}", args.lat, args.lng);
    Ok(())
}
