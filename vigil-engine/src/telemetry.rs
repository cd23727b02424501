//! Tracing subscriber setup.

use shared::config::{LogFormat, LoggingConfig};
use tracing::{Subscriber, level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, MakeWriter},
};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Logs go to stderr so
/// command output on stdout stays machine-readable.
///
/// # Errors
/// Returns an error if a global subscriber is already installed.
pub fn initialize_tracing(config: &LoggingConfig) -> Result<(), SetGlobalDefaultError> {
    tracing::subscriber::set_global_default(subscriber_with_writer(config, std::io::stderr))
}

pub(crate) fn subscriber_with_writer<W>(config: &LoggingConfig, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let builder = fmt::fmt()
        .with_env_filter(build_env_filter(config))
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(writer);

    if matches!(config.format, LogFormat::Json) {
        Box::new(builder.json().with_ansi(false).finish())
    } else {
        Box::new(builder.with_ansi(false).finish())
    }
}

fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    let default_level = config.level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}
