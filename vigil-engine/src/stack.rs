//! Assembles the HTTP-backed engine from a resolved [`Config`].

use std::sync::Arc;

use chrono::TimeDelta;
use reqwest::Client;
use shared::{config::Config, errors::ConfigError};
use thiserror::Error;

use crate::{
    channel::{BackoffPolicy, Identity, RealtimeChannel, SseTransport},
    http::build_client,
    reconciler::Reconciler,
    snapshot::{HttpSnapshotSource, SnapshotFetcher},
    token::{FileTokenStore, HttpTokenRefresher, TokenLifecycleGuard},
};

/// Failures while assembling an [`HttpStack`].
#[derive(Error, Debug)]
pub enum StackError {
    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Shared HTTP client, token store and token guard for one principal.
#[derive(Debug)]
pub struct HttpStack {
    config: Config,
    client: Client,
    token_store: Arc<FileTokenStore>,
    tokens: Arc<TokenLifecycleGuard>,
}

impl HttpStack {
    /// # Errors
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn from_config(config: &Config) -> Result<Self, StackError> {
        config.validate()?;
        let client = build_client()?;
        let token_path = config
            .auth
            .token_path
            .clone()
            .unwrap_or_else(FileTokenStore::default_path);
        let token_store = Arc::new(FileTokenStore::new(token_path));
        let skew = TimeDelta::seconds(i64::try_from(config.auth.refresh_skew_secs).unwrap_or(i64::MAX / 1_000));
        let refresher = Arc::new(HttpTokenRefresher::new(client.clone(), config.server.base_url.clone()));
        let tokens = Arc::new(TokenLifecycleGuard::new(
            refresher,
            Arc::clone(&token_store) as Arc<dyn crate::token::SharedTokenStore>,
            skew,
        ));
        Ok(Self {
            config: config.clone(),
            client,
            token_store,
            tokens,
        })
    }

    /// Resolved configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token guard shared by every component of this stack.
    pub fn tokens(&self) -> Arc<TokenLifecycleGuard> {
        Arc::clone(&self.tokens)
    }

    /// File backing the shared session token.
    pub fn token_store(&self) -> &FileTokenStore {
        &self.token_store
    }

    /// Identity announced in channel handshakes.
    pub fn identity(&self) -> Identity {
        Identity::new(
            self.config.identity.subject_id.clone(),
            self.config.identity.role.clone(),
        )
    }

    /// Fetcher against the configured API.
    pub fn snapshot_fetcher(&self) -> SnapshotFetcher {
        let source = HttpSnapshotSource::new(self.client.clone(), self.config.server.base_url.clone());
        SnapshotFetcher::new(Arc::new(source), self.tokens())
    }

    /// Spawns a channel driver; must be called inside a tokio runtime.
    pub fn channel(&self) -> RealtimeChannel {
        let transport = SseTransport::new(self.client.clone(), self.config.server.base_url.clone());
        RealtimeChannel::spawn(
            transport,
            BackoffPolicy::from_config(&self.config.channel),
            self.tokens(),
        )
    }

    /// # Errors
    /// Returns an error when the reconciler settings are invalid.
    pub fn reconciler(&self) -> Result<Reconciler, ConfigError> {
        Reconciler::new(
            self.config.reconciler.clone(),
            self.identity(),
            self.snapshot_fetcher(),
            self.channel(),
            self.tokens(),
        )
    }
}
