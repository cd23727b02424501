//! Authoritative snapshot fetching with per-scope in-flight collapsing.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use reqwest::Client;
use serde::Deserialize;
use shared::{
    errors::{ErrorKind, FetchError},
    models::{LocationPatch, LocationRow},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::{
    clock::{Clock, SystemClock},
    http::{self, endpoint},
    store::report_data_quality,
    token::{AccessToken, TokenLifecycleGuard},
};

/// Where snapshot rows come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync + fmt::Debug {
    /// Fetches every current row for `scope`.
    ///
    /// # Errors
    /// Returns [`FetchError::Auth`] on 401/403, [`FetchError::Server`] on other
    /// non-success statuses, and [`FetchError::Network`] on transport failures.
    async fn fetch_rows(&self, scope: &str, token: &AccessToken) -> Result<Vec<LocationRow>, FetchError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotBody {
    Rows(Vec<serde_json::Value>),
    Wrapped {
        #[serde(alias = "data")]
        locations: Vec<serde_json::Value>,
    },
}

/// `GET {base}/api/locations?role={scope}`.
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    client: Client,
    base_url: Url,
}

impl HttpSnapshotSource {
    /// Source against the API at `base_url`.
    pub fn new(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_rows(&self, scope: &str, token: &AccessToken) -> Result<Vec<LocationRow>, FetchError> {
        let mut url = endpoint(&self.base_url, "api/locations")
            .map_err(|err| FetchError::Network(format!("invalid snapshot endpoint: {err}")))?;
        url.query_pairs_mut().append_pair("role", scope);

        let response = self
            .client
            .get(url)
            .bearer_auth(&token.value)
            .send()
            .await
            .map_err(|err| FetchError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(http::fetch_error_from(response).await);
        }

        let body = response
            .json::<SnapshotBody>()
            .await
            .map_err(|err| FetchError::Server {
                status: status.as_u16(),
                message: format!("undecodable snapshot body: {err}"),
            })?;
        let values = match body {
            SnapshotBody::Rows(rows) | SnapshotBody::Wrapped { locations: rows } => rows,
        };

        Ok(values
            .into_iter()
            .filter_map(|value| match LocationRow::from_value(value) {
                Ok(row) => Some(row),
                Err(err) => {
                    report_data_quality("snapshot", &err);
                    None
                }
            })
            .collect())
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Vec<LocationPatch>, FetchError>>>;

/// Collapses concurrent snapshot requests per scope and normalizes the rows.
pub struct SnapshotFetcher {
    source: Arc<dyn SnapshotSource>,
    tokens: Arc<TokenLifecycleGuard>,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<HashMap<String, (u64, SharedFetch)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for SnapshotFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotFetcher")
            .field("source", &self.source)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl SnapshotFetcher {
    /// Fetcher stamping undated rows with the system clock.
    pub fn new(source: Arc<dyn SnapshotSource>, tokens: Arc<TokenLifecycleGuard>) -> Self {
        Self::with_clock(source, tokens, Arc::new(SystemClock))
    }

    /// Fetcher with an explicit clock for undated rows.
    pub fn with_clock(
        source: Arc<dyn SnapshotSource>,
        tokens: Arc<TokenLifecycleGuard>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            tokens,
            clock,
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Fetches and normalizes the snapshot for `scope`.
    ///
    /// Callers arriving while a fetch for the same scope is outstanding share
    /// its result. Malformed rows are dropped and reported.
    ///
    /// # Errors
    /// Returns the [`FetchError`] of the shared attempt; a token the server
    /// rejected is marked on the guard so the next call refreshes.
    pub async fn fetch(&self, scope: &str) -> Result<Vec<LocationPatch>, FetchError> {
        let (id, fetch) = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some((id, fetch)) = in_flight.get(scope) {
                debug!(target: "vigil::snapshot", scope, "joining in-flight snapshot fetch");
                (*id, fetch.clone())
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let fetch = self.start(scope.to_string());
                in_flight.insert(scope.to_string(), (id, fetch.clone()));
                (id, fetch)
            }
        };

        let result = fetch.await;

        let mut in_flight = self.in_flight.lock().await;
        if matches!(in_flight.get(scope), Some((current, _)) if *current == id) {
            in_flight.remove(scope);
        }
        result
    }

    fn start(&self, scope: String) -> SharedFetch {
        let source = Arc::clone(&self.source);
        let tokens = Arc::clone(&self.tokens);
        let clock = Arc::clone(&self.clock);

        async move {
            let token = match tokens.valid_token().await {
                Ok(token) => token,
                Err(err) => return Err(FetchError::from(err)),
            };
            let rows = match source.fetch_rows(&scope, &token).await {
                Ok(rows) => rows,
                Err(err) => {
                    counter!("vigil_snapshot_fetches_total", "outcome" => "error").increment(1);
                    if err.kind() == ErrorKind::Auth {
                        tokens.reject(&token).await;
                    }
                    warn!(target: "vigil::snapshot", scope = %scope, error = %err, "snapshot fetch failed");
                    return Err(err);
                }
            };
            counter!("vigil_snapshot_fetches_total", "outcome" => "ok").increment(1);

            let arrival = clock.now();
            let received = rows.len();
            let patches: Vec<LocationPatch> = rows
                .into_iter()
                .filter_map(|row| match row.into_patch(arrival) {
                    Ok(mut patch) => {
                        patch.ensure_scope(&scope);
                        Some(patch)
                    }
                    Err(err) => {
                        report_data_quality("snapshot", &err);
                        None
                    }
                })
                .collect();
            debug!(target: "vigil::snapshot", scope = %scope, received, accepted = patches.len(), "snapshot fetched");
            Ok(patches)
        }
        .boxed()
        .shared()
    }
}
