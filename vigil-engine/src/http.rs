//! Helpers shared by the reqwest-backed bindings.

use reqwest::{Client, Response, StatusCode};
use url::Url;

use shared::errors::{ChannelError, FetchError};

/// User agent sent by every request.
pub const USER_AGENT: &str = concat!("vigil-engine/", env!("CARGO_PKG_VERSION"));

/// Builds the HTTP client used by every binding.
///
/// # Errors
/// Returns an error if the TLS backend cannot be initialised.
pub fn build_client() -> Result<Client, reqwest::Error> {
    Client::builder().user_agent(USER_AGENT).build()
}

/// Joins `path` onto the API base, tolerating a missing trailing slash.
pub(crate) fn endpoint(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
}

pub(crate) fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Reads the body of a failed response for diagnostics.
pub(crate) async fn failure_body(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if body.trim().is_empty() {
        status.to_string()
    } else {
        body
    }
}

pub(crate) async fn fetch_error_from(response: Response) -> FetchError {
    let status = response.status();
    let message = failure_body(response).await;
    if is_auth_status(status) {
        FetchError::Auth(message)
    } else {
        FetchError::Server {
            status: status.as_u16(),
            message,
        }
    }
}

pub(crate) async fn channel_error_from(response: Response) -> ChannelError {
    let status = response.status();
    let message = failure_body(response).await;
    if is_auth_status(status) {
        ChannelError::Auth(message)
    } else {
        ChannelError::Server {
            status: status.as_u16(),
            message,
        }
    }
}
