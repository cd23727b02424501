//! # Error Types
//!
//! Error taxonomy shared by every Vigil component. Low-level components never
//! surface [`DataQualityError`] to callers; they drop the offending record and
//! report it. Network-facing components return [`FetchError`], [`ChannelError`]
//! or [`AuthError`] and leave retry decisions to the reconciler.

use thiserror::Error;

/// Coarse classification used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed record: dropped, logged, never fatal.
    DataQuality,
    /// Transport failure: retried per policy, surfaced as degraded health.
    Network,
    /// Server answered with a failure status: retried per policy.
    Server,
    /// Invalid or expired credentials: stops retries, requires re-authentication.
    Auth,
}

/// A location row or push payload that cannot be turned into a record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataQualityError {
    /// The record has no usable subject identifier.
    #[error("record is missing a subject id")]
    MissingSubjectId,

    /// Latitude or longitude is NaN or infinite.
    #[error("record {subject_id} has a non-finite position ({latitude}, {longitude})")]
    NonFinitePosition {
        /// Subject the record belongs to.
        subject_id: String,
        /// Latitude as received.
        latitude: f64,
        /// Longitude as received.
        longitude: f64,
    },

    /// Latitude or longitude is outside the valid WGS84 range.
    #[error("record {subject_id} has an out-of-range position ({latitude}, {longitude})")]
    PositionOutOfRange {
        /// Subject the record belongs to.
        subject_id: String,
        /// Latitude as received.
        latitude: f64,
        /// Longitude as received.
        longitude: f64,
    },

    /// Only one coordinate was supplied.
    #[error("record {subject_id} carries only one coordinate")]
    IncompletePosition {
        /// Subject the record belongs to.
        subject_id: String,
    },

    /// First sighting of a subject without any position.
    #[error("first sighting of {subject_id} carries no position")]
    MissingPosition {
        /// Subject the record belongs to.
        subject_id: String,
    },

    /// The timestamp could not be interpreted.
    #[error("record {subject_id} has an invalid timestamp: {value}")]
    InvalidTimestamp {
        /// Subject the record belongs to.
        subject_id: String,
        /// Raw timestamp text.
        value: String,
    },

    /// The payload is not a location row at all.
    #[error("payload is not a location row: {reason}")]
    Malformed {
        /// Decoder message.
        reason: String,
    },
}

impl DataQualityError {
    /// Subject identifier attached to the error, when known.
    pub fn subject_id(&self) -> Option<&str> {
        match self {
            Self::NonFinitePosition { subject_id, .. }
            | Self::PositionOutOfRange { subject_id, .. }
            | Self::IncompletePosition { subject_id }
            | Self::MissingPosition { subject_id }
            | Self::InvalidTimestamp { subject_id, .. } => Some(subject_id),
            Self::MissingSubjectId | Self::Malformed { .. } => None,
        }
    }
}

/// Failure of a snapshot fetch. `Clone` so that collapsed waiters can share it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The request never produced a response, or the body could not be read.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body, or the status reason when the body is empty.
        message: String,
    },

    /// The token was refused (401/403) or none could be obtained.
    #[error("authentication error: {0}")]
    Auth(String),
}

impl FetchError {
    /// Classification used by the reconciler's retry decisions.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Server { .. } => ErrorKind::Server,
            Self::Auth(_) => ErrorKind::Auth,
        }
    }
}

impl From<AuthError> for FetchError {
    fn from(error: AuthError) -> Self {
        Self::Auth(error.to_string())
    }
}

/// Failure of the realtime channel or its transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Connection refused, reset or timed out.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body, or the status reason when the body is empty.
        message: String,
    },

    /// The handshake or a control call was refused for its token.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The server spoke something other than the expected event protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation needs a connected channel.
    #[error("channel is not connected")]
    NotConnected,

    /// The channel driver has shut down.
    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    /// Classification used by the reconnect policy.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::Server { .. } => ErrorKind::Server,
            Self::Network(_) | Self::Protocol(_) | Self::NotConnected | Self::Closed => {
                ErrorKind::Network
            }
        }
    }
}

impl From<AuthError> for ChannelError {
    fn from(error: AuthError) -> Self {
        Self::Auth(error.to_string())
    }
}

/// Token refresh and session failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The token source refused to issue a token.
    #[error("token refresh rejected: {0}")]
    Rejected(String),

    /// The token source could not be reached or answered garbage.
    #[error("token source unavailable: {0}")]
    Unavailable(String),

    /// A previous refresh failed; the session must be re-established.
    #[error("session is no longer valid; sign in again")]
    SessionInvalid,
}

impl AuthError {
    /// Always [`ErrorKind::Auth`].
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Auth
    }
}

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value failed validation.
    #[error("Invalid configuration: {field} - {message}")]
    Invalid {
        /// Offending key or environment variable.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The file extension is neither YAML nor JSON.
    #[error("Unsupported configuration format. Use 'yaml' or 'json'.")]
    UnsupportedFormat,

    /// The file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(String),

    /// The file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`].
    pub fn invalid<T: Into<String>, U: Into<String>>(field: T, message: U) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(error: serde_json::Error) -> Self {
        Self::Parse(error.to_string())
    }
}

impl From<serde_yml::Error> for ConfigError {
    fn from(error: serde_yml::Error) -> Self {
        Self::Parse(error.to_string())
    }
}
