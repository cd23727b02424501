//! Location records and the partial updates merged into them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DataQualityError;

/// Placeholder shown for subjects that never reported a name.
pub const UNKNOWN_DISPLAY_NAME: &str = "Unknown";

/// WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Position {
    /// Degrees north, `[-90, 90]`.
    pub latitude: f64,
    /// Degrees east, `[-180, 180]`.
    pub longitude: f64,
}

impl Position {
    /// Validates a coordinate pair for the given subject.
    ///
    /// # Errors
    /// Returns a [`DataQualityError`] when either coordinate is non-finite or
    /// outside `[-90, 90]` / `[-180, 180]`.
    pub fn checked(
        subject_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<Self, DataQualityError> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(DataQualityError::NonFinitePosition {
                subject_id: subject_id.to_string(),
                latitude,
                longitude,
            });
        }
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(DataQualityError::PositionOutOfRange {
                subject_id: subject_id.to_string(),
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// Informational availability reported by a responder.
///
/// Not authoritative for liveness; only `last_updated` decides staleness.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponderStatus {
    /// Free to take an assignment.
    #[default]
    Available,
    /// On an assignment.
    Busy,
    /// Signed off duty.
    Offline,
}

impl ResponderStatus {
    /// Lenient parse used on ingest; unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "available" | "online" | "active" => Some(Self::Available),
            "busy" | "responding" | "engaged" => Some(Self::Busy),
            "offline" | "unavailable" => Some(Self::Offline),
            _ => None,
        }
    }

    /// Wire spelling of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

/// Latest known location of one tracked subject within a scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    /// Stable identifier of the tracked subject.
    pub subject_id: String,
    /// Scope (role) the record was received under.
    pub scope: String,
    /// Last reported position.
    pub position: Position,
    /// Name shown on the map; [`UNKNOWN_DISPLAY_NAME`] until reported.
    pub display_name: String,
    /// Optional phone number for dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_phone: Option<String>,
    /// Self-reported availability.
    pub status: ResponderStatus,
    /// Server timestamp of the latest accepted update.
    pub last_updated: DateTime<Utc>,
}

impl LocationRecord {
    /// Creates a record from the first sighting of a subject.
    ///
    /// # Errors
    /// Returns [`DataQualityError::MissingPosition`] when the patch carries no
    /// position, since a subject cannot be placed without one.
    pub fn from_patch(patch: LocationPatch) -> Result<Self, DataQualityError> {
        let position = patch
            .position
            .ok_or_else(|| DataQualityError::MissingPosition {
                subject_id: patch.subject_id.clone(),
            })?;

        Ok(Self {
            subject_id: patch.subject_id,
            scope: patch.scope.unwrap_or_default(),
            position,
            display_name: patch
                .display_name
                .unwrap_or_else(|| UNKNOWN_DISPLAY_NAME.to_string()),
            contact_phone: patch.contact_phone,
            status: patch.status.unwrap_or_default(),
            last_updated: patch.last_updated,
        })
    }

    /// Shallow per-field merge: present fields overwrite, absent fields stay.
    ///
    /// Callers are responsible for the timestamp ordering check.
    pub fn apply(&mut self, patch: LocationPatch) {
        if let Some(scope) = patch.scope {
            self.scope = scope;
        }
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(name) = patch.display_name {
            self.display_name = name;
        }
        if patch.contact_phone.is_some() {
            self.contact_phone = patch.contact_phone;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        self.last_updated = patch.last_updated;
    }
}

/// Validated, possibly partial update for one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationPatch {
    /// Subject this patch applies to.
    pub subject_id: String,
    /// Scope, when the payload carried one.
    pub scope: Option<String>,
    /// New position, if reported.
    pub position: Option<Position>,
    /// New display name, if reported.
    pub display_name: Option<String>,
    /// New phone number, if reported.
    pub contact_phone: Option<String>,
    /// New status, if reported.
    pub status: Option<ResponderStatus>,
    /// Timestamp that orders this patch against the stored record.
    pub last_updated: DateTime<Utc>,
}

impl LocationPatch {
    /// Minimal patch carrying only identity and timestamp.
    pub fn new(subject_id: impl Into<String>, last_updated: DateTime<Utc>) -> Self {
        Self {
            subject_id: subject_id.into(),
            scope: None,
            position: None,
            display_name: None,
            contact_phone: None,
            status: None,
            last_updated,
        }
    }

    /// Sets the position.
    #[must_use]
    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    /// Sets the scope.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: ResponderStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Fills the scope from the subscription when the payload carried none.
    pub fn ensure_scope(&mut self, scope: &str) {
        if self.scope.is_none() {
            self.scope = Some(scope.to_string());
        }
    }
}

impl From<LocationRecord> for LocationPatch {
    fn from(record: LocationRecord) -> Self {
        Self {
            subject_id: record.subject_id,
            scope: Some(record.scope),
            position: Some(record.position),
            display_name: Some(record.display_name),
            contact_phone: record.contact_phone,
            status: Some(record.status),
            last_updated: record.last_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn checked_position_rejects_bad_coordinates() {
        assert!(Position::checked("r1", 10.0, 20.0).is_ok());
        assert!(matches!(
            Position::checked("r1", f64::NAN, 20.0),
            Err(DataQualityError::NonFinitePosition { .. })
        ));
        assert!(matches!(
            Position::checked("r1", 10.0, f64::INFINITY),
            Err(DataQualityError::NonFinitePosition { .. })
        ));
        assert!(matches!(
            Position::checked("r1", 91.0, 0.0),
            Err(DataQualityError::PositionOutOfRange { .. })
        ));
        assert!(matches!(
            Position::checked("r1", 0.0, -180.5),
            Err(DataQualityError::PositionOutOfRange { .. })
        ));
    }

    #[test]
    fn first_sighting_fills_placeholders() {
        let patch = LocationPatch::new("r1", ts(1_000))
            .with_position(Position::checked("r1", 1.0, 2.0).unwrap());
        let record = LocationRecord::from_patch(patch).unwrap();
        assert_eq!(record.display_name, UNKNOWN_DISPLAY_NAME);
        assert_eq!(record.status, ResponderStatus::Available);
        assert_eq!(record.contact_phone, None);
    }

    #[test]
    fn first_sighting_without_position_is_rejected() {
        let err = LocationRecord::from_patch(LocationPatch::new("r1", ts(0))).unwrap_err();
        assert_eq!(
            err,
            DataQualityError::MissingPosition {
                subject_id: "r1".into()
            }
        );
    }

    #[test]
    fn apply_keeps_absent_fields() {
        let mut record = LocationRecord::from_patch(
            LocationPatch::new("r1", ts(1_000))
                .with_position(Position::checked("r1", 1.0, 2.0).unwrap())
                .with_display_name("Alex")
                .with_status(ResponderStatus::Busy),
        )
        .unwrap();
        record.contact_phone = Some("+15550100".into());

        record.apply(
            LocationPatch::new("r1", ts(2_000))
                .with_position(Position::checked("r1", 3.0, 4.0).unwrap()),
        );

        assert_eq!(record.position.latitude, 3.0);
        assert_eq!(record.display_name, "Alex");
        assert_eq!(record.status, ResponderStatus::Busy);
        assert_eq!(record.contact_phone.as_deref(), Some("+15550100"));
        assert_eq!(record.last_updated, ts(2_000));
    }

    #[test]
    fn status_parse_is_lenient() {
        assert_eq!(ResponderStatus::parse(" BUSY "), Some(ResponderStatus::Busy));
        assert_eq!(
            ResponderStatus::parse("offline"),
            Some(ResponderStatus::Offline)
        );
        assert_eq!(ResponderStatus::parse("on-break"), None);
    }

    #[test]
    fn record_serializes_camel_case() {
        let record = LocationRecord::from_patch(
            LocationPatch::new("r1", ts(0)).with_position(Position {
                latitude: 1.0,
                longitude: 2.0,
            }),
        )
        .unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["subjectId"], "r1");
        assert_eq!(json["displayName"], "Unknown");
        assert_eq!(json["status"], "available");
        assert!(json.get("contactPhone").is_none());
    }
}
