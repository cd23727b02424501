//! Wire shape of snapshot rows and push payloads.
//!
//! Two generations of field names exist on the wire (`id`/`last_updated` and
//! `userId`/`lastUpdated`); both are accepted and normalized here so nothing
//! downstream sees the difference.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::location::{LocationPatch, Position, ResponderStatus};
use crate::errors::DataQualityError;

/// Identifier as it appears on the wire: text or an integer key.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawId {
    /// String key.
    Text(String),
    /// Integer key.
    Number(i64),
}

impl RawId {
    fn normalized(&self) -> Option<String> {
        match self {
            Self::Text(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Self::Number(number) => Some(number.to_string()),
        }
    }
}

/// Coordinate as a JSON number or a decimal string (numeric columns).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawCoordinate {
    /// JSON number.
    Number(f64),
    /// Decimal string.
    Text(String),
}

impl RawCoordinate {
    fn value(&self) -> f64 {
        match self {
            Self::Number(number) => *number,
            Self::Text(text) => text.trim().parse().unwrap_or(f64::NAN),
        }
    }
}

/// Timestamp as RFC 3339 text or epoch milliseconds.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// Milliseconds since the Unix epoch.
    Millis(i64),
    /// RFC 3339 text.
    Text(String),
}

impl RawTimestamp {
    fn parse(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(ms) => DateTime::from_timestamp_millis(*ms),
            Self::Text(text) => DateTime::parse_from_rfc3339(text.trim())
                .ok()
                .map(|value| value.with_timezone(&Utc)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Millis(ms) => ms.to_string(),
            Self::Text(text) => text.clone(),
        }
    }
}

/// One location row from the snapshot query or a push event.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct LocationRow {
    /// Current identifier field.
    #[serde(default, alias = "subject_id")]
    #[serde(rename = "subjectId")]
    pub subject_id: Option<RawId>,
    /// Identifier used by user-keyed tables.
    #[serde(default, alias = "user_id")]
    #[serde(rename = "userId")]
    pub user_id: Option<RawId>,
    /// Legacy identifier field.
    #[serde(default)]
    pub id: Option<RawId>,
    /// Latitude.
    #[serde(default, alias = "latitude")]
    pub lat: Option<RawCoordinate>,
    /// Longitude.
    #[serde(default, alias = "longitude")]
    pub lng: Option<RawCoordinate>,
    /// Scope the row belongs to.
    #[serde(default, alias = "scope")]
    pub role: Option<String>,
    /// Display name.
    #[serde(default, alias = "displayName")]
    pub name: Option<String>,
    /// Contact phone.
    #[serde(default, alias = "contactPhone")]
    pub phone: Option<String>,
    /// Free-form status, parsed leniently.
    #[serde(default)]
    pub status: Option<String>,
    /// Current timestamp field.
    #[serde(default, rename = "lastUpdated")]
    pub last_updated: Option<RawTimestamp>,
    /// Legacy snake-case timestamp field.
    #[serde(default, rename = "last_updated")]
    pub last_updated_legacy: Option<RawTimestamp>,
    /// Row modification time, used when no other timestamp is present.
    #[serde(default, rename = "updatedAt")]
    pub updated_at: Option<RawTimestamp>,
}

impl LocationRow {
    /// Parses a JSON value into a row without validating it.
    ///
    /// # Errors
    /// Returns [`DataQualityError::Malformed`] if the value is not an object of
    /// the expected shape.
    pub fn from_value(value: serde_json::Value) -> Result<Self, DataQualityError> {
        // serde would otherwise accept a JSON array as a positional struct.
        if !value.is_object() {
            return Err(DataQualityError::Malformed {
                reason: format!("expected an object, got {}", json_type(&value)),
            });
        }
        serde_json::from_value(value).map_err(|err| DataQualityError::Malformed {
            reason: err.to_string(),
        })
    }

    /// Subject identifier, preferring the current field names.
    pub fn subject(&self) -> Option<String> {
        [&self.subject_id, &self.user_id, &self.id]
            .into_iter()
            .flatten()
            .find_map(RawId::normalized)
    }

    /// Validates and normalizes the row.
    ///
    /// `arrival` stamps rows that carry no timestamp at all.
    ///
    /// # Errors
    /// Returns a [`DataQualityError`] for a missing subject, a bad position or
    /// an unparseable timestamp.
    pub fn into_patch(self, arrival: DateTime<Utc>) -> Result<LocationPatch, DataQualityError> {
        let subject_id = self.subject().ok_or(DataQualityError::MissingSubjectId)?;

        let position = match (&self.lat, &self.lng) {
            (Some(lat), Some(lng)) => Some(Position::checked(&subject_id, lat.value(), lng.value())?),
            (None, None) => None,
            _ => return Err(DataQualityError::IncompletePosition { subject_id }),
        };

        let raw_timestamp = self
            .last_updated
            .as_ref()
            .or(self.last_updated_legacy.as_ref())
            .or(self.updated_at.as_ref());
        let last_updated = match raw_timestamp {
            Some(raw) => raw.parse().ok_or_else(|| DataQualityError::InvalidTimestamp {
                subject_id: subject_id.clone(),
                value: raw.describe(),
            })?,
            None => arrival,
        };

        Ok(LocationPatch {
            subject_id,
            scope: non_blank(self.role),
            position,
            display_name: non_blank(self.name),
            contact_phone: non_blank(self.phone),
            status: self.status.as_deref().and_then(ResponderStatus::parse),
            last_updated,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arrival() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn parse(value: serde_json::Value) -> Result<LocationPatch, DataQualityError> {
        LocationRow::from_value(value)?.into_patch(arrival())
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let patch = parse(json!({
            "id": 42,
            "lat": "10.5",
            "lng": 20.25,
            "role": "medic",
            "last_updated": "2024-03-01T12:00:00Z"
        }))
        .unwrap();

        assert_eq!(patch.subject_id, "42");
        assert_eq!(patch.scope.as_deref(), Some("medic"));
        let position = patch.position.unwrap();
        assert!((position.latitude - 10.5).abs() < f64::EPSILON);
        assert!((position.longitude - 20.25).abs() < f64::EPSILON);
        assert_eq!(patch.last_updated.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn current_field_names_are_accepted() {
        let patch = parse(json!({
            "id": 7,
            "userId": "u-7",
            "lat": 1.0,
            "lng": 2.0,
            "role": "fire",
            "name": "Sam",
            "phone": "+15550199",
            "status": "busy",
            "lastUpdated": 1_700_000_005_000_i64
        }))
        .unwrap();

        assert_eq!(patch.subject_id, "u-7");
        assert_eq!(patch.display_name.as_deref(), Some("Sam"));
        assert_eq!(patch.contact_phone.as_deref(), Some("+15550199"));
        assert_eq!(patch.status, Some(ResponderStatus::Busy));
        assert_eq!(patch.last_updated.timestamp_millis(), 1_700_000_005_000);
    }

    #[test]
    fn missing_subject_is_rejected() {
        assert_eq!(
            parse(json!({"lat": 1.0, "lng": 2.0})).unwrap_err(),
            DataQualityError::MissingSubjectId
        );
        assert_eq!(
            parse(json!({"userId": "  ", "lat": 1.0, "lng": 2.0})).unwrap_err(),
            DataQualityError::MissingSubjectId
        );
    }

    #[test]
    fn non_numeric_coordinates_are_rejected() {
        assert!(matches!(
            parse(json!({"userId": "u1", "lat": "north", "lng": 2.0})),
            Err(DataQualityError::NonFinitePosition { .. })
        ));
    }

    #[test]
    fn half_a_position_is_rejected() {
        assert!(matches!(
            parse(json!({"userId": "u1", "lat": 1.0})),
            Err(DataQualityError::IncompletePosition { .. })
        ));
    }

    #[test]
    fn partial_push_payload_keeps_missing_fields_absent() {
        let patch = parse(json!({"userId": "u1", "status": "offline"})).unwrap();
        assert_eq!(patch.position, None);
        assert_eq!(patch.display_name, None);
        assert_eq!(patch.status, Some(ResponderStatus::Offline));
        assert_eq!(patch.last_updated, arrival());
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let err = parse(json!({"userId": "u1", "lastUpdated": "yesterday"})).unwrap_err();
        assert!(matches!(err, DataQualityError::InvalidTimestamp { .. }));
    }

    #[test]
    fn non_object_payload_is_malformed() {
        assert!(matches!(
            LocationRow::from_value(json!([1, 2, 3])),
            Err(DataQualityError::Malformed { .. })
        ));
        let err = LocationRow::from_value(json!(["r1", null, null, 10, 20])).unwrap_err();
        assert!(err.to_string().contains("expected an object, got an array"));
        assert!(matches!(
            LocationRow::from_value(json!("r1")),
            Err(DataQualityError::Malformed { .. })
        ));
    }
}
