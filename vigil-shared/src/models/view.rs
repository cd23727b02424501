//! Consumer-facing view of the active set and the map viewport fitted to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::location::{LocationRecord, Position};

/// Active set published to consumers after every recomputation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveView {
    /// Scope the records belong to.
    pub scope: String,
    /// Active records ordered by subject id.
    pub records: Vec<LocationRecord>,
    /// When the set was last recomputed; `None` before the first merge.
    pub computed_at: Option<DateTime<Utc>>,
}

impl ActiveView {
    /// Number of active records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record is active.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Active record for `subject_id`.
    pub fn get(&self, subject_id: &str) -> Option<&LocationRecord> {
        self.records
            .iter()
            .find(|record| record.subject_id == subject_id)
    }
}

/// Map camera placement derived from the active set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    /// Camera centre.
    pub center: Position,
    /// Web-map zoom level.
    pub zoom: u8,
    /// South-west and north-east corners, when fitted to records.
    pub bounds: Option<(Position, Position)>,
}

/// Zoom used when a single subject (or a tight cluster) is shown.
pub const MAX_FIT_ZOOM: u8 = 16;

impl Viewport {
    /// Viewport at `center` without fitted bounds.
    pub const fn centered(center: Position, zoom: u8) -> Self {
        Self {
            center,
            zoom,
            bounds: None,
        }
    }

    /// Fits the bounding box of `records`, or falls back when there are none.
    pub fn fit(records: &[LocationRecord], fallback: Viewport) -> Viewport {
        let mut iter = records.iter().map(|record| record.position);
        let Some(first) = iter.next() else {
            return fallback;
        };

        let (mut south, mut west, mut north, mut east) =
            (first.latitude, first.longitude, first.latitude, first.longitude);
        for position in iter {
            south = south.min(position.latitude);
            north = north.max(position.latitude);
            west = west.min(position.longitude);
            east = east.max(position.longitude);
        }

        let span = (north - south).max(east - west);
        Viewport {
            center: Position {
                latitude: (south + north) / 2.0,
                longitude: (west + east) / 2.0,
            },
            zoom: zoom_for_span(span),
            bounds: Some((
                Position {
                    latitude: south,
                    longitude: west,
                },
                Position {
                    latitude: north,
                    longitude: east,
                },
            )),
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn zoom_for_span(span_degrees: f64) -> u8 {
    if span_degrees <= f64::EPSILON {
        return MAX_FIT_ZOOM;
    }
    // One zoom level halves the visible span; level 1 shows roughly 180 degrees.
    let level = (360.0 / span_degrees).log2().floor();
    level.clamp(1.0, f64::from(MAX_FIT_ZOOM)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::location::{LocationPatch, LocationRecord};

    fn record(id: &str, latitude: f64, longitude: f64) -> LocationRecord {
        LocationRecord::from_patch(
            LocationPatch::new(id, DateTime::from_timestamp_millis(0).unwrap()).with_position(
                Position {
                    latitude,
                    longitude,
                },
            ),
        )
        .unwrap()
    }

    fn fallback() -> Viewport {
        Viewport::centered(
            Position {
                latitude: 51.5,
                longitude: -0.12,
            },
            11,
        )
    }

    #[test]
    fn empty_set_uses_fallback() {
        assert_eq!(Viewport::fit(&[], fallback()), fallback());
    }

    #[test]
    fn single_record_centres_at_max_zoom() {
        let viewport = Viewport::fit(&[record("a", 10.0, 20.0)], fallback());
        assert_eq!(viewport.zoom, MAX_FIT_ZOOM);
        assert!((viewport.center.latitude - 10.0).abs() < f64::EPSILON);
        assert!((viewport.center.longitude - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn spread_records_fit_bounds() {
        let viewport = Viewport::fit(
            &[record("a", 10.0, 20.0), record("b", 12.0, 24.0)],
            fallback(),
        );
        let (sw, ne) = viewport.bounds.unwrap();
        assert!((sw.latitude - 10.0).abs() < f64::EPSILON);
        assert!((ne.longitude - 24.0).abs() < f64::EPSILON);
        assert!((viewport.center.latitude - 11.0).abs() < f64::EPSILON);
        // 4 degrees of span: log2(90) = 6.49
        assert_eq!(viewport.zoom, 6);
    }

    #[test]
    fn active_view_lookup() {
        let view = ActiveView {
            scope: "medic".into(),
            records: vec![record("a", 1.0, 1.0)],
            computed_at: None,
        };
        assert_eq!(view.len(), 1);
        assert!(view.get("a").is_some());
        assert!(view.get("b").is_none());
    }
}
