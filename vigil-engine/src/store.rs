//! In-memory latest-location store for one scope.
//!
//! Every producer (bootstrap snapshot, safety-net poll, realtime push) writes
//! through [`LocationStore::merge`]; last-writer-wins by `last_updated` makes
//! the final state independent of arrival order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use metrics::counter;
use shared::{
    errors::DataQualityError,
    models::{LocationPatch, LocationRecord, LocationRow},
    staleness::StalenessPolicy,
};
use tracing::{debug, warn};

/// Result of a single merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First sighting of the subject.
    Inserted,
    /// Existing record overwritten by an equal-or-newer update.
    Updated,
    /// Update older than the stored record; discarded.
    Stale,
    /// Update failed validation; discarded and reported.
    Dropped,
}

impl MergeOutcome {
    /// Whether the merge changed the store.
    pub const fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

/// Records a malformed record as a data-quality event.
pub(crate) fn report_data_quality(source: &'static str, error: &DataQualityError) {
    counter!("vigil_data_quality_drops_total", "source" => source).increment(1);
    warn!(
        target: "vigil::data_quality",
        source,
        subject_id = error.subject_id().unwrap_or("<none>"),
        error = %error,
        "dropping malformed location record"
    );
}

/// Latest record per subject, bounded by a staleness policy.
#[derive(Debug, Clone, Default)]
pub struct LocationStore {
    records: BTreeMap<String, LocationRecord>,
    policy: StalenessPolicy,
}

impl LocationStore {
    /// Empty store applying `policy`.
    pub fn new(policy: StalenessPolicy) -> Self {
        Self {
            records: BTreeMap::new(),
            policy,
        }
    }

    /// Staleness policy in force.
    pub const fn policy(&self) -> StalenessPolicy {
        self.policy
    }

    /// Merges a validated patch using last-writer-wins by timestamp.
    pub fn merge(&mut self, patch: LocationPatch) -> MergeOutcome {
        if let Some(existing) = self.records.get_mut(&patch.subject_id) {
            if patch.last_updated < existing.last_updated {
                debug!(
                    subject_id = %patch.subject_id,
                    incoming = %patch.last_updated,
                    stored = %existing.last_updated,
                    "discarding out-of-order location update"
                );
                return MergeOutcome::Stale;
            }
            existing.apply(patch);
            return MergeOutcome::Updated;
        }

        match LocationRecord::from_patch(patch) {
            Ok(record) => {
                self.records.insert(record.subject_id.clone(), record);
                MergeOutcome::Inserted
            }
            Err(err) => {
                report_data_quality("store", &err);
                MergeOutcome::Dropped
            }
        }
    }

    /// Validates a raw wire row and merges it; malformed rows are dropped.
    pub fn merge_row(&mut self, row: LocationRow, arrival: DateTime<Utc>) -> MergeOutcome {
        match row.into_patch(arrival) {
            Ok(patch) => self.merge(patch),
            Err(err) => {
                report_data_quality("store", &err);
                MergeOutcome::Dropped
            }
        }
    }

    /// Prunes expired records and returns the rest ordered by subject id.
    pub fn active_snapshot(&mut self, now: DateTime<Utc>) -> Vec<LocationRecord> {
        self.compact(now);
        self.records.values().cloned().collect()
    }

    /// Removes records outside the staleness horizon; returns how many.
    pub fn compact(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        let policy = self.policy;
        self.records
            .retain(|_, record| policy.is_active(record.last_updated, now));
        before - self.records.len()
    }

    /// Drops every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Stored record for `subject_id`, whether or not it is still active.
    pub fn get(&self, subject_id: &str) -> Option<&LocationRecord> {
        self.records.get(subject_id)
    }

    /// Number of stored records, including expired ones not yet pruned.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde_json::json;
    use shared::models::{Position, ResponderStatus};

    const T: i64 = 1_700_000_000_000;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(T + offset_ms).unwrap()
    }

    fn at(id: &str, lat: f64, lng: f64, offset_ms: i64) -> LocationPatch {
        LocationPatch::new(id, ts(offset_ms))
            .with_scope("medic")
            .with_position(Position {
                latitude: lat,
                longitude: lng,
            })
    }

    fn store() -> LocationStore {
        LocationStore::new(StalenessPolicy::default())
    }

    #[test]
    fn merge_is_order_independent() {
        let older = at("r1", 1.0, 1.0, 0)
            .with_display_name("Old")
            .with_status(ResponderStatus::Busy);
        let newer = at("r1", 2.0, 2.0, 5_000)
            .with_display_name("New")
            .with_status(ResponderStatus::Available);

        let mut forward = store();
        forward.merge(older.clone());
        assert_eq!(forward.merge(newer.clone()), MergeOutcome::Updated);

        let mut backward = store();
        backward.merge(newer.clone());
        assert_eq!(backward.merge(older), MergeOutcome::Stale);

        let mut only_newer = store();
        only_newer.merge(newer);

        assert_eq!(forward.get("r1"), only_newer.get("r1"));
        assert_eq!(backward.get("r1"), only_newer.get("r1"));
    }

    #[test]
    fn snapshot_never_duplicates_subjects() {
        let mut store = store();
        for offset in 0..20 {
            store.merge(at("r1", 1.0, 1.0, offset * 100));
            store.merge(at("r2", 1.0, 1.0, 2_000 - offset * 100));
        }
        let snapshot = store.active_snapshot(ts(3_000));
        let ids: Vec<_> = snapshot.iter().map(|r| r.subject_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[test]
    fn equal_timestamp_replaces() {
        let mut store = store();
        store.merge(at("r1", 1.0, 1.0, 0));
        assert_eq!(store.merge(at("r1", 3.0, 3.0, 0)), MergeOutcome::Updated);
        assert!((store.get("r1").unwrap().position.latitude - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_update_keeps_absent_fields() {
        let mut store = store();
        store.merge(
            at("r1", 1.0, 1.0, 0)
                .with_display_name("Kim")
                .with_status(ResponderStatus::Busy),
        );
        store.merge(LocationPatch::new("r1", ts(1_000)).with_status(ResponderStatus::Offline));

        let record = store.get("r1").unwrap();
        assert_eq!(record.display_name, "Kim");
        assert_eq!(record.status, ResponderStatus::Offline);
        assert!((record.position.latitude - 1.0).abs() < f64::EPSILON);
        assert_eq!(record.last_updated, ts(1_000));
    }

    #[test]
    fn horizon_boundary_in_snapshot() {
        let mut store = store();
        let now = ts(0);
        let horizon = store.policy().horizon_ms();
        store.merge(at("gone", 1.0, 1.0, -horizon - 1));
        store.merge(at("kept", 1.0, 1.0, -horizon + 1));

        let snapshot = store.active_snapshot(now);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].subject_id, "kept");
        // Pruned lazily during view computation.
        assert!(store.get("gone").is_none());
    }

    #[test]
    fn compact_reports_removed_count() {
        let mut store = store();
        store.merge(at("a", 1.0, 1.0, 0));
        store.merge(at("b", 1.0, 1.0, 60_000));
        assert_eq!(store.compact(ts(0) + TimeDelta::minutes(5) + TimeDelta::seconds(1)), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn malformed_rows_are_dropped_without_side_effects() {
        let mut store = store();
        let bad = LocationRow::from_value(json!({"lat": 1.0, "lng": 2.0})).unwrap();
        assert_eq!(store.merge_row(bad, ts(0)), MergeOutcome::Dropped);

        let nan = LocationRow::from_value(json!({"userId": "x", "lat": "nan?", "lng": 1.0})).unwrap();
        assert_eq!(store.merge_row(nan, ts(0)), MergeOutcome::Dropped);

        let first_without_position = LocationPatch::new("y", ts(0));
        assert_eq!(store.merge(first_without_position), MergeOutcome::Dropped);
        assert!(store.is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let mut store = store();
        store.merge(at("a", 1.0, 1.0, 0));
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn push_race_scenario() {
        let mut store = store();
        let bootstrap = LocationRow::from_value(json!({
            "id": "r1", "lat": 10, "lng": 20, "role": "medic", "lastUpdated": T
        }))
        .unwrap();
        store.merge_row(bootstrap, ts(0));

        let push = LocationRow::from_value(json!({
            "id": "r1", "lat": 10.1, "lng": 20.1, "lastUpdated": T + 5_000
        }))
        .unwrap();
        assert_eq!(store.merge_row(push, ts(5_000)), MergeOutcome::Updated);

        let late = LocationRow::from_value(json!({
            "id": "r1", "lat": 9, "lng": 9, "lastUpdated": T + 1_000
        }))
        .unwrap();
        assert_eq!(store.merge_row(late, ts(6_000)), MergeOutcome::Stale);

        let snapshot = store.active_snapshot(ts(6_000));
        assert_eq!(snapshot.len(), 1);
        assert!((snapshot[0].position.latitude - 10.1).abs() < 1e-9);
        assert!((snapshot[0].position.longitude - 20.1).abs() < 1e-9);
        assert_eq!(snapshot[0].last_updated, ts(5_000));
    }
}
