// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Station state management.
//!
//! One [`StationRecord`] per call sign, holding the latest position, grid
//! locator and county/city. Locator and region carry their own "changed at"
//! timestamps that only move when the value actually changes. Records that
//! stop reporting are evicted after the configured age-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::geofence::{Boundary, Coordinate};

/// Default age-out: four hours without a position report.
pub const DEFAULT_AGE_OUT_SECS: i64 = 4 * 60 * 60;

/// Station database shared between the session task and the control side.
pub type SharedStations = Arc<Mutex<StationDatabase>>;

/// Latest known state of one station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationRecord {
    /// Call sign including SSID suffix.
    pub call: String,
    /// Registered or self-identified QSO party participant.
    pub is_registered: bool,
    pub position: Coordinate,
    pub position_observed_at: DateTime<Utc>,
    /// Six-character grid locator.
    pub locator: String,
    pub locator_changed_at: DateTime<Utc>,
    pub region_abbr: String,
    pub region_name: String,
    pub region_changed_at: DateTime<Utc>,
}

/// Which tracked values differ from what was stored before.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub locator_changed: bool,
    pub region_changed: bool,
}

impl ChangeSet {
    #[must_use]
    pub fn any(&self) -> bool {
        self.locator_changed || self.region_changed
    }
}

/// Keyed station records with change detection and age-out.
#[derive(Debug)]
pub struct StationDatabase {
    stations: HashMap<String, StationRecord>,
    age_out: Duration,
}

impl Default for StationDatabase {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_AGE_OUT_SECS))
    }
}

impl StationDatabase {
    #[must_use]
    pub fn new(age_out: Duration) -> Self {
        Self {
            stations: HashMap::new(),
            age_out,
        }
    }

    /// Wrap a fresh database for sharing across tasks.
    #[must_use]
    pub fn shared(age_out: Duration) -> SharedStations {
        Arc::new(Mutex::new(Self::new(age_out)))
    }

    #[must_use]
    pub fn age_out(&self) -> Duration {
        self.age_out
    }

    /// Record a position report that resolved to `region`.
    ///
    /// The first observation of a call counts as a change of both locator
    /// and region. Unknown regions are not accepted here; callers drop the
    /// station with [`StationDatabase::remove`] instead.
    pub fn observe(
        &mut self,
        call: &str,
        is_registered: bool,
        position: Coordinate,
        region: &Boundary,
        locator: &str,
        now: DateTime<Utc>,
    ) -> ChangeSet {
        debug_assert!(!region.is_unknown(), "unknown regions are never stored");

        if let Some(record) = self.stations.get_mut(call) {
            let mut changes = ChangeSet::default();

            record.is_registered = is_registered;
            record.position = position;
            record.position_observed_at = now;

            if record.locator != locator {
                record.locator = locator.to_string();
                record.locator_changed_at = now;
                changes.locator_changed = true;
            }

            if record.region_abbr != region.abbr {
                record.region_abbr.clone_from(&region.abbr);
                record.region_name.clone_from(&region.name);
                record.region_changed_at = now;
                changes.region_changed = true;
            }

            return changes;
        }

        self.stations.insert(
            call.to_string(),
            StationRecord {
                call: call.to_string(),
                is_registered,
                position,
                position_observed_at: now,
                locator: locator.to_string(),
                locator_changed_at: now,
                region_abbr: region.abbr.clone(),
                region_name: region.name.clone(),
                region_changed_at: now,
            },
        );

        ChangeSet {
            locator_changed: true,
            region_changed: true,
        }
    }

    /// Drop a station, e.g. after it wandered outside every boundary.
    pub fn remove(&mut self, call: &str) -> Option<StationRecord> {
        self.stations.remove(call)
    }

    /// Remove every record whose last position is older than `age_out`.
    ///
    /// Returns the evicted call signs.
    pub fn evict(&mut self, now: DateTime<Utc>, age_out: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .stations
            .values()
            .filter(|r| now - r.position_observed_at > age_out)
            .map(|r| r.call.clone())
            .collect();

        for call in &expired {
            self.stations.remove(call);
            info!("Aged out {call}");
        }

        expired
    }

    /// [`StationDatabase::evict`] with the configured age-out.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        self.evict(now, self.age_out)
    }

    #[must_use]
    pub fn get(&self, call: &str) -> Option<&StationRecord> {
        self.stations.get(call)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &StationRecord> {
        self.stations.values()
    }

    /// Copy of every record, for persistence.
    #[must_use]
    pub fn to_snapshot(&self) -> Vec<StationRecord> {
        self.stations.values().cloned().collect()
    }

    /// Replace the contents with a previously persisted snapshot.
    ///
    /// Records for the unknown region are discarded.
    pub fn load_snapshot(&mut self, records: impl IntoIterator<Item = StationRecord>) {
        self.stations = records
            .into_iter()
            .filter(|r| r.region_abbr != crate::geofence::UNKNOWN_ABBR)
            .map(|r| (r.call.clone(), r))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(name: &str, abbr: &str) -> Boundary {
        Boundary::new(name, abbr)
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_first_observation_changes_everything() {
        let mut db = StationDatabase::default();
        let changes = db.observe(
            "K1RA-9",
            true,
            Coordinate::new(-77.8, 38.7),
            &region("Fauquier", "FAU"),
            "FM18br",
            t(0),
        );

        assert!(changes.locator_changed && changes.region_changed);
        let record = db.get("K1RA-9").unwrap();
        assert_eq!(record.region_abbr, "FAU");
        assert_eq!(record.locator_changed_at, t(0));
    }

    #[test]
    fn test_repeat_observation_has_no_changes() {
        let mut db = StationDatabase::default();
        let fau = region("Fauquier", "FAU");
        db.observe("K1RA-9", true, Coordinate::new(-77.8, 38.7), &fau, "FM18br", t(0));
        let changes = db.observe("K1RA-9", true, Coordinate::new(-77.81, 38.71), &fau, "FM18br", t(60));

        assert_eq!(changes, ChangeSet::default());
        let record = db.get("K1RA-9").unwrap();
        assert_eq!(record.position_observed_at, t(60));
        assert_eq!(record.region_changed_at, t(0));
        assert_eq!(record.locator_changed_at, t(0));
    }

    #[test]
    fn test_region_change_updates_timestamp() {
        let mut db = StationDatabase::default();
        db.observe("K1RA-9", true, Coordinate::new(-77.8, 38.7), &region("Fauquier", "FAU"), "FM18br", t(0));
        let changes = db.observe(
            "K1RA-9",
            true,
            Coordinate::new(-77.6, 38.7),
            &region("PrinceWilliam", "PWM"),
            "FM18br",
            t(120),
        );

        assert!(changes.region_changed);
        assert!(!changes.locator_changed);
        let record = db.get("K1RA-9").unwrap();
        assert_eq!(record.region_abbr, "PWM");
        assert_eq!(record.region_name, "PrinceWilliam");
        assert_eq!(record.region_changed_at, t(120));
        assert_eq!(record.locator_changed_at, t(0));
    }

    #[test]
    fn test_evict_stale_records() {
        let mut db = StationDatabase::new(Duration::seconds(3600));
        let fau = region("Fauquier", "FAU");
        db.observe("OLD", false, Coordinate::new(-77.8, 38.7), &fau, "FM18br", t(0));
        db.observe("NEW", false, Coordinate::new(-77.8, 38.7), &fau, "FM18br", t(3000));

        // Exactly at the threshold is kept.
        assert!(db.evict_expired(t(3600)).is_empty());

        let evicted = db.evict_expired(t(3601));
        assert_eq!(evicted, vec!["OLD".to_string()]);
        assert!(db.get("OLD").is_none());
        assert!(db.get("NEW").is_some());
    }

    #[test]
    fn test_snapshot_round_trip_skips_unknown() {
        let mut db = StationDatabase::default();
        db.observe("W4VA-10", false, Coordinate::new(-77.8, 38.7), &region("Fauquier", "FAU"), "FM18br", t(0));

        let mut snapshot = db.to_snapshot();
        let mut bogus = snapshot[0].clone();
        bogus.call = "N0CALL".to_string();
        bogus.region_abbr = "UNK".to_string();
        snapshot.push(bogus);

        let mut restored = StationDatabase::default();
        restored.load_snapshot(snapshot);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get("W4VA-10"), db.get("W4VA-10"));
    }
}
