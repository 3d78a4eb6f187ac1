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

//! Generated artifacts for the map front end.
//!
//! Two GeoJSON feature collections (registered and unregistered stations) and
//! a CSV summary of registered stations. Every artifact is built in memory and
//! replaced with a single temp-file-and-rename, so a polling browser never
//! sees a partial document. The feature collections double as the warm
//! restart snapshot.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::serde::ts_seconds;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geofence::Coordinate;
use crate::protocol::short_call;
use crate::tracker::{StationDatabase, StationRecord};

/// Feature collection for registered QSO party stations.
pub const REGISTERED_FEATURES: &str = "qso-party.json";
/// Feature collection for every other station.
pub const UNREGISTERED_FEATURES: &str = "non-qso-party.json";
/// Registered-station summary table.
pub const SUMMARY_TABLE: &str = "table.csv";

/// Errors that can occur while writing artifacts.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize feature collection: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to build summary table: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct FeatureCollection {
    #[serde(rename = "type")]
    kind: String,
    features: Vec<Feature>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: String,
    properties: FeatureProperties,
    geometry: Geometry,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureProperties {
    id: String,
    icon: String,
    call: String,
    short_call: String,
    display_text: String,
    is_registered: bool,
    #[serde(with = "ts_seconds")]
    region_changed_at: DateTime<Utc>,
    region_abbr: String,
    region_name: String,
    #[serde(with = "ts_seconds")]
    locator_changed_at: DateTime<Utc>,
    locator: String,
    #[serde(with = "ts_seconds")]
    position_observed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Geometry {
    #[serde(rename = "type")]
    kind: String,
    coordinates: [f64; 2],
}

impl FeatureCollection {
    fn new() -> Self {
        Self {
            kind: "FeatureCollection".to_string(),
            features: Vec::new(),
        }
    }
}

impl Feature {
    fn from_record(id: usize, record: &StationRecord) -> Self {
        Self {
            kind: "Feature".to_string(),
            properties: FeatureProperties {
                id: id.to_string(),
                icon: "1".to_string(),
                call: record.call.clone(),
                short_call: short_call(&record.call),
                display_text: display_text(record),
                is_registered: record.is_registered,
                region_changed_at: record.region_changed_at,
                region_abbr: record.region_abbr.clone(),
                region_name: record.region_name.clone(),
                locator_changed_at: record.locator_changed_at,
                locator: record.locator.clone(),
                position_observed_at: record.position_observed_at,
            },
            geometry: Geometry {
                kind: "Point".to_string(),
                coordinates: [
                    round5(record.position.longitude),
                    round5(record.position.latitude),
                ],
            },
        }
    }

    fn into_record(self) -> StationRecord {
        let p = self.properties;
        let [longitude, latitude] = self.geometry.coordinates;
        StationRecord {
            call: p.call,
            is_registered: p.is_registered,
            position: Coordinate::new(longitude, latitude),
            position_observed_at: p.position_observed_at,
            locator: p.locator,
            locator_changed_at: p.locator_changed_at,
            region_abbr: p.region_abbr,
            region_name: p.region_name,
            region_changed_at: p.region_changed_at,
        }
    }
}

fn round5(value: f64) -> f64 {
    (value * 100_000.0).round() / 100_000.0
}

/// Marker label: `HH:MM GMT - ABBR - Name` of the last position report.
#[must_use]
pub fn display_text(record: &StationRecord) -> String {
    format!(
        "{} GMT - {} - {}",
        record.position_observed_at.format("%H:%M"),
        record.region_abbr,
        record.region_name
    )
}

/// Writes and reads the artifacts in one output directory.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    dir: PathBuf,
}

impl OutputWriter {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rewrite both feature collections.
    ///
    /// Expired stations are evicted from `db` first. Features are ordered by
    /// most recent region change and numbered across both documents.
    pub fn write_features(
        &self,
        db: &mut StationDatabase,
        now: DateTime<Utc>,
    ) -> Result<(), OutputError> {
        db.evict_expired(now);

        let mut records: Vec<&StationRecord> = db.records().collect();
        records.sort_by(|a, b| {
            b.region_changed_at
                .cmp(&a.region_changed_at)
                .then_with(|| a.call.cmp(&b.call))
        });

        let mut registered = FeatureCollection::new();
        let mut unregistered = FeatureCollection::new();

        for (index, record) in records.into_iter().enumerate() {
            let feature = Feature::from_record(index + 1, record);
            if record.is_registered {
                registered.features.push(feature);
            } else {
                unregistered.features.push(feature);
            }
        }

        self.write_atomic(REGISTERED_FEATURES, &serde_json::to_vec(&registered)?)?;
        self.write_atomic(UNREGISTERED_FEATURES, &serde_json::to_vec(&unregistered)?)?;
        Ok(())
    }

    /// Rewrite the registered-station summary table.
    ///
    /// Expired stations are evicted from `db` first. Rows are ordered by most
    /// recent position report.
    pub fn write_summary(
        &self,
        db: &mut StationDatabase,
        now: DateTime<Utc>,
    ) -> Result<(), OutputError> {
        db.evict_expired(now);

        let mut records: Vec<&StationRecord> = db.records().filter(|r| r.is_registered).collect();
        records.sort_by(|a, b| {
            b.position_observed_at
                .cmp(&a.position_observed_at)
                .then_with(|| a.call.cmp(&b.call))
        });

        let mut table = csv::Writer::from_writer(Vec::new());

        table.write_record(now.format("%m-%d-%Y,%H%M,GMT,SPOT").to_string().split(','))?;
        table.write_record(["QP CALL", "C&IC", "AGE", "AGE"])?;
        for record in records {
            let region_age = (now - record.region_changed_at).num_minutes();
            let position_age = (now - record.position_observed_at).num_minutes();
            table.write_record([
                record.call.as_str(),
                record.region_abbr.as_str(),
                &region_age.to_string(),
                &position_age.to_string(),
            ])?;
        }
        table.write_record(["", "", "", ""])?;

        let bytes = table.into_inner().map_err(|e| OutputError::Io {
            path: self.dir.join(SUMMARY_TABLE),
            source: e.into_error(),
        })?;
        self.write_atomic(SUMMARY_TABLE, &bytes)
    }

    /// Write both artifacts.
    pub fn flush(&self, db: &mut StationDatabase, now: DateTime<Utc>) -> Result<(), OutputError> {
        self.write_features(db, now)?;
        self.write_summary(db, now)
    }

    /// Read back every station from both feature collections.
    ///
    /// Missing or unreadable documents contribute nothing.
    #[must_use]
    pub fn read_features(&self) -> Vec<StationRecord> {
        let mut records = Vec::new();

        for name in [REGISTERED_FEATURES, UNREGISTERED_FEATURES] {
            let path = self.dir.join(name);
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    debug!("No prior snapshot at {}: {e}", path.display());
                    continue;
                }
            };

            match serde_json::from_str::<FeatureCollection>(&text) {
                Ok(collection) => {
                    records.extend(collection.features.into_iter().map(Feature::into_record));
                }
                Err(e) => warn!("Discarding malformed snapshot {}: {e}", path.display()),
            }
        }

        records
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), OutputError> {
        let path = self.dir.join(name);
        let temp_path = path.with_extension("tmp");
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| OutputError::Io { path, source }
        };

        fs::create_dir_all(&self.dir).map_err(io(&self.dir))?;
        fs::write(&temp_path, bytes).map_err(io(&temp_path))?;
        fs::rename(&temp_path, &path).map_err(io(&path))?;
        Ok(())
    }
}
