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

//! Per-line processing shared by the live session and replay.
//!
//! classify → decode → register → locate → geofence → database → persist.

use std::sync::PoisonError;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::broadcast;

use crate::geofence::GeofenceEngine;
use crate::locator::locate;
use crate::output::OutputWriter;
use crate::protocol::{classify, PacketLine};
use crate::registry::CallRegistry;
use crate::tcp::SessionEvent;
use crate::tracker::{ChangeSet, SharedStations};

/// Run synchronous file I/O from async code.
///
/// On a multi-threaded runtime the current worker hands its other tasks off
/// first; a current-thread runtime runs `f` inline.
pub(crate) fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::current().runtime_flavor() {
        RuntimeFlavor::MultiThread => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// Default participation marker for the Virginia QSO Party.
pub const DEFAULT_MARKER: &str = "VQP|VAQP";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid participation marker '{pattern}': {source}")]
    InvalidMarker {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// What happened to one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Server comment or keepalive.
    Status,
    /// No station header.
    Unrecognized,
    /// Station packet without a position.
    NoPosition { call: String },
    /// Decoded to exactly (0, 0); ignored.
    NullIsland { call: String },
    /// Outside every boundary; any stored record was dropped.
    OutOfBounds { call: String },
    /// Stored or refreshed.
    Tracked {
        call: String,
        registered: bool,
        changes: ChangeSet,
    },
}

/// Everything needed to turn a packet line into database and artifact updates.
#[derive(Debug)]
pub struct Pipeline {
    geofence: GeofenceEngine,
    registry: CallRegistry,
    marker: Regex,
    stations: SharedStations,
    writer: OutputWriter,
    events: broadcast::Sender<SessionEvent>,
}

impl Pipeline {
    /// Build a pipeline. `marker` is matched case-insensitively anywhere in
    /// the packet to auto-register participants.
    pub fn new(
        geofence: GeofenceEngine,
        registry: CallRegistry,
        marker: &str,
        stations: SharedStations,
        writer: OutputWriter,
        events: broadcast::Sender<SessionEvent>,
    ) -> Result<Self, PipelineError> {
        let marker = RegexBuilder::new(marker)
            .case_insensitive(true)
            .build()
            .map_err(|source| PipelineError::InvalidMarker {
                pattern: marker.to_string(),
                source,
            })?;

        Ok(Self {
            geofence,
            registry,
            marker,
            stations,
            writer,
            events,
        })
    }

    #[must_use]
    pub fn stations(&self) -> &SharedStations {
        &self.stations
    }

    #[must_use]
    pub fn writer(&self) -> &OutputWriter {
        &self.writer
    }

    #[must_use]
    pub fn registry(&self) -> &CallRegistry {
        &self.registry
    }

    #[must_use]
    pub fn geofence(&self) -> &GeofenceEngine {
        &self.geofence
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn status(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{text}");
        self.emit(SessionEvent::Status(text));
    }

    /// Re-read the call registry if its file changed.
    pub fn reload_registry(&mut self) {
        match self.registry.reload_if_changed() {
            Ok(true) => self.status("Reloaded QP calls list"),
            Ok(false) => {}
            Err(e) => warn!("Failed to check call registry: {e}"),
        }
    }

    /// Seed the database from the feature collections left by a prior run.
    pub fn restore_snapshot(&self) {
        self.status("Reading any available, prior JSON backup files");
        let records = self.writer.read_features();
        let count = records.len();
        let mut db = self.stations.lock().unwrap_or_else(PoisonError::into_inner);
        db.load_snapshot(records);
        debug!("Restored {} of {count} stations", db.len());
    }

    /// Evict expired stations and rewrite every artifact.
    pub fn flush(&self, now: DateTime<Utc>) {
        let mut db = self.stations.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = self.writer.flush(&mut db, now) {
            warn!("Failed to write output: {e}");
        }
    }

    /// Process one line received at `now`.
    pub fn process_line(&mut self, line: &str, now: DateTime<Utc>) -> LineOutcome {
        let report = match classify(line) {
            PacketLine::Status => return LineOutcome::Status,
            PacketLine::Unrecognized => return LineOutcome::Unrecognized,
            PacketLine::NoPosition { call } => {
                info!(target: "aprs", "{line}");
                return LineOutcome::NoPosition { call };
            }
            PacketLine::Position(report) => {
                info!(target: "aprs", "{line}");
                report
            }
        };

        let call = report.call;
        let coordinate = report.coordinate;

        if coordinate.is_null_island() {
            debug!("Ignoring 0,0 position from {call}");
            return LineOutcome::NullIsland { call };
        }

        self.emit(SessionEvent::Position {
            call: call.clone(),
            coordinate,
        });

        if self.marker.is_match(line) {
            if let Err(e) = self.registry.add(&call) {
                warn!("{e}");
            }
        }
        let registered = self.registry.contains(&call);

        let locator = locate(coordinate);
        self.emit(SessionEvent::Locator(locator.clone()));

        let region = self.geofence.resolve(coordinate);

        let mut db = self.stations.lock().unwrap_or_else(PoisonError::into_inner);

        let outcome = if region.is_unknown() {
            db.remove(&call);
            LineOutcome::OutOfBounds { call }
        } else {
            self.emit(SessionEvent::Region {
                name: region.name.clone(),
                abbr: region.abbr.clone(),
            });

            let changes = db.observe(&call, registered, coordinate, region, &locator, now);
            db.evict_expired(now);

            if registered {
                debug!("QP {call}");
                if let Err(e) = self.writer.write_features(&mut db, now) {
                    warn!("Failed to write features: {e}");
                }
            } else {
                debug!("Non-QP {call}");
            }

            LineOutcome::Tracked {
                call,
                registered,
                changes,
            }
        };

        if let Err(e) = self.writer.write_summary(&mut db, now) {
            warn!("Failed to write summary: {e}");
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geofence::Boundary;
    use crate::output::{REGISTERED_FEATURES, SUMMARY_TABLE, UNREGISTERED_FEATURES};
    use crate::tracker::StationDatabase;
    use chrono::Duration;
    use std::path::Path;

    const W4VA: &str = "W4VA-10>APN391,TCPIP*,qAC,THIRD:!3844.04NR07750.16W&PHG5660/W4VA Warrenton VA";

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn square(name: &str, abbr: &str, x0: f64, y0: f64, size: f64) -> Boundary {
        let mut b = Boundary::new(name, abbr);
        b.add_ring([(x0, y0), (x0 + size, y0), (x0 + size, y0 + size), (x0, y0 + size)]);
        b
    }

    fn pipeline(dir: &Path, registered: &[&str]) -> Pipeline {
        let geofence = GeofenceEngine::new(vec![square("Fauquier", "FAU", -78.0, 38.5, 0.5)]);
        let registry = CallRegistry::in_memory(registered.iter().map(ToString::to_string));
        let (events, _) = broadcast::channel(64);
        Pipeline::new(
            geofence,
            registry,
            DEFAULT_MARKER,
            StationDatabase::shared(Duration::hours(4)),
            OutputWriter::new(dir),
            events,
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_marker() {
        let (events, _) = broadcast::channel(1);
        let result = Pipeline::new(
            GeofenceEngine::default(),
            CallRegistry::default(),
            "VQP(",
            StationDatabase::shared(Duration::hours(4)),
            OutputWriter::new("unused"),
            events,
        );
        assert!(matches!(result, Err(PipelineError::InvalidMarker { .. })));
    }

    #[test]
    fn test_status_and_unrecognized_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), &[]);
        assert_eq!(p.process_line("# aprsc 2.1.14", t(0)), LineOutcome::Status);
        assert_eq!(p.process_line("garbage", t(0)), LineOutcome::Unrecognized);
        assert_eq!(
            p.process_line("K1RA-9>APRS:>status only", t(0)),
            LineOutcome::NoPosition {
                call: "K1RA-9".to_string()
            }
        );
        assert!(!dir.path().join(SUMMARY_TABLE).exists());
    }

    #[test]
    fn test_unregistered_station_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), &[]);
        let mut rx = p.subscribe();

        let outcome = p.process_line(W4VA, t(0));
        assert_eq!(
            outcome,
            LineOutcome::Tracked {
                call: "W4VA-10".to_string(),
                registered: false,
                changes: ChangeSet {
                    locator_changed: true,
                    region_changed: true
                },
            }
        );

        let record = p.stations().lock().unwrap().get("W4VA-10").cloned().unwrap();
        assert_eq!(record.region_abbr, "FAU");
        assert_eq!(record.locator, "FM18br");

        // Summary always written, features only for registered stations.
        assert!(dir.path().join(SUMMARY_TABLE).exists());
        assert!(!dir.path().join(REGISTERED_FEATURES).exists());
        assert!(!dir.path().join(UNREGISTERED_FEATURES).exists());

        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Position { .. }));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Locator("FM18br".to_string()));
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Region {
                name: "Fauquier".to_string(),
                abbr: "FAU".to_string()
            }
        );
    }

    #[test]
    fn test_registered_station_writes_features() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), &["W4VA-10"]);
        p.process_line(W4VA, t(0));
        assert!(dir.path().join(REGISTERED_FEATURES).exists());
        assert!(dir.path().join(UNREGISTERED_FEATURES).exists());
    }

    #[test]
    fn test_marker_auto_registers() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), &[]);
        let line = "K4XYZ-9>APRS,TCPIP*:!3844.04N/07750.16W>mobile in the vqp";
        let outcome = p.process_line(line, t(0));
        assert!(matches!(outcome, LineOutcome::Tracked { registered: true, .. }));
        assert!(p.registry().contains("K4XYZ-9"));
    }

    #[test]
    fn test_leaving_boundaries_drops_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), &[]);
        p.process_line(W4VA, t(0));

        let outside = "W4VA-10>APN391,TCPIP*:!3700.00N/07600.00W&";
        assert_eq!(
            p.process_line(outside, t(60)),
            LineOutcome::OutOfBounds {
                call: "W4VA-10".to_string()
            }
        );
        assert!(p.stations().lock().unwrap().is_empty());
    }

    #[test]
    fn test_null_island_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), &[]);
        let line = "N0CAL>APRS:!0000.00N/00000.00W>";
        assert!(matches!(
            p.process_line(line, t(0)),
            LineOutcome::NullIsland { .. }
        ));
        assert!(p.stations().lock().unwrap().is_empty());
    }

    #[test]
    fn test_restore_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), &["W4VA-10"]);
        p.process_line(W4VA, t(0));

        let restored = pipeline(dir.path(), &[]);
        restored.restore_snapshot();
        let db = restored.stations().lock().unwrap();
        let record = db.get("W4VA-10").unwrap();
        assert!(record.is_registered);
        assert!((record.position.latitude - 38.734).abs() < 1e-3);
        drop(db);

        restored.flush(t(5 * 3600));
        assert!(restored.stations().lock().unwrap().is_empty());
    }

    #[test]
    fn test_registry_hot_reload_applies_to_next_line() {
        use std::fs::{self, File};
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("qp-calls.txt");
        fs::write(&calls, "K1RA\n").unwrap();

        let (events, _) = broadcast::channel(64);
        let mut p = Pipeline::new(
            GeofenceEngine::new(vec![square("Fauquier", "FAU", -78.0, 38.5, 0.5)]),
            CallRegistry::load(&calls).unwrap(),
            DEFAULT_MARKER,
            StationDatabase::shared(Duration::hours(4)),
            OutputWriter::new(dir.path()),
            events,
        )
        .unwrap();

        assert!(matches!(
            p.process_line(W4VA, t(0)),
            LineOutcome::Tracked { registered: false, .. }
        ));

        let mut file = File::options().append(true).open(&calls).unwrap();
        file.write_all(b"W4VA-10\n").unwrap();
        let later = fs::metadata(&calls).unwrap().modified().unwrap()
            + std::time::Duration::from_secs(5);
        file.set_modified(later).unwrap();
        drop(file);

        p.reload_registry();
        assert!(matches!(
            p.process_line(W4VA, t(60)),
            LineOutcome::Tracked { registered: true, .. }
        ));
        assert!(dir.path().join(REGISTERED_FEATURES).exists());
    }

    #[test]
    fn test_flush_recovers_poisoned_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), &[]);
        p.process_line(W4VA, t(0));

        let stations = std::sync::Arc::clone(p.stations());
        let _ = std::thread::spawn(move || {
            let _guard = stations.lock().unwrap();
            panic!("poison the station lock");
        })
        .join();
        assert!(p.stations().is_poisoned());

        p.flush(t(10));
        assert!(dir.path().join(UNREGISTERED_FEATURES).exists());

        p.restore_snapshot();
        let db = p.stations().lock().unwrap_or_else(PoisonError::into_inner);
        assert!(db.get("W4VA-10").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_blocking_on_multi_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), &["W4VA-10"]);
        let outcome = run_blocking(|| p.process_line(W4VA, t(0)));
        assert!(matches!(outcome, LineOutcome::Tracked { registered: true, .. }));
        assert!(dir.path().join(REGISTERED_FEATURES).exists());
    }

    #[tokio::test]
    async fn test_run_blocking_on_current_thread_runtime() {
        assert_eq!(run_blocking(|| 7), 7);
    }
}
