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

//! Replay a captured packet log end to end: decode, geofence, track, persist.

use std::fs;
use std::path::Path;
use std::time::Duration;

use aprs_client::output::{REGISTERED_FEATURES, SUMMARY_TABLE, UNREGISTERED_FEATURES};
use aprs_client::{
    replay_file, CallRegistry, GeofenceEngine, OutputWriter, Pipeline, SessionEvent,
    StationDatabase, DEFAULT_MARKER,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const BOUNDARIES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://earth.google.com/kml/2.1"><Document>
<Placemark><name>Fauquier=FAU</name><Polygon><outerBoundaryIs><LinearRing><coordinates>
-78.0,38.5,0 -77.5,38.5,0 -77.5,39.0,0 -78.0,39.0,0
</coordinates></LinearRing></outerBoundaryIs></Polygon></Placemark>
<Placemark><name>Fairfax=FFX</name><Polygon><outerBoundaryIs><LinearRing><coordinates>
-77.5,38.6,0 -77.0,38.6,0 -77.0,39.1,0 -77.5,39.1,0
</coordinates></LinearRing></outerBoundaryIs></Polygon></Placemark>
<Placemark><name>FairfaxCity=FXC</name><Polygon><outerBoundaryIs><LinearRing><coordinates>
-77.35,38.90,0 -77.20,38.90,0 -77.20,38.98,0 -77.35,38.98,0
</coordinates></LinearRing></outerBoundaryIs></Polygon></Placemark>
</Document></kml>"#;

const CAPTURE: &str = concat!(
    "# aprsc 2.1.14-g5e22494 18 Oct 2026 12:00:00 GMT T2TEST 1.2.3.4:14580\n",
    "W4VA-10>APN391,TCPIP*,qAC,THIRD:!3844.04NR07750.16W&PHG5660/W4VA Warrenton VA\n",
    "W3VPS-7>S8UV6P,NV4FM-5,WIDE1*,WIDE2-1,qAR,W4KEL-12:`i+? ]F[/>\"5\"}^\n",
    "K4XYZ-9>APRS,TCPIP*:!3844.00N/07740.00W>VQP mobile\n",
    "KB1ABC>APRS,TCPIP*:!3700.00N/07600.00W>outside the state\n",
    "N0CAL>APRS:!0000.00N/00000.00W>\n",
    "garbage line\n",
);

fn setup(dir: &Path) -> (Pipeline, broadcast::Receiver<SessionEvent>) {
    let kml = dir.join("boundaries.kml");
    let calls = dir.join("qp-calls.txt");
    fs::write(&kml, BOUNDARIES).unwrap();
    if !calls.exists() {
        fs::write(&calls, "W3VPS-7\n").unwrap();
    }

    let (events, rx) = broadcast::channel(256);
    let pipeline = Pipeline::new(
        GeofenceEngine::load(&kml).unwrap(),
        CallRegistry::load(&calls).unwrap(),
        DEFAULT_MARKER,
        StationDatabase::shared(chrono::Duration::hours(4)),
        OutputWriter::new(dir.join("www")),
        events,
    )
    .unwrap();
    (pipeline, rx)
}

fn feature_calls(path: &Path) -> Vec<String> {
    let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
    let mut calls: Vec<String> = doc["features"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["properties"]["call"].as_str().unwrap().to_string())
        .collect();
    calls.sort();
    calls
}

#[tokio::test]
async fn test_replay_capture_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("capture.log");
    fs::write(&capture, CAPTURE).unwrap();

    let (mut pipeline, mut events) = setup(dir.path());
    let summary = replay_file(&capture, &mut pipeline, Duration::ZERO, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.lines, 7);
    assert_eq!(summary.positions, 4);
    assert_eq!(summary.tracked, 3);
    assert!(!summary.cancelled);

    {
        let db = pipeline.stations().lock().unwrap();
        assert_eq!(db.len(), 3);
        assert_eq!(db.get("W4VA-10").unwrap().region_abbr, "FAU");
        // Mic-E position inside the city that sits inside the county.
        assert_eq!(db.get("W3VPS-7").unwrap().region_abbr, "FXC");
        assert!(db.get("K4XYZ-9").unwrap().is_registered);
        assert!(db.get("KB1ABC").is_none());
    }

    let www = dir.path().join("www");
    assert_eq!(
        feature_calls(&www.join(REGISTERED_FEATURES)),
        vec!["K4XYZ-9".to_string(), "W3VPS-7".to_string()]
    );
    assert_eq!(
        feature_calls(&www.join(UNREGISTERED_FEATURES)),
        vec!["W4VA-10".to_string()]
    );

    let table = fs::read_to_string(www.join(SUMMARY_TABLE)).unwrap();
    let lines: Vec<&str> = table.lines().collect();
    assert_eq!(lines[1], "QP CALL,C&IC,AGE,AGE");
    assert!(lines.contains(&"W3VPS-7,FXC,0,0"));
    assert!(lines.contains(&"K4XYZ-9,FAU,0,0"));
    assert_eq!(lines.last(), Some(&",,,"));

    // Marker hit was appended to the registry file.
    let calls = fs::read_to_string(dir.path().join("qp-calls.txt")).unwrap();
    assert_eq!(calls, "W3VPS-7\nK4XYZ-9\n");

    let mut saw_complete = false;
    while let Ok(event) = events.try_recv() {
        if event == SessionEvent::ReplayComplete {
            saw_complete = true;
        }
    }
    assert!(saw_complete);
}

#[tokio::test]
async fn test_warm_restart_from_replay_output() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("capture.log");
    fs::write(&capture, CAPTURE).unwrap();

    let (mut first, _events) = setup(dir.path());
    replay_file(&capture, &mut first, Duration::ZERO, &CancellationToken::new())
        .await
        .unwrap();
    drop(first);

    let (second, _events) = setup(dir.path());
    assert!(second.registry().contains("K4XYZ-9"));
    second.restore_snapshot();

    let db = second.stations().lock().unwrap();
    assert_eq!(db.len(), 3);
    let record = db.get("W3VPS-7").unwrap();
    assert_eq!(record.region_name, "FairfaxCity");
    assert!(record.is_registered);
}

#[tokio::test(start_paused = true)]
async fn test_replay_cancelled_mid_file() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("capture.log");
    fs::write(&capture, CAPTURE).unwrap();

    let (mut pipeline, _events) = setup(dir.path());
    let cancel_token = CancellationToken::new();

    let canceller = cancel_token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let summary = replay_file(&capture, &mut pipeline, Duration::from_millis(200), &cancel_token)
        .await
        .unwrap();
    // Lines go through at 200 ms and 400 ms; the 600 ms pause is cut short.
    assert!(summary.cancelled);
    assert_eq!(summary.lines, 2);
}

#[tokio::test]
async fn test_missing_capture_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let (mut pipeline, _events) = setup(dir.path());
    let result = replay_file(
        &dir.path().join("missing.log"),
        &mut pipeline,
        Duration::ZERO,
        &CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
}
