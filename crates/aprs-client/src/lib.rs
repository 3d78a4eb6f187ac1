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

//! APRS-IS client library for tracking QSO party mobile stations.
//!
//! The crate is split into layers that can be used on their own or wired
//! together through a [`Pipeline`] and a [`SessionHandle`]:
//!
//! - **Protocol layer**: packet classification and the two position encodings
//!   (uncompressed `DDMM.mmN/DDDMM.mmW` and Mic-E)
//! - **Geofence layer**: county/city polygons loaded from KML, with nested
//!   boundary disambiguation
//! - **Locator**: six-character Maidenhead grid
//! - **Tracker layer**: per-station records with change detection and age-out
//! - **Output layer**: GeoJSON feature collections and a CSV summary for the
//!   map front end
//! - **Connection layer**: the APRS-IS login/filter/stream state machine with
//!   watchdog reconnection, plus offline replay
//!
//! # Quick Start
//!
//! ```no_run
//! use aprs_client::{
//!     CallRegistry, GeofenceEngine, OutputWriter, Pipeline, RunMode, SessionConfig,
//!     SessionHandle, StationDatabase, TcpConnector,
//! };
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (events, _) = broadcast::channel(256);
//!     let pipeline = Pipeline::new(
//!         GeofenceEngine::load("va-counties.kml")?,
//!         CallRegistry::load("qp-calls.txt")?,
//!         "VQP|VAQP",
//!         StationDatabase::shared(chrono::Duration::hours(4)),
//!         OutputWriter::new("www"),
//!         events,
//!     )?;
//!
//!     let config = SessionConfig {
//!         mode: RunMode::Unattended,
//!         ..Default::default()
//!     };
//!     let mut session = SessionHandle::spawn(config, TcpConnector, pipeline);
//!     session.join().await;
//!     Ok(())
//! }
//! ```
//!
//! # Using Individual Layers
//!
//! ```
//! use aprs_client::{locate, protocol::decode_position};
//!
//! let line = "W4VA-10>APN391,TCPIP*,qAC,THIRD:!3844.04NR07750.16W&PHG5660";
//! let position = decode_position(line).unwrap();
//! assert_eq!(locate(position), "FM18br");
//! ```

pub mod geofence;
pub mod locator;
pub mod output;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod replay;
pub mod tcp;
pub mod tracker;

pub use geofence::{Boundary, Coordinate, GeofenceEngine, GeofenceError, UNKNOWN_ABBR};
pub use locator::locate;
pub use output::{OutputError, OutputWriter};
pub use pipeline::{LineOutcome, Pipeline, PipelineError, DEFAULT_MARKER};
pub use protocol::{DecodeError, PacketLine, PositionReport};
pub use registry::{CallRegistry, RegistryError};
pub use replay::{replay_file, ReplayError, ReplaySummary};
pub use tcp::{
    Connector, RetryPolicy, RunMode, SessionConfig, SessionError, SessionEvent, SessionHandle,
    SessionState, TcpConnector,
};
pub use tracker::{ChangeSet, SharedStations, StationDatabase, StationRecord};
