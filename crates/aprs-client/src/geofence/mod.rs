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

//! Geofencing against county and independent-city boundaries.
//!
//! Boundaries are loaded from a KML overlay whose placemark names carry
//! `Name=ABBR`. A position resolves to the boundary that contains it; when a
//! city sits inside a county both report containment and the nested one wins.

mod kml;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Abbreviation reserved for "no boundary matched".
pub const UNKNOWN_ABBR: &str = "UNK";

/// Errors that can occur while loading a boundary set.
#[derive(Debug, Error)]
pub enum GeofenceError {
    #[error("failed to read boundary file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed boundary data in '{placemark}': {reason}")]
    Malformed { placemark: String, reason: String },

    #[error("boundary file contains no usable placemarks")]
    Empty,
}

/// A longitude/latitude pair in signed decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub longitude: f64,
    pub latitude: f64,
}

impl Coordinate {
    #[must_use]
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    /// (0, 0) shows up from misconfigured trackers and is never a real fix.
    #[must_use]
    #[allow(clippy::float_cmp, reason = "decoders produce an exact zero for 0000.00")]
    pub fn is_null_island(&self) -> bool {
        self.longitude == 0.0 && self.latitude == 0.0
    }
}

/// A named administrative region.
#[derive(Debug, Clone, PartialEq)]
pub struct Boundary {
    pub name: String,
    pub abbr: String,
    /// Closed ring(s) of (x, y) = (longitude, latitude) vertices.
    vertices: Vec<(f64, f64)>,
    area: f64,
}

impl Boundary {
    #[must_use]
    pub fn new(name: impl Into<String>, abbr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            abbr: abbr.into(),
            vertices: Vec::new(),
            area: 0.0,
        }
    }

    /// The sentinel returned when nothing matches.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new("Unknown", UNKNOWN_ABBR)
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.abbr == UNKNOWN_ABBR
    }

    /// Append a ring, closing it with the boundary's first vertex.
    pub fn add_ring(&mut self, ring: impl IntoIterator<Item = (f64, f64)>) {
        self.vertices.extend(ring);
        if let Some(&first) = self.vertices.first() {
            self.vertices.push(first);
        }
        self.area = shoelace_area(&self.vertices);
    }

    #[must_use]
    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.vertices
    }

    #[must_use]
    pub fn first_vertex(&self) -> Option<(f64, f64)> {
        self.vertices.first().copied()
    }

    /// Unsigned planar area in square degrees.
    #[must_use]
    pub fn area(&self) -> f64 {
        self.area
    }

    /// Tally-folded ray test over every edge of the vertex sequence.
    ///
    /// Each edge spanning the point's x contributes -1 when the edge lies
    /// below the point and +1 otherwise. An edge whose endpoint shares the
    /// point's x is decided by that endpoint's y alone. The point is inside
    /// when `(edges - |tally|) mod 4 != 0`.
    #[must_use]
    #[allow(clippy::float_cmp, reason = "vertex hits are exact comparisons")]
    pub fn contains(&self, point: (f64, f64)) -> bool {
        let (x, y) = point;
        let mut tally: i64 = 0;
        let mut edges: i64 = 0;

        for edge in self.vertices.windows(2) {
            let (x1, y1) = edge[0];
            let (x2, y2) = edge[1];

            let below = if x == x1 {
                y1 < y
            } else if x == x2 {
                y2 < y
            } else if (x >= x1 && x <= x2) || (x >= x2 && x <= x1) {
                let m = (y2 - y1) / (x2 - x1);
                let b = y1 - m * x1;
                m * x + b < y
            } else {
                continue;
            };

            tally += if below { -1 } else { 1 };
            edges += 1;
        }

        (edges - tally.abs()) % 4 != 0
    }
}

fn shoelace_area(vertices: &[(f64, f64)]) -> f64 {
    let twice: f64 = vertices
        .windows(2)
        .map(|e| e[0].0 * e[1].1 - e[1].0 * e[0].1)
        .sum();
    (twice / 2.0).abs()
}

/// Resolves positions to boundaries.
#[derive(Debug, Default)]
pub struct GeofenceEngine {
    boundaries: Vec<Boundary>,
    unknown: Boundary,
    miss_reported: AtomicBool,
}

impl Default for Boundary {
    fn default() -> Self {
        Self::unknown()
    }
}

impl GeofenceEngine {
    #[must_use]
    pub fn new(boundaries: Vec<Boundary>) -> Self {
        Self {
            boundaries,
            unknown: Boundary::unknown(),
            miss_reported: AtomicBool::new(false),
        }
    }

    /// Load boundaries from a KML overlay file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GeofenceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let engine = Self::from_kml(&text)?;
        info!(
            "Loaded {} boundaries from {}",
            engine.len(),
            path.display()
        );
        Ok(engine)
    }

    /// Parse boundaries from KML text.
    pub fn from_kml(text: &str) -> Result<Self, GeofenceError> {
        let boundaries = kml::parse_boundaries(text)?;
        if boundaries.is_empty() {
            return Err(GeofenceError::Empty);
        }
        Ok(Self::new(boundaries))
    }

    #[must_use]
    pub fn boundaries(&self) -> &[Boundary] {
        &self.boundaries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    /// Find the boundary containing `coord`, or the unknown sentinel.
    #[must_use]
    pub fn resolve(&self, coord: Coordinate) -> &Boundary {
        let point = (coord.longitude, coord.latitude);
        let matches: Vec<&Boundary> = self
            .boundaries
            .iter()
            .filter(|b| b.contains(point))
            .collect();

        let winner = match matches.len() {
            0 => {
                if !self.miss_reported.swap(true, Ordering::Relaxed) {
                    warn!(
                        "Position {:.5},{:.5} did not match any boundary",
                        coord.latitude, coord.longitude
                    );
                }
                return &self.unknown;
            }
            1 => matches[0],
            _ => innermost(&matches),
        };

        self.miss_reported.store(false, Ordering::Relaxed);
        winner
    }
}

/// Pick the nested boundary among overlapping matches.
///
/// A match that contains another match's first vertex encloses it and loses.
/// Among the remaining candidates (or all matches, if none remain) the
/// smallest area wins, earliest loaded on ties.
fn innermost<'a>(matches: &[&'a Boundary]) -> &'a Boundary {
    let encloses_none = |i: usize| {
        matches.iter().enumerate().all(|(j, other)| {
            i == j
                || other
                    .first_vertex()
                    .map_or(true, |vertex| !matches[i].contains(vertex))
        })
    };

    let candidates: Vec<&Boundary> = (0..matches.len())
        .filter(|&i| encloses_none(i))
        .map(|i| matches[i])
        .collect();
    let pool = if candidates.is_empty() {
        matches
    } else {
        &candidates[..]
    };

    pool.iter()
        .copied()
        .reduce(|best, b| if b.area() < best.area() { b } else { best })
        .unwrap_or(matches[0])
}
