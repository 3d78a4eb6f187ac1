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

//! Minimal KML reader for boundary overlays.
//!
//! Only `<Placemark>`, `<name>` and `<coordinates>` are looked at. Placemark
//! names take the form `Fauquier=FAU 1`; placemarks without a `Name=ABBR`
//! pair are ignored.

use std::sync::OnceLock;

use log::debug;
use regex::Regex;

use super::{Boundary, GeofenceError};

fn placemark_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<Placemark\b[^>]*>(.*?)</Placemark>").expect("valid placemark regex")
    })
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)<name>(.*?)</name>").expect("valid name regex"))
}

fn label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\w+)=(\w+)").expect("valid label regex"))
}

fn coordinates_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<coordinates>(.*?)</coordinates>").expect("valid coordinates regex")
    })
}

/// Extract every labelled placemark as a boundary.
pub(super) fn parse_boundaries(text: &str) -> Result<Vec<Boundary>, GeofenceError> {
    let mut boundaries = Vec::new();

    for placemark in placemark_pattern().captures_iter(text) {
        let body = &placemark[1];

        let Some((name, abbr)) = name_pattern()
            .captures_iter(body)
            .find_map(|n| label(&n[1]))
        else {
            continue;
        };

        debug!("Loading {abbr}({name})");
        let mut boundary = Boundary::new(name, abbr);

        for coords in coordinates_pattern().captures_iter(body) {
            let ring = parse_ring(&coords[1]).map_err(|reason| GeofenceError::Malformed {
                placemark: boundary.name.clone(),
                reason,
            })?;
            if !ring.is_empty() {
                boundary.add_ring(ring);
            }
        }

        if boundary.vertices().is_empty() {
            return Err(GeofenceError::Malformed {
                placemark: boundary.name,
                reason: "no coordinates".to_string(),
            });
        }

        boundaries.push(boundary);
    }

    Ok(boundaries)
}

fn label(text: &str) -> Option<(String, String)> {
    label_pattern()
        .captures(text)
        .map(|c| (c[1].to_string(), c[2].to_string()))
}

/// Parse whitespace-separated `lon,lat[,alt]` tuples.
fn parse_ring(text: &str) -> Result<Vec<(f64, f64)>, String> {
    text.split_whitespace()
        .map(|tuple| {
            let mut fields = tuple.split(',');
            let x = fields.next().and_then(|v| v.parse::<f64>().ok());
            let y = fields.next().and_then(|v| v.parse::<f64>().ok());
            match (x, y) {
                (Some(x), Some(y)) => Ok((x, y)),
                _ => Err(format!("bad coordinate tuple '{tuple}'")),
            }
        })
        .collect()
}
