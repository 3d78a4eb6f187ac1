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

//! Uncompressed (degrees + decimal minutes) APRS position format.
//!
//! ```text
//! W4VA-10>APDW14,WIDE1-1,WIDE2-1,qAR,W4TTU:!3844.04NR07750.16W&PHG3660...
//!                                           ^^^^^^^^ ^^^^^^^^^
//!                                           DDMM.mmN DDDMM.mmW
//! ```
//!
//! The position must follow an information-field colon. A colon directly
//! followed by `;` introduces an object report and is skipped.

use std::sync::OnceLock;

use regex::Regex;

use super::DecodeError;
use crate::geofence::Coordinate;

/// Anchored at the start of the text after a colon. The greedy `.*` makes the
/// last position-shaped run in the remainder win.
fn position_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^.*([0-9]{4}\.[0-9 ]{2})([NS]).{1,2}([0-9]{5}\.[0-9 ]{2})([WE])")
            .expect("valid decimal position regex")
    })
}

/// Decode a `DDMM.mm[NS] .. DDDMM.mm[WE]` position from a raw packet line.
pub fn decode_decimal(line: &str) -> Result<Coordinate, DecodeError> {
    for (idx, _) in line.match_indices(':') {
        let rest = &line[idx + 1..];
        if rest.starts_with(';') {
            continue;
        }

        let Some(caps) = position_pattern().captures(rest) else {
            continue;
        };

        let mut latitude = degrees_minutes(&caps[1], 2, "latitude")?;
        if &caps[2] == "S" {
            latitude = -latitude;
        }

        let mut longitude = degrees_minutes(&caps[3], 3, "longitude")?;
        if &caps[4] == "W" {
            longitude = -longitude;
        }

        return Ok(Coordinate::new(longitude, latitude));
    }

    Err(DecodeError::NoCoordinate)
}

/// Split `DDMM.mm` at `degree_digits` and fold minutes into degrees.
///
/// Blanks in the hundredths (position ambiguity) read as zero.
fn degrees_minutes(text: &str, degree_digits: usize, field: &'static str) -> Result<f64, DecodeError> {
    let invalid = || DecodeError::InvalidField {
        field,
        value: text.to_string(),
    };

    let (deg, min) = text.split_at(degree_digits);
    let degrees: f64 = deg.parse().map_err(|_| invalid())?;
    let minutes: f64 = min.replace(' ', "0").parse().map_err(|_| invalid())?;

    Ok(degrees + minutes / 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-3,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_decode_digipeater_beacon() {
        let line = "W4VA-10>APDW14,WIDE1-1,WIDE2-1,qAR,W4TTU:!3844.04NR07750.16W&PHG3660Viewtree Mtn, Warrenton, VA FM18br";
        let coord = decode_decimal(line).unwrap();
        assert_close(coord.longitude, -77.8360);
        assert_close(coord.latitude, 38.7340);
    }

    #[test]
    fn test_decode_timestamped_weather_report() {
        let line = "WD4ITN>APRS,TCPIP*,qAC,THIRD:@261903z3824.42N/07934.85W_333/002g...t044r...p...P000h50b10222.DsVP";
        let coord = decode_decimal(line).unwrap();
        assert_close(coord.latitude, 38.0 + 24.42 / 60.0);
        assert_close(coord.longitude, -(79.0 + 34.85 / 60.0));
    }

    #[test]
    fn test_southern_and_eastern_hemispheres() {
        let line = "VK2ABC>APRS,TCPIP*:!3351.50S/15112.30E-";
        let coord = decode_decimal(line).unwrap();
        assert_close(coord.latitude, -(33.0 + 51.5 / 60.0));
        assert_close(coord.longitude, 151.0 + 12.3 / 60.0);
    }

    #[test]
    fn test_ambiguous_hundredths_read_as_zero() {
        let line = "N0CALL>APRS:!3844.  N/07750.  W>";
        let coord = decode_decimal(line).unwrap();
        assert_close(coord.latitude, 38.0 + 44.0 / 60.0);
        assert_close(coord.longitude, -(77.0 + 50.0 / 60.0));
    }

    #[test]
    fn test_object_report_is_skipped() {
        let object_only = "N0CALL>APRS,TCPIP*:;EVENT    *111111z3844.04N/07750.16W-";
        assert!(matches!(
            decode_decimal(object_only),
            Err(DecodeError::NoCoordinate)
        ));
    }

    #[test]
    fn test_no_position() {
        let line = "N0CALL>APRS,TCPIP*:>status text only";
        assert!(matches!(decode_decimal(line), Err(DecodeError::NoCoordinate)));
    }
}
