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

//! Protocol layer for APRS-IS packet lines.
//!
//! Each received line is classified into a [`PacketLine`]: server status,
//! unrecognized traffic, a station packet without a usable position, or a
//! position report. Positions are extracted by trying the uncompressed
//! decimal-minutes form first and the Mic-E form second.

mod decimal;
mod mic_e;

pub use decimal::decode_decimal;
pub use mic_e::decode_mic_e;

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::geofence::Coordinate;

/// Errors that can occur while decoding a position.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("packet does not contain a recognizable position")]
    NoCoordinate,

    #[error("invalid value for field '{field}': {value}")]
    InvalidField { field: &'static str, value: String },
}

/// A station packet carrying a decoded position.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    /// Source call sign including any SSID suffix (e.g., "W4VA-10").
    pub call: String,
    /// Decoded position.
    pub coordinate: Coordinate,
}

/// Classification of one line received from APRS-IS.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketLine {
    /// Server banner, keepalive or command response (`# ...`).
    Status,
    /// No call-sign header; not a station packet we understand.
    Unrecognized,
    /// Station packet whose body has no decodable position.
    NoPosition { call: String },
    /// Station packet with a position.
    Position(PositionReport),
}

fn call_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"([A-Z]{1,2}[0-9][A-Z]{1,3}[-0-9]*)>").expect("valid call sign regex")
    })
}

fn ssid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"-\w+").expect("valid SSID regex"))
}

/// Classify a raw line and decode its position if it has one.
#[must_use]
pub fn classify(line: &str) -> PacketLine {
    if line.starts_with('#') {
        return PacketLine::Status;
    }

    let Some(caps) = call_pattern().captures(line) else {
        return PacketLine::Unrecognized;
    };
    let call = caps[1].to_string();

    match decode_position(line) {
        Ok(coordinate) => PacketLine::Position(PositionReport { call, coordinate }),
        Err(_) => PacketLine::NoPosition { call },
    }
}

/// Extract a position using whichever supported encoding matches first.
pub fn decode_position(line: &str) -> Result<Coordinate, DecodeError> {
    match decode_decimal(line) {
        Err(DecodeError::NoCoordinate) => decode_mic_e(line.as_bytes()),
        other => other,
    }
}

/// Strip the SSID suffix from a call sign ("W4VA-10" -> "W4VA").
#[must_use]
pub fn short_call(call: &str) -> String {
    ssid_pattern().replace_all(call, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line() {
        assert_eq!(classify("# aprsc 2.1.14-g5e22b37"), PacketLine::Status);
        assert_eq!(
            classify("# logresp NOCALL unverified, server T2VAN"),
            PacketLine::Status
        );
    }

    #[test]
    fn test_unrecognized_source() {
        // Object names and lowercase sources do not look like call signs.
        assert_eq!(
            classify("weather>APRS,TCPIP*:!3844.04N/07750.16W_"),
            PacketLine::Unrecognized
        );
    }

    #[test]
    fn test_position_report() {
        let line = "W4VA-10>APDW14,WIDE1-1,WIDE2-1,qAR,W4TTU:!3844.04NR07750.16W&PHG3660";
        match classify(line) {
            PacketLine::Position(report) => {
                assert_eq!(report.call, "W4VA-10");
                assert!((report.coordinate.latitude - 38.734).abs() < 1e-3);
                assert!((report.coordinate.longitude - -77.836).abs() < 1e-3);
            }
            other => panic!("expected position, got {other:?}"),
        }
    }

    #[test]
    fn test_mic_e_fallback() {
        let line = r#"W3VPS-7>S8UV6P,NV4FM-5,WIDE1*,WIDE2-1,qAR,W4KEL-12:`i+? ]F[/>"5"}^"#;
        assert!(matches!(classify(line), PacketLine::Position(r) if r.call == "W3VPS-7"));
    }

    #[test]
    fn test_packet_without_position() {
        let line = "K1RA>APRS,TCPIP*,qAC,T2TEXAS:>Operating VAQP mobile";
        assert_eq!(
            classify(line),
            PacketLine::NoPosition {
                call: "K1RA".to_string()
            }
        );
    }

    #[test]
    fn test_short_call() {
        assert_eq!(short_call("W4VA-10"), "W4VA");
        assert_eq!(short_call("K1RA"), "K1RA");
        assert_eq!(short_call("KG4IXS-9"), "KG4IXS");
    }
}
