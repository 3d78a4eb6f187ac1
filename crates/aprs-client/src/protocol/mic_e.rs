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

//! Mic-E compressed position format.
//!
//! Latitude rides in the six-character destination address, longitude in the
//! first three bytes after the `` ` `` or `'` data type identifier:
//!
//! ```text
//! W3VPS-7>S8UV6P,NV4FM-5,WIDE1*,WIDE2-1,qAR,W4KEL-12:`i+? ]F[/>"5"}^
//!         ^^^^^^                                      ^^^
//!         lat DD MM HH                                lon D M H (+28)
//! ```
//!
//! Only the subset used by the tracker is decoded: no message bits, no
//! course/speed, and the reported longitude is always west.

use std::sync::OnceLock;

use regex::bytes::Regex;

use super::DecodeError;
use crate::geofence::Coordinate;

const DIGIT_MASK: u8 = 0b0000_1111;
const LONGITUDE_OFFSET_MASK: u8 = 0b1000_0000;
const BYTE_BIAS: i32 = 28;

fn mic_e_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?-u)>(.{6}),.*:[`'](.{3})").expect("valid Mic-E regex")
    })
}

/// Decode a Mic-E position from a raw packet line.
pub fn decode_mic_e(line: &[u8]) -> Result<Coordinate, DecodeError> {
    let caps = mic_e_pattern()
        .captures(line)
        .ok_or(DecodeError::NoCoordinate)?;

    let lat = <[u8; 6]>::try_from(&caps[1]).map_err(|_| DecodeError::NoCoordinate)?;
    let lon = <[u8; 3]>::try_from(&caps[2]).map_err(|_| DecodeError::NoCoordinate)?;

    Ok(Coordinate::new(longitude(&lat, &lon), latitude(&lat)))
}

fn digit(byte: u8) -> f64 {
    f64::from(byte & DIGIT_MASK)
}

fn latitude(dest: &[u8; 6]) -> f64 {
    let degrees = digit(dest[0]) * 10.0 + digit(dest[1]);
    let minutes = digit(dest[2]) * 10.0 + digit(dest[3]);
    let hundredths = digit(dest[4]) * 10.0 + digit(dest[5]);

    degrees + (minutes + hundredths / 100.0) / 60.0
}

fn longitude(dest: &[u8; 6], info: &[u8; 3]) -> f64 {
    let mut degrees = i32::from(info[0]) - BYTE_BIAS;
    if degrees > 180 && degrees < 189 {
        degrees -= 80;
    }
    if degrees > 190 && degrees < 199 {
        degrees -= 190;
    }
    degrees += i32::from((dest[5] & LONGITUDE_OFFSET_MASK) >> 7) * 100;

    let mut minutes = i32::from(info[1]) - BYTE_BIAS;
    if minutes > 60 {
        minutes -= 60;
    }
    let hundredths = i32::from(info[2]) - BYTE_BIAS;

    -(f64::from(degrees) + (f64::from(minutes) + f64::from(hundredths) / 100.0) / 60.0)
}
