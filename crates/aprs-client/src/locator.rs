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

//! Six-character Maidenhead grid locator.

use crate::geofence::Coordinate;

const FIELD_WIDTH: f64 = 20.0;
const FIELD_HEIGHT: f64 = 10.0;
const SQUARE_WIDTH: f64 = 2.0;
const SQUARE_HEIGHT: f64 = 1.0;
const SUBSQUARES: f64 = 24.0;

/// Compute the field/square/subsquare locator for a position, e.g. `FM18br`.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "cell indices are small non-negative integers after the origin shift"
)]
pub fn locate(coord: Coordinate) -> String {
    // Move the origin to the south-west corner of the world.
    let x = coord.longitude + 180.0;
    let y = coord.latitude + 90.0;

    let xf = (x / FIELD_WIDTH).floor();
    let yf = (y / FIELD_HEIGHT).floor();

    let xs = ((x - xf * FIELD_WIDTH) / SQUARE_WIDTH).floor();
    let ys = ((y - yf * FIELD_HEIGHT) / SQUARE_HEIGHT).floor();

    let xss = ((x - xf * FIELD_WIDTH - xs * SQUARE_WIDTH) / (SQUARE_WIDTH / SUBSQUARES)).floor();
    let yss = ((y - yf * FIELD_HEIGHT - ys * SQUARE_HEIGHT) / (SQUARE_HEIGHT / SUBSQUARES)).floor();

    let letter = |base: u8, offset: f64| char::from(base + offset as u8);

    let mut grid = String::with_capacity(6);
    grid.push(letter(b'A', xf));
    grid.push(letter(b'A', yf));
    grid.push(letter(b'0', xs));
    grid.push(letter(b'0', ys));
    grid.push(letter(b'a', xss));
    grid.push(letter(b'a', yss));
    grid
}
