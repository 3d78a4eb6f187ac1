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

//! Application configuration management.
//!
//! Settings persist in TOML via confy. Command-line options override the
//! stored values for the run and are written back on exit.

use std::path::PathBuf;

use aprs_client::tcp::{DEFAULT_FILTER, DEFAULT_HOST, DEFAULT_PORT};
use aprs_client::tracker::DEFAULT_AGE_OUT_SECS;
use aprs_client::DEFAULT_MARKER;
use serde::{Deserialize, Serialize};

use crate::Args;

/// Name confy stores the configuration under.
pub const APP_NAME: &str = "qp-aprs-tracker";

/// Application configuration stored in TOML format
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Configuration schema version for migrations
    #[serde(default = "default_config_version")]
    pub config_version: u32,

    /// APRS-IS server host name
    #[serde(default = "default_aprs_host")]
    pub aprs_host: String,

    /// APRS-IS user-defined filter port
    #[serde(default = "default_aprs_port")]
    pub aprs_port: u16,

    /// Server-side filter without the `#filter` prefix
    #[serde(default = "default_filter")]
    pub filter: String,

    /// KML file with county/city boundaries
    #[serde(default)]
    pub boundary_file: Option<PathBuf>,

    /// Registered QSO party calls, one per line
    #[serde(default = "default_calls_file")]
    pub calls_file: PathBuf,

    /// Seconds without a position before a station is dropped
    #[serde(default = "default_age_out_secs")]
    pub age_out_secs: i64,

    /// Directory the map front end serves
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Case-insensitive pattern that self-registers a participant
    #[serde(default = "default_participation_marker")]
    pub participation_marker: String,
}

// Default value functions for serde
fn default_config_version() -> u32 {
    1
}

fn default_aprs_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_aprs_port() -> u16 {
    DEFAULT_PORT
}

fn default_filter() -> String {
    DEFAULT_FILTER.to_string()
}

fn default_calls_file() -> PathBuf {
    PathBuf::from("qp-calls.txt")
}

fn default_age_out_secs() -> i64 {
    DEFAULT_AGE_OUT_SECS
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("www")
}

fn default_participation_marker() -> String {
    DEFAULT_MARKER.to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            aprs_host: default_aprs_host(),
            aprs_port: default_aprs_port(),
            filter: default_filter(),
            boundary_file: None,
            calls_file: default_calls_file(),
            age_out_secs: default_age_out_secs(),
            output_dir: default_output_dir(),
            participation_marker: default_participation_marker(),
        }
    }
}

impl AppConfig {
    /// Load configuration from disk
    pub fn load() -> Result<Self, confy::ConfyError> {
        confy::load(APP_NAME, "config")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<(), confy::ConfyError> {
        confy::store(APP_NAME, "config", self)
    }

    /// Get the config file path for display to user
    pub fn get_config_path() -> Result<PathBuf, confy::ConfyError> {
        confy::get_configuration_file_path(APP_NAME, "config")
    }

    /// Apply command-line overrides. Returns true if anything changed.
    pub fn apply_args(&mut self, args: &Args) -> bool {
        let before = self.clone();

        if let Some(host) = &args.aprs {
            self.aprs_host.clone_from(host);
        }
        if let Some(port) = args.tcp {
            self.aprs_port = port;
        }
        if let Some(boundary) = &args.boundary {
            self.boundary_file = Some(boundary.clone());
        }
        if let Some(calls) = &args.calls {
            self.calls_file.clone_from(calls);
        }
        if let Some(age_out) = args.ageout {
            self.age_out_secs = age_out;
        }
        if let Some(www) = &args.www {
            self.output_dir.clone_from(www);
        }

        *self != before
    }
}
