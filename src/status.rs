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

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use aprs_client::{Coordinate, SessionEvent, SessionState};
use chrono::{DateTime, Utc};

const MAX_DIAGNOSTICS: usize = 50;

/// Diagnostic message with timestamp
#[derive(Debug, Clone)]
pub struct DiagnosticMessage {
    pub timestamp: DateTime<Utc>,
    pub level: DiagnosticLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Info,
    Warning,
}

/// Last position seen on the feed
#[derive(Debug, Clone, PartialEq)]
pub struct LastPosition {
    pub call: String,
    pub coordinate: Coordinate,
    pub locator: Option<String>,
    pub region: Option<(String, String)>,
}

/// Session status and recent diagnostics, fed from [`SessionEvent`]s
#[derive(Debug)]
pub struct SystemStatus {
    pub state: SessionState,
    pub connected_at: Option<DateTime<Utc>>,
    pub connection_address: String,

    // Counters since startup
    pub positions_decoded: u64,
    pub positions_located: u64,
    pub reconnects: u64,

    pub last_position: Option<LastPosition>,
    pub replay_complete: bool,

    // Diagnostic messages (keep last 50)
    pub diagnostics: VecDeque<DiagnosticMessage>,
}

pub type SharedSystemStatus = Arc<Mutex<SystemStatus>>;

impl SystemStatus {
    pub fn new(connection_address: impl Into<String>) -> Self {
        Self {
            state: SessionState::Idle,
            connected_at: None,
            connection_address: connection_address.into(),
            positions_decoded: 0,
            positions_located: 0,
            reconnects: 0,
            last_position: None,
            replay_complete: false,
            diagnostics: VecDeque::with_capacity(MAX_DIAGNOSTICS),
        }
    }

    pub fn shared(connection_address: impl Into<String>) -> SharedSystemStatus {
        Arc::new(Mutex::new(Self::new(connection_address)))
    }

    /// Fold one session event into the status.
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::StateChanged(state) => self.set_state(*state),
            SessionEvent::Status(text) => {
                self.add_diagnostic(level_of(text), text.clone());
            }
            SessionEvent::Position { call, coordinate } => {
                self.positions_decoded += 1;
                self.last_position = Some(LastPosition {
                    call: call.clone(),
                    coordinate: *coordinate,
                    locator: None,
                    region: None,
                });
            }
            SessionEvent::Locator(grid) => {
                if let Some(last) = &mut self.last_position {
                    last.locator = Some(grid.clone());
                }
            }
            SessionEvent::Region { name, abbr } => {
                self.positions_located += 1;
                if let Some(last) = &mut self.last_position {
                    last.region = Some((name.clone(), abbr.clone()));
                }
            }
            SessionEvent::ReplayComplete => {
                self.replay_complete = true;
                self.add_diagnostic(DiagnosticLevel::Info, "Replay complete".to_string());
            }
        }
    }

    fn set_state(&mut self, state: SessionState) {
        let previous = self.state;
        self.state = state;

        match state {
            SessionState::Streaming => self.connected_at = Some(Utc::now()),
            SessionState::Connecting => {
                self.connected_at = None;
                if previous != SessionState::Idle {
                    self.reconnects += 1;
                }
            }
            SessionState::Idle => self.connected_at = None,
            SessionState::AwaitingBanner | SessionState::LoggingIn => {}
        }
    }

    /// Add a diagnostic message
    pub fn add_diagnostic(&mut self, level: DiagnosticLevel, message: String) {
        self.diagnostics.push_back(DiagnosticMessage {
            timestamp: Utc::now(),
            level,
            message,
        });

        while self.diagnostics.len() > MAX_DIAGNOSTICS {
            self.diagnostics.pop_front();
        }
    }

    /// Seconds spent streaming on the current connection
    pub fn uptime_seconds(&self) -> i64 {
        self.connected_at
            .map_or(0, |connected| (Utc::now() - connected).num_seconds())
    }
}

fn level_of(text: &str) -> DiagnosticLevel {
    let lower = text.to_ascii_lowercase();
    if ["unable", "closed", "timeout", "disconnected"]
        .iter()
        .any(|word| lower.contains(word))
    {
        DiagnosticLevel::Warning
    } else {
        DiagnosticLevel::Info
    }
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "State:     {} ({})", self.state, self.connection_address)?;
        if self.state == SessionState::Streaming {
            writeln!(f, "Uptime:    {}s", self.uptime_seconds())?;
        }
        writeln!(
            f,
            "Positions: {} decoded, {} located, {} reconnects",
            self.positions_decoded, self.positions_located, self.reconnects
        )?;
        if let Some(last) = &self.last_position {
            write!(
                f,
                "Last:      {} {:.5},{:.5}",
                last.call, last.coordinate.latitude, last.coordinate.longitude
            )?;
            if let Some(grid) = &last.locator {
                write!(f, " {grid}")?;
            }
            if let Some((name, abbr)) = &last.region {
                write!(f, " {name} ({abbr})")?;
            }
            writeln!(f)?;
        }
        for diagnostic in self.diagnostics.iter().rev().take(5).rev() {
            writeln!(
                f,
                "{} {}",
                diagnostic.timestamp.format("%H:%M:%S"),
                diagnostic.message
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_capped() {
        let mut status = SystemStatus::new("noam.aprs2.net:14580");
        for i in 0..60 {
            status.add_diagnostic(DiagnosticLevel::Info, format!("message {i}"));
        }
        assert_eq!(status.diagnostics.len(), 50);
        assert_eq!(status.diagnostics.front().unwrap().message, "message 10");
    }

    #[test]
    fn test_position_events_fold_into_last_position() {
        let mut status = SystemStatus::new("noam.aprs2.net:14580");
        status.apply(&SessionEvent::Position {
            call: "W4VA-10".to_string(),
            coordinate: Coordinate::new(-77.836, 38.734),
        });
        status.apply(&SessionEvent::Locator("FM18br".to_string()));
        status.apply(&SessionEvent::Region {
            name: "Fauquier".to_string(),
            abbr: "FAU".to_string(),
        });

        assert_eq!(status.positions_decoded, 1);
        assert_eq!(status.positions_located, 1);
        let last = status.last_position.as_ref().unwrap();
        assert_eq!(last.call, "W4VA-10");
        assert_eq!(last.locator.as_deref(), Some("FM18br"));
        assert_eq!(
            last.region,
            Some(("Fauquier".to_string(), "FAU".to_string()))
        );
        assert!(status.to_string().contains("W4VA-10"));
    }

    #[test]
    fn test_reconnects_counted() {
        let mut status = SystemStatus::new("noam.aprs2.net:14580");
        status.apply(&SessionEvent::StateChanged(SessionState::Connecting));
        assert_eq!(status.reconnects, 0);
        status.apply(&SessionEvent::StateChanged(SessionState::Streaming));
        assert!(status.connected_at.is_some());
        status.apply(&SessionEvent::StateChanged(SessionState::Connecting));
        assert_eq!(status.reconnects, 1);
        assert!(status.connected_at.is_none());
    }

    #[test]
    fn test_status_text_becomes_diagnostic() {
        let mut status = SystemStatus::new("noam.aprs2.net:14580");
        status.apply(&SessionEvent::Status(
            "Disconnected from APRS host [noam.aprs2.net]".to_string(),
        ));
        assert_eq!(status.diagnostics.len(), 1);
        assert_eq!(status.diagnostics[0].level, DiagnosticLevel::Warning);

        status.apply(&SessionEvent::Status("Processing APRS data".to_string()));
        assert_eq!(status.diagnostics[1].level, DiagnosticLevel::Info);
    }
}
