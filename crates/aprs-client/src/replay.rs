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

//! Offline replay of a captured packet log through the live pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use log::info;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{run_blocking, LineOutcome, Pipeline};
use crate::tcp::SessionEvent;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read replay file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Line counts from one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub lines: usize,
    /// Lines that produced a usable position.
    pub positions: usize,
    /// Positions inside a known boundary.
    pub tracked: usize,
    /// True if cancelled before the end of the file.
    pub cancelled: bool,
}

/// Feed every line of `path` through `pipeline`, pausing `pace` before each.
///
/// Artifacts are flushed at the end and [`SessionEvent::ReplayComplete`] is
/// emitted, also when cancelled.
pub async fn replay_file(
    path: &Path,
    pipeline: &mut Pipeline,
    pace: Duration,
    cancel_token: &CancellationToken,
) -> Result<ReplaySummary, ReplayError> {
    let io = |source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    };

    pipeline.status(format!("Replaying {} APRS file", path.display()));
    let file = File::open(path).await.map_err(io)?;
    let mut reader = BufReader::new(file);
    let mut summary = ReplaySummary::default();
    let mut buf = Vec::new();

    loop {
        if !pace.is_zero() {
            tokio::select! {
                () = sleep(pace) => {}
                () = cancel_token.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
            }
        } else if cancel_token.is_cancelled() {
            summary.cancelled = true;
            break;
        }

        buf.clear();
        if reader.read_until(b'\n', &mut buf).await.map_err(io)? == 0 {
            break;
        }
        summary.lines += 1;

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\r', '\n']);
        match run_blocking(|| pipeline.process_line(line, Utc::now())) {
            LineOutcome::Tracked { .. } => {
                summary.positions += 1;
                summary.tracked += 1;
            }
            LineOutcome::OutOfBounds { .. } => summary.positions += 1,
            _ => {}
        }
    }

    run_blocking(|| pipeline.flush(Utc::now()));
    info!(
        "Replay finished: {} lines, {} positions, {} tracked",
        summary.lines, summary.positions, summary.tracked
    );
    pipeline.emit(SessionEvent::ReplayComplete);
    Ok(summary)
}
