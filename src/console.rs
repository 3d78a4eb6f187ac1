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

//! Line-oriented control surface for interactive runs.

use std::sync::PoisonError;

use aprs_client::SessionHandle;
use log::{info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

use crate::status::SharedSystemStatus;

const HELP: &str = "commands: start | stop | flush | reconnect | status | quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Flush,
    Reconnect,
    Status,
    Help,
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines and unknown words yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let command = match line.trim().to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "flush" => Self::Flush,
            "reconnect" | "disconnect" => Self::Reconnect,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => return None,
        };
        Some(command)
    }
}

/// Read commands from `input` until `quit`, end of input, or cancellation.
pub async fn run<R>(
    input: R,
    session: &SessionHandle,
    status: &SharedSystemStatus,
    cancel_token: &CancellationToken,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    println!("{HELP}");

    loop {
        let line = tokio::select! {
            () = cancel_token.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Console input error: {e}");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match Command::parse(&line) {
            Some(Command::Start) => session.start(),
            Some(Command::Stop) => session.stop(),
            Some(Command::Flush) => session.flush(),
            Some(Command::Reconnect) => {
                if let Err(e) = session.disconnect() {
                    info!("Cannot reconnect: {e}");
                }
            }
            Some(Command::Status) => {
                let status = status.lock().unwrap_or_else(PoisonError::into_inner);
                print!("{status}");
            }
            Some(Command::Help) => println!("{HELP}"),
            Some(Command::Quit) => break,
            None => println!("unknown command '{}', {HELP}", line.trim()),
        }
    }
}
