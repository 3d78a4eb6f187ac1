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

//! The session worker: IDLE → CONNECTING → AWAITING_BANNER → LOGGING_IN →
//! STREAMING, falling back to CONNECTING on any exhausted step.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::io::{split, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use super::{Connector, Controls, RunMode, SessionConfig, SessionError, SessionEvent, SessionState};
use crate::pipeline::{run_blocking, Pipeline};

/// Why a blocking step was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Shutdown,
    Stop,
    Disconnect,
}

/// Whether a connected phase completed or the stream must be reopened.
enum Phase {
    Done,
    Reconnect,
}

pub(super) struct Worker<C: Connector> {
    config: SessionConfig,
    connector: C,
    pipeline: Pipeline,
    state_tx: watch::Sender<SessionState>,
    controls: Arc<Controls>,
    cancel_token: CancellationToken,
}

impl<C: Connector> Worker<C> {
    pub(super) fn new(
        config: SessionConfig,
        connector: C,
        pipeline: Pipeline,
        state_tx: watch::Sender<SessionState>,
        controls: Arc<Controls>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            connector,
            pipeline,
            state_tx,
            controls,
            cancel_token,
        }
    }

    pub(super) async fn run(mut self) {
        let interactive = self.config.mode == RunMode::Interactive;

        loop {
            if interactive {
                self.set_state(SessionState::Idle);
                self.pipeline.status("Idle");
                tokio::select! {
                    () = self.controls.start.notified() => {}
                    () = self.cancel_token.cancelled() => break,
                }
            }

            self.pipeline.restore_snapshot();

            match self.session().await {
                Interrupt::Stop if interactive => {
                    self.pipeline.status("Stopped");
                    run_blocking(|| self.pipeline.flush(Utc::now()));
                }
                Interrupt::Stop | Interrupt::Shutdown | Interrupt::Disconnect => break,
            }
        }

        info!("APRS session exiting");
        run_blocking(|| self.pipeline.flush(Utc::now()));
        self.set_state(SessionState::Idle);
    }

    fn set_state(&self, state: SessionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!("Session state -> {state}");
            self.pipeline.emit(SessionEvent::StateChanged(state));
        }
    }

    /// Await `fut` unless a control command arrives first.
    async fn interruptible<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            out = fut => Ok(out),
            () = self.cancel_token.cancelled() => Err(Interrupt::Shutdown),
            () = self.controls.stop.notified() => Err(Interrupt::Stop),
            () = self.controls.disconnect.notified() => Err(Interrupt::Disconnect),
        }
    }

    async fn backoff(&self) -> Result<(), Interrupt> {
        self.interruptible(sleep(self.config.retry.backoff)).await
    }

    /// Connect, log in and stream until stopped or shut down.
    async fn session(&mut self) -> Interrupt {
        loop {
            let result = match self.connect().await {
                Ok(stream) => self.connected(stream).await,
                Err(interrupt) => Err(interrupt),
            };

            match result {
                Ok(()) => {}
                Err(Interrupt::Disconnect) => {
                    self.pipeline.status(format!(
                        "Disconnected from APRS host [{}]",
                        self.config.host
                    ));
                }
                Err(other) => return other,
            }
        }
    }

    /// Banner, login and streaming over one stream. `Ok` means reconnect.
    async fn connected(&mut self, stream: C::Stream) -> Result<(), Interrupt> {
        let (read_half, mut write_half) = split(stream);
        let mut reader = BufReader::new(read_half);

        if let Phase::Reconnect = self.await_banner(&mut reader).await? {
            return Ok(());
        }
        if let Phase::Reconnect = self.login(&mut reader, &mut write_half).await? {
            return Ok(());
        }
        self.stream(&mut reader).await
    }

    /// CONNECTING: retry until a stream opens. Each run of exhausted
    /// attempts starts a fresh cycle.
    async fn connect(&self) -> Result<C::Stream, Interrupt> {
        self.set_state(SessionState::Connecting);
        let host = self.config.host.as_str();
        let port = self.config.port;

        loop {
            self.pipeline
                .status(format!("Opening APRS host [{host} : {port}]"));

            for attempt in 1..=self.config.retry.attempts {
                match self.interruptible(self.connector.connect(host, port)).await? {
                    Ok(stream) => {
                        info!("Connected to {host}:{port}");
                        return Ok(stream);
                    }
                    Err(e) => {
                        warn!(
                            "Connect attempt {attempt}/{} to {host}:{port} failed: {e}",
                            self.config.retry.attempts
                        );
                    }
                }
                self.backoff().await?;
            }

            self.pipeline
                .status(format!("Unable to open APRS host [{host}], retrying"));
        }
    }

    /// AWAITING_BANNER: the server greets with a `# ` comment line.
    async fn await_banner<R>(&self, reader: &mut R) -> Result<Phase, Interrupt>
    where
        R: AsyncBufRead + Unpin,
    {
        self.set_state(SessionState::AwaitingBanner);
        self.pipeline.status("Waiting for initial APRS connect");

        for _ in 0..self.config.retry.attempts {
            match self
                .interruptible(expect_line(reader, "# ", self.config.read_timeout))
                .await?
            {
                Ok(()) => return Ok(Phase::Done),
                Err(SessionError::Closed) => {
                    self.pipeline.status("APRS host closed the connection");
                    return Ok(Phase::Reconnect);
                }
                Err(e) => warn!("Banner: {e}"),
            }
            self.backoff().await?;
        }

        self.pipeline.status(format!(
            "Timeout waiting for APRS host [{}] login",
            self.config.host
        ));
        Ok(Phase::Reconnect)
    }

    /// LOGGING_IN: login, then the server-side filter. Either step failing
    /// restarts both.
    async fn login<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<Phase, Interrupt>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.set_state(SessionState::LoggingIn);
        let login = self.config.login_line();
        let filter = self.config.filter_line();

        for _ in 0..self.config.retry.attempts {
            self.pipeline.status("Waiting for successful login");
            let result = match self
                .interruptible(send_expect(reader, writer, &login, "# logresp", self.config.read_timeout))
                .await?
            {
                Ok(()) => {
                    self.pipeline.status("Waiting for successful filter setup");
                    self.interruptible(send_expect(reader, writer, &filter, "active", self.config.read_timeout))
                        .await?
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => return Ok(Phase::Done),
                Err(SessionError::Closed) => {
                    self.pipeline.status("APRS host closed the connection");
                    return Ok(Phase::Reconnect);
                }
                Err(e) => warn!("Login: {e}"),
            }
            self.backoff().await?;
        }

        self.pipeline.status(format!(
            "Error sending/receiving message APRS host [{}]",
            self.config.host
        ));
        Ok(Phase::Reconnect)
    }

    /// STREAMING: process lines in arrival order under the watchdog.
    ///
    /// Returns `Ok` when the stream must be reopened.
    async fn stream<R>(&mut self, reader: &mut R) -> Result<(), Interrupt>
    where
        R: AsyncBufRead + Unpin,
    {
        self.set_state(SessionState::Streaming);
        self.pipeline.status("Processing APRS data");

        let flush_after = self.config.flush_after;
        let reconnect_after = self.config.reconnect_after;
        let mut last_data = Instant::now();
        let mut flushed = false;
        let mut failures = 0;
        // Survives timeouts so a partially received line is not lost.
        let mut buf = Vec::new();

        loop {
            self.pipeline.reload_registry();

            let silence = last_data.elapsed();
            let next_check = if flushed { reconnect_after } else { flush_after };
            let wait = next_check
                .saturating_sub(silence)
                .min(self.config.read_timeout);

            match self
                .interruptible(timeout(wait, reader.read_until(b'\n', &mut buf)))
                .await?
            {
                Ok(Ok(0)) => {
                    self.pipeline.status("APRS host closed the connection");
                    return Ok(());
                }
                Ok(Ok(_)) => {
                    last_data = Instant::now();
                    flushed = false;
                    failures = 0;

                    {
                        let text = String::from_utf8_lossy(&buf);
                        let line = text.trim_end_matches(['\r', '\n']);
                        run_blocking(|| self.pipeline.process_line(line, Utc::now()));
                    }
                    buf.clear();
                }
                Ok(Err(e)) => {
                    failures += 1;
                    warn!("Read error ({failures}/{}): {e}", self.config.retry.attempts);
                    if failures >= self.config.retry.attempts {
                        self.pipeline.status(format!(
                            "Error receiving message APRS host [{}]",
                            self.config.host
                        ));
                        return Ok(());
                    }
                    self.backoff().await?;
                }
                Err(_elapsed) => {}
            }

            let silence = last_data.elapsed();
            if silence >= reconnect_after {
                self.pipeline
                    .status("Long timeout waiting for APRS data, closing port");
                run_blocking(|| self.pipeline.flush(Utc::now()));
                return Ok(());
            }
            if silence >= flush_after && !flushed {
                self.pipeline
                    .status("Timeout waiting for APRS data, re-writing data");
                run_blocking(|| self.pipeline.flush(Utc::now()));
                flushed = true;
            }
        }
    }
}

/// Read lines until one contains `needle`, within `limit`.
async fn expect_line<R>(reader: &mut R, needle: &str, limit: std::time::Duration) -> Result<(), SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let deadline = Instant::now() + limit;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = match timeout_at(deadline, reader.read_until(b'\n', &mut buf)).await {
            Ok(read) => read?,
            Err(_elapsed) => return Err(SessionError::Timeout(needle.to_string())),
        };
        if read == 0 {
            return Err(SessionError::Closed);
        }

        let line = String::from_utf8_lossy(&buf);
        if line.contains(needle) {
            debug!("Server: {}", line.trim_end());
            return Ok(());
        }
        debug!("Waiting for '{needle}', skipping: {}", line.trim_end());
    }
}

async fn send_expect<R, W>(
    reader: &mut R,
    writer: &mut W,
    command: &str,
    needle: &str,
    limit: std::time::Duration,
) -> Result<(), SessionError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    debug!("Sending: {command}");
    writer.write_all(command.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    expect_line(reader, needle, limit).await
}
