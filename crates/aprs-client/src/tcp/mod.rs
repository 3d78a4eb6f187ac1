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

//! APRS-IS session with login, server-side filter and watchdog reconnection.
//!
//! The session runs in a background task that owns the network stream and
//! the processing [`Pipeline`]. A [`SessionHandle`] controls it from any other
//! context: start, stop, forced disconnect, flush and shutdown. Progress is
//! published as [`SessionEvent`]s and the current [`SessionState`].

mod session;

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::geofence::Coordinate;
use crate::output::OutputWriter;
use crate::pipeline::Pipeline;
use crate::tracker::SharedStations;

use session::Worker;

/// Default APRS-IS rotation for North America.
pub const DEFAULT_HOST: &str = "noam.aprs2.net";
/// User-defined filter port.
pub const DEFAULT_PORT: u16 = 14580;
/// Area filter covering Virginia.
pub const DEFAULT_FILTER: &str = "a/39.372680/-83.26599638/36.567059/-74.973329";

/// Session errors. Retried locally and reported as status, never fatal.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for '{0}'")]
    Timeout(String),

    #[error("connection closed by server")]
    Closed,

    #[error("not connected")]
    NotConnected,
}

/// Where the session is in its connect/login/stream cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SessionState {
    /// Waiting for a start command.
    #[default]
    Idle = 0,
    /// Opening the TCP stream.
    Connecting = 1,
    /// Connected, waiting for the server's `# ` banner.
    AwaitingBanner = 2,
    /// Sending login and filter commands.
    LoggingIn = 3,
    /// Reading packets.
    Streaming = 4,
}

impl SessionState {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingBanner => "awaiting banner",
            Self::LoggingIn => "logging in",
            Self::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Notifications for the control side.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Human-readable progress message.
    Status(String),
    /// A position was decoded for `call`.
    Position { call: String, coordinate: Coordinate },
    /// Grid locator of the latest position.
    Locator(String),
    /// County or city of the latest position.
    Region { name: String, abbr: String },
    /// A replay file has been fully processed.
    ReplayComplete,
}

/// Whether the session waits for commands or runs straight through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Start in [`SessionState::Idle`] and wait for [`SessionHandle::start`].
    #[default]
    Interactive,
    /// Skip idle: connect immediately and exit when stopped.
    Unattended,
}

/// Bounded local retries with a fixed pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts before giving up on the current step.
    pub attempts: u32,
    /// Pause after every failed attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Configuration for an APRS-IS session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Server-side filter, sent as `#filter <filter>`.
    pub filter: String,
    /// Software name and version reported at login.
    pub software: String,
    pub retry: RetryPolicy,
    /// Upper bound on any single read.
    pub read_timeout: Duration,
    /// Silence after which artifacts are rewritten.
    pub flush_after: Duration,
    /// Silence after which the stream is dropped and reopened.
    pub reconnect_after: Duration,
    pub mode: RunMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            filter: DEFAULT_FILTER.to_string(),
            software: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            retry: RetryPolicy::default(),
            read_timeout: Duration::from_secs(120),
            flush_after: Duration::from_secs(60),
            reconnect_after: Duration::from_secs(180),
            mode: RunMode::default(),
        }
    }
}

impl SessionConfig {
    /// Login line with the receive-only pass code.
    #[must_use]
    pub fn login_line(&self) -> String {
        format!("user NOCALL pass -1 vers {}", self.software)
    }

    #[must_use]
    pub fn filter_line(&self) -> String {
        format!("#filter {}", self.filter)
    }
}

/// Opens the byte stream to an APRS-IS server.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, host: &str, port: u16) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Commands shared between the handle and the worker.
#[derive(Debug, Default)]
pub(crate) struct Controls {
    pub(crate) start: Notify,
    pub(crate) stop: Notify,
    pub(crate) disconnect: Notify,
}

/// Handle to a running session task.
///
/// Dropping the handle shuts the session down.
pub struct SessionHandle {
    state_rx: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    stations: SharedStations,
    writer: OutputWriter,
    controls: Arc<Controls>,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &*self.state_rx.borrow())
            .field("cancel_token", &self.cancel_token)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Spawn the session task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn<C: Connector>(config: SessionConfig, connector: C, pipeline: Pipeline) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let events = pipeline.event_sender();
        let stations = Arc::clone(pipeline.stations());
        let writer = pipeline.writer().clone();
        let controls = Arc::new(Controls::default());
        let cancel_token = CancellationToken::new();

        let worker = Worker::new(
            config,
            connector,
            pipeline,
            state_tx,
            Arc::clone(&controls),
            cancel_token.clone(),
        );
        let task = tokio::spawn(worker.run());

        Self {
            state_rx,
            events,
            stations,
            writer,
            controls,
            cancel_token,
            task: Some(task),
        }
    }

    /// Leave idle and begin connecting.
    pub fn start(&self) {
        if self.state() == SessionState::Idle {
            self.controls.start.notify_one();
        } else {
            info!("Session already running ({})", self.state());
        }
    }

    /// Close the stream, flush, and return to idle.
    ///
    /// An unattended session exits instead.
    pub fn stop(&self) {
        if self.state() == SessionState::Idle {
            info!("Session already idle");
        } else {
            self.controls.stop.notify_one();
        }
    }

    /// Drop the current stream and reconnect.
    pub fn disconnect(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Idle | SessionState::Connecting => Err(SessionError::NotConnected),
            _ => {
                self.controls.disconnect.notify_one();
                Ok(())
            }
        }
    }

    /// Stop the session task for good.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// Wait for the session task to finish.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {e}");
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn stations(&self) -> SharedStations {
        Arc::clone(&self.stations)
    }

    /// Evict expired stations and rewrite every artifact now.
    pub fn flush(&self) {
        let mut db = self.stations.lock().unwrap_or_else(PoisonError::into_inner);
        match self.writer.flush(&mut db, Utc::now()) {
            Ok(()) => info!("Flushed {} stations to {}", db.len(), self.writer.dir().display()),
            Err(e) => warn!("Failed to write output: {e}"),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
