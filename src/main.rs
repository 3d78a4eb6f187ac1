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

mod config;
mod console;
mod status;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::PoisonError;
use std::time::Duration;

use aprs_client::{
    replay_file, CallRegistry, GeofenceEngine, GeofenceError, OutputWriter, Pipeline,
    PipelineError, RegistryError, ReplayError, RunMode, SessionConfig, SessionEvent,
    SessionHandle, StationDatabase, TcpConnector,
};
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use thiserror::Error;
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use config::AppConfig;
use status::{SharedSystemStatus, SystemStatus};

/// Track QSO party mobile stations on APRS-IS by county and city.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Run unattended: connect immediately, no console
    #[arg(short, long)]
    pub cli: bool,

    /// APRS-IS host name or address
    #[arg(short, long)]
    pub aprs: Option<String>,

    /// APRS-IS TCP port
    #[arg(short, long)]
    pub tcp: Option<u16>,

    /// Replay a captured APRS data file instead of connecting
    #[arg(short, long, value_name = "FILE")]
    pub run: Option<PathBuf>,

    /// County/city boundary KML file
    #[arg(short, long, value_name = "FILE")]
    pub boundary: Option<PathBuf>,

    /// QSO party calls file
    #[arg(short = 's', long, value_name = "FILE")]
    pub calls: Option<PathBuf>,

    /// Seconds without a position before a station is dropped
    #[arg(short = 'o', long, value_name = "SECS")]
    pub ageout: Option<i64>,

    /// Output directory for the map front end
    #[arg(short, long, value_name = "DIR")]
    pub www: Option<PathBuf>,

    /// Delay between replayed lines in milliseconds
    #[arg(short, long, value_name = "MS", requires = "run")]
    pub pace: Option<u64>,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error("{what} not found [{}]", .path.display())]
    MissingFile { what: &'static str, path: PathBuf },

    #[error("no geographic boundary file configured, pass --boundary")]
    NoBoundary,

    #[error("failed to load boundaries: {0}")]
    Geofence(#[from] GeofenceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Replay(#[from] ReplayError),
}

fn require_file(what: &'static str, path: &Path) -> Result<(), StartupError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(StartupError::MissingFile {
            what,
            path: path.to_path_buf(),
        })
    }
}

/// Check files named on the command line before anything else runs.
fn validate_args(args: &Args) -> Result<(), StartupError> {
    if let Some(path) = &args.boundary {
        require_file("geographic boundary file", path)?;
    }
    if let Some(path) = &args.calls {
        require_file("QP calls file", path)?;
    }
    if let Some(path) = &args.run {
        require_file("APRS replay data file", path)?;
    }
    Ok(())
}

/// Load boundaries. Interactive runs may continue without any.
fn load_geofence(config: &AppConfig, strict: bool) -> Result<GeofenceEngine, StartupError> {
    let result = match &config.boundary_file {
        Some(path) => GeofenceEngine::load(path).map_err(StartupError::from),
        None => Err(StartupError::NoBoundary),
    };

    match result {
        Ok(engine) => {
            info!("Loaded {} boundaries", engine.len());
            Ok(engine)
        }
        Err(e) if !strict => {
            warn!("{e}; every position will resolve as unknown");
            Ok(GeofenceEngine::default())
        }
        Err(e) => Err(e),
    }
}

fn build_pipeline(
    config: &AppConfig,
    strict: bool,
    events: broadcast::Sender<SessionEvent>,
) -> Result<Pipeline, StartupError> {
    let geofence = load_geofence(config, strict)?;
    let registry = CallRegistry::load_or_create(&config.calls_file)?;
    info!(
        "Loaded {} QP calls from {}",
        registry.len(),
        config.calls_file.display()
    );

    let stations = StationDatabase::shared(chrono::Duration::seconds(config.age_out_secs));
    let writer = OutputWriter::new(&config.output_dir);
    Ok(Pipeline::new(
        geofence,
        registry,
        &config.participation_marker,
        stations,
        writer,
        events,
    )?)
}

fn session_config(config: &AppConfig, mode: RunMode) -> SessionConfig {
    SessionConfig {
        host: config.aprs_host.clone(),
        port: config.aprs_port,
        filter: config.filter.clone(),
        software: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        mode,
        ..Default::default()
    }
}

/// Fold session events into the shared status until the channel closes.
fn spawn_status_feed(mut events: broadcast::Receiver<SessionEvent>, status: SharedSystemStatus) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => status
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .apply(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Status feed skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Cancel `token` on Ctrl-C.
fn spawn_interrupt_watch(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for Ctrl-C: {e}");
            return;
        }
        info!("Shutdown signal received");
        token.cancel();
    });
}

async fn run(args: &Args, config: &AppConfig) -> Result<(), StartupError> {
    let unattended = args.cli || args.run.is_some();
    let (events, _) = broadcast::channel(256);
    let mut pipeline = build_pipeline(config, unattended, events)?;

    let address = format!("{}:{}", config.aprs_host, config.aprs_port);
    let status = SystemStatus::shared(address);
    spawn_status_feed(pipeline.subscribe(), status.clone());

    let cancel_token = CancellationToken::new();
    spawn_interrupt_watch(cancel_token.clone());

    if let Some(path) = &args.run {
        let pace = Duration::from_millis(args.pace.unwrap_or(0));
        let summary = replay_file(path, &mut pipeline, pace, &cancel_token).await?;
        if summary.cancelled {
            warn!("Replay cancelled after {} lines", summary.lines);
        }
        return Ok(());
    }

    let mode = if args.cli {
        RunMode::Unattended
    } else {
        RunMode::Interactive
    };
    let mut session = SessionHandle::spawn(session_config(config, mode), TcpConnector, pipeline);

    if mode == RunMode::Interactive {
        let stdin = BufReader::new(tokio::io::stdin());
        console::run(stdin, &session, &status, &cancel_token).await;
    } else {
        tokio::select! {
            () = cancel_token.cancelled() => {}
            () = session.join() => {}
        }
    }

    session.shutdown();
    session.join().await;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    if let Err(e) = validate_args(&args) {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!("Failed to load config, using defaults: {e}");
        AppConfig::default()
    });
    if let Ok(path) = AppConfig::get_config_path() {
        info!("Config file: {}", path.display());
    }
    let changed = config.apply_args(&args);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let result = rt.block_on(run(&args, &config));
    // A pending console read would otherwise hold the runtime open.
    rt.shutdown_timeout(Duration::from_millis(500));

    let code = match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    };

    if changed {
        match config.save() {
            Ok(()) => info!("Saved command-line settings"),
            Err(e) => warn!("Failed to save config: {e}"),
        }
    }

    code
}
