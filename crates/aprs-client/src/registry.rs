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

//! Registered QSO party call signs.
//!
//! Backed by a plain text file, one call per line. Operators can edit the
//! file while the tracker runs; it is re-read whenever its modification time
//! moves. Stations heard beaconing the participation marker are appended.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{info, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("call registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Ordered set of participant call signs.
#[derive(Debug, Clone, Default)]
pub struct CallRegistry {
    path: Option<PathBuf>,
    calls: Vec<String>,
    modified: Option<SystemTime>,
}

impl CallRegistry {
    /// A registry with no backing file; additions stay in memory.
    #[must_use]
    pub fn in_memory(calls: impl IntoIterator<Item = String>) -> Self {
        let mut registry = Self::default();
        for call in calls {
            registry.insert(call);
        }
        registry
    }

    /// Load the registry file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let mut registry = Self {
            path: Some(path.into()),
            ..Self::default()
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Load the registry file, starting empty if it does not exist yet.
    ///
    /// The file is created by the first [`add`](Self::add).
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        match Self::load(path.clone()) {
            Err(RegistryError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                info!("No QP calls file at {} yet, starting empty", path.display());
                Ok(Self {
                    path: Some(path),
                    ..Self::default()
                })
            }
            other => other,
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn contains(&self, call: &str) -> bool {
        self.calls.iter().any(|c| c == call)
    }

    #[must_use]
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn insert(&mut self, call: String) -> bool {
        if call.is_empty() || self.contains(&call) {
            return false;
        }
        self.calls.push(call);
        true
    }

    fn reload(&mut self) -> Result<(), RegistryError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let io = |source| RegistryError::Io {
            path: path.clone(),
            source,
        };

        let modified = fs::metadata(&path).and_then(|m| m.modified()).map_err(io)?;
        let text = fs::read_to_string(&path).map_err(io)?;

        self.calls.clear();
        for line in text.lines() {
            self.insert(line.trim().to_string());
        }
        self.modified = Some(modified);
        Ok(())
    }

    /// Re-read the file if its modification time differs from the last load.
    ///
    /// Returns `true` when the registry was reloaded. A file that does not
    /// exist counts as unchanged.
    pub fn reload_if_changed(&mut self) -> Result<bool, RegistryError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };

        let current = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(current) => current,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if Some(current) == self.modified {
            return Ok(false);
        }

        info!("Reloading QP calls list from {}", path.display());
        self.reload()?;
        Ok(true)
    }

    /// Add a newly detected participant and append it to the backing file.
    ///
    /// Returns `false` if the call was already registered.
    pub fn add(&mut self, call: &str) -> Result<bool, RegistryError> {
        if !self.insert(call.to_string()) {
            return Ok(false);
        }
        info!("Registered new QP station {call}");

        let Some(path) = self.path.as_deref() else {
            return Ok(true);
        };

        let append = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(format!("{call}\n").as_bytes())?;
            file.sync_data()
        };

        append().map_err(|source| {
            warn!("Failed to append {call} to {}: {source}", path.display());
            RegistryError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;

        Ok(true)
    }
}
