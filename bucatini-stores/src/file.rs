// Copyright 2025 Bucatini Contributors
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
//
// SPDX-License-Identifier: Apache-2.0

//! File-backed position store.
//!
//! Persists the position as a small JSON document. Every save writes to a
//! sibling temp file, fsyncs it, and renames it over the target — the rename
//! is atomic on POSIX filesystems, so a crash mid-save leaves either the old
//! position or the new one, never a torn file.
//!
//! # Example
//!
//! ```rust,no_run
//! use bucatini_core::position::Position;
//! use bucatini_core::state::PositionStore;
//! use bucatini_stores::file::FileStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = FileStore::new("/var/lib/bucatini/position.json");
//! store.initialize().await?;
//!
//! store.save(&Position::new("mysql-bin.000003", 1024)).await?;
//! assert_eq!(store.get().await?.offset, 1024);
//! # Ok(())
//! # }
//! ```

use bucatini_core::position::Position;
use bucatini_core::state::{PositionStore, PositionStoreError};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// A position store backed by a JSON file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Creates a store at `path`. Nothing touches the filesystem until
    /// [`PositionStore::initialize`].
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        path.set_extension("tmp");
        path
    }
}

#[async_trait::async_trait]
impl PositionStore for FileStore {
    async fn initialize(&self) -> Result<(), PositionStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        info!(path = %self.path.display(), "file position store ready");
        Ok(())
    }

    async fn get(&self) -> Result<Position, PositionStoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted position; starting from genesis");
                return Ok(Position::genesis());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes)
            .map_err(|e| PositionStoreError::Serialization(e.to_string()))
    }

    async fn save(&self, position: &Position) -> Result<(), PositionStoreError> {
        let payload = serde_json::to_vec(position)
            .map_err(|e| PositionStoreError::Serialization(e.to_string()))?;

        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&payload).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &self.path).await?;
        debug!(position = %position, "position saved");
        Ok(())
    }

    async fn close(&self) -> Result<(), PositionStoreError> {
        Ok(())
    }
}
