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

//! In-memory position store.
//!
//! Suitable for local development, tests, and deliberately ephemeral runs.
//! The position is lost on process exit — a restarted transfer replays from
//! the genesis position, so production deployments should use
//! [`FileStore`](crate::file::FileStore) or another durable backend.
//!
//! # Example
//!
//! ```rust
//! use bucatini_core::position::Position;
//! use bucatini_core::state::PositionStore;
//! use bucatini_stores::memory::MemoryStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! assert!(store.get().await?.is_genesis());
//!
//! store.save(&Position::new("mysql-bin.000003", 1024)).await?;
//! assert_eq!(store.get().await?.offset, 1024);
//! # Ok(())
//! # }
//! ```

use bucatini_core::position::Position;
use bucatini_core::state::{PositionStore, PositionStoreError};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A position store that lives in process memory.
///
/// Cloning shares the underlying slot, which lets tests hold a handle while
/// the transfer owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    current: Arc<RwLock<Option<Position>>>,
}

impl MemoryStore {
    /// Creates an empty store; [`PositionStore::get`] returns the genesis
    /// position until something is saved.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-seeded with a position.
    #[must_use]
    pub fn with_position(position: Position) -> Self {
        Self {
            current: Arc::new(RwLock::new(Some(position))),
        }
    }
}

#[async_trait::async_trait]
impl PositionStore for MemoryStore {
    async fn initialize(&self) -> Result<(), PositionStoreError> {
        Ok(())
    }

    async fn get(&self) -> Result<Position, PositionStoreError> {
        Ok(self
            .current
            .read()
            .await
            .clone()
            .unwrap_or_else(Position::genesis))
    }

    async fn save(&self, position: &Position) -> Result<(), PositionStoreError> {
        debug!(position = %position, "position saved");
        *self.current.write().await = Some(position.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), PositionStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_store_returns_genesis() {
        let store = MemoryStore::new();
        assert!(store.get().await.unwrap().is_genesis());
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = MemoryStore::new();
        let position = Position::new("mysql-bin.000007", 555);

        store.save(&position).await.unwrap();
        assert_eq!(store.get().await.unwrap(), position);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = MemoryStore::new();
        let handle = store.clone();

        store
            .save(&Position::new("mysql-bin.000001", 4))
            .await
            .unwrap();
        assert_eq!(handle.get().await.unwrap().offset, 4);
    }

    #[tokio::test]
    async fn seeded_store_returns_seed() {
        let store = MemoryStore::with_position(Position::new("mysql-bin.000002", 99));
        assert_eq!(store.get().await.unwrap().offset, 99);
    }
}
