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

//! Durable position storage.
//!
//! The [`PositionStore`] trait abstracts the backend that persists the binlog
//! [`Position`]. The dispatcher is the only writer; the controller reads once
//! at start. A store must make [`PositionStore::save`] atomic and durable on
//! return — the engine's at-least-once contract hangs on it.
//!
//! # Example
//!
//! ```rust
//! use bucatini_core::position::Position;
//! use bucatini_core::state::{PositionStore, PositionStoreError};
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//!
//! /// In-memory implementation for testing.
//! #[derive(Default)]
//! struct MemoryPositionStore {
//!     current: Arc<RwLock<Option<Position>>>,
//! }
//!
//! #[async_trait::async_trait]
//! impl PositionStore for MemoryPositionStore {
//!     async fn initialize(&self) -> Result<(), PositionStoreError> {
//!         Ok(())
//!     }
//!
//!     async fn get(&self) -> Result<Position, PositionStoreError> {
//!         Ok(self.current.read().await.clone().unwrap_or_else(Position::genesis))
//!     }
//!
//!     async fn save(&self, position: &Position) -> Result<(), PositionStoreError> {
//!         *self.current.write().await = Some(position.clone());
//!         Ok(())
//!     }
//!
//!     async fn close(&self) -> Result<(), PositionStoreError> {
//!         Ok(())
//!     }
//! }
//! ```

use crate::position::Position;

/// Trait for position storage backends.
///
/// Implementations should persist the position durably enough to survive a
/// process restart; the engine replays from whatever [`PositionStore::get`]
/// returns.
#[async_trait::async_trait]
pub trait PositionStore: Send + Sync {
    /// Opens or creates the backing store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    async fn initialize(&self) -> Result<(), PositionStoreError>;

    /// Returns the most recently persisted position, or the genesis position
    /// if nothing has been saved yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the position cannot be read.
    async fn get(&self) -> Result<Position, PositionStoreError>;

    /// Persists the position. Atomic and durable on return.
    ///
    /// # Errors
    ///
    /// Returns an error if the position cannot be written; the engine treats
    /// this as fatal.
    async fn save(&self, position: &Position) -> Result<(), PositionStoreError>;

    /// Closes the store, releasing any resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be closed cleanly.
    async fn close(&self) -> Result<(), PositionStoreError>;
}

/// Errors that can occur during position store operations.
#[derive(Debug, thiserror::Error)]
pub enum PositionStoreError {
    /// I/O error from the backing medium.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend is unreachable.
    #[error("connection error: {0}")]
    Connection(String),

    /// Other errors.
    #[error("position store error: {0}")]
    Other(String),
}
