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

//! In-memory destination.
//!
//! Captures every published request in process memory. Useful for tests and
//! demos; production pipelines want a real sink.
//!
//! # Example
//!
//! ```rust
//! use bucatini_core::destination::{Destination, Request};
//! use bucatini_core::position::Position;
//! use bucatini_destinations::memory::MemoryDestination;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut destination = MemoryDestination::new();
//! destination.start().await?;
//!
//! destination
//!     .publish(vec![Request::upsert(
//!         "app.users",
//!         "7",
//!         json!({ "id": 7 }),
//!         Position::new("mysql-bin.000003", 1024),
//!     )])
//!     .await?;
//!
//! assert_eq!(destination.requests().await.len(), 1);
//! # Ok(())
//! # }
//! ```

use bucatini_core::destination::{Destination, DestinationError, Request};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A destination that appends every request to an in-memory log.
///
/// Cloning shares the log, so tests can keep a handle while the transfer
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    requests: Arc<RwLock<Vec<Request>>>,
}

impl MemoryDestination {
    /// Creates an empty destination.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in publish order.
    pub async fn requests(&self) -> Vec<Request> {
        self.requests.read().await.clone()
    }

    /// Number of captured requests.
    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    /// Returns true when nothing has been published.
    pub async fn is_empty(&self) -> bool {
        self.requests.read().await.is_empty()
    }

    /// Drops everything captured so far.
    pub async fn clear(&self) {
        self.requests.write().await.clear();
    }
}

#[async_trait::async_trait]
impl Destination for MemoryDestination {
    async fn start(&mut self) -> Result<(), DestinationError> {
        Ok(())
    }

    async fn publish(&mut self, requests: Vec<Request>) -> Result<(), DestinationError> {
        debug!(count = requests.len(), "requests captured");
        self.requests.write().await.extend(requests);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), DestinationError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DestinationError> {
        Ok(())
    }
}
