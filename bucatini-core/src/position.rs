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

//! Binlog positions.
//!
//! A [`Position`] identifies a point in the MySQL binary log as a
//! `(file name, byte offset)` pair. Positions are persisted as a whole by a
//! [`PositionStore`](crate::state::PositionStore) and advance monotonically
//! for a single source: binlog file names carry a numeric suffix
//! (`mysql-bin.000003`), so the derived lexicographic ordering matches
//! replication order.
//!
//! # Example
//!
//! ```rust
//! use bucatini_core::position::Position;
//!
//! let checkpoint = Position::new("mysql-bin.000003", 1024);
//! assert!(Position::new("mysql-bin.000002", 9999) < checkpoint);
//! assert!(checkpoint < Position::new("mysql-bin.000003", 2048));
//!
//! // A fresh deployment starts from the genesis position.
//! assert!(Position::genesis().is_genesis());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// A durable point in the binary log: `(file name, byte offset)`.
///
/// The derived ordering compares the file name first and the offset second,
/// which matches binlog order for MySQL's zero-padded log file names.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    /// Binlog file name, e.g. `mysql-bin.000003`.
    pub file: String,

    /// Byte offset within the file.
    pub offset: u64,
}

impl Position {
    /// Creates a position from a file name and offset.
    #[must_use]
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    /// The position a transfer starts from when nothing has been persisted:
    /// an empty file name and a zero offset.
    #[must_use]
    pub fn genesis() -> Self {
        Self::default()
    }

    /// Returns true if this is the genesis position.
    #[must_use]
    pub fn is_genesis(&self) -> bool {
        self.file.is_empty() && self.offset == 0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_file_then_offset() {
        let a = Position::new("mysql-bin.000001", 4096);
        let b = Position::new("mysql-bin.000002", 4);
        let c = Position::new("mysql-bin.000002", 1024);

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn genesis_sorts_before_any_real_position() {
        assert!(Position::genesis() < Position::new("mysql-bin.000001", 4));
    }

    #[test]
    fn serde_round_trip() {
        let pos = Position::new("mysql-bin.000042", 987_654);
        let json = serde_json::to_string(&pos).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(pos, back);
    }

    #[test]
    fn display_is_file_colon_offset() {
        let pos = Position::new("mysql-bin.000003", 1024);
        assert_eq!(pos.to_string(), "mysql-bin.000003:1024");
    }
}
