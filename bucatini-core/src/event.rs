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

//! Row-level change events.
//!
//! A [`RowEvent`] is one row mutation decoded from the binary log. Events are
//! immutable once produced by the source adapter and flow from the replication
//! client through the handler into destination requests.
//!
//! Row images are JSON objects keyed by column name; the source adapter
//! resolves column names from table metadata because binlog row events carry
//! only ordinals and values.
//!
//! # Example
//!
//! ```rust
//! use bucatini_core::event::{EventKind, RowEvent};
//! use bucatini_core::position::Position;
//! use chrono::Utc;
//! use serde_json::json;
//!
//! let event = RowEvent {
//!     kind: EventKind::Insert,
//!     schema: "app".to_string(),
//!     table: "users".to_string(),
//!     before: None,
//!     after: Some(json!({ "id": 7, "name": "x" }).as_object().cloned().unwrap()),
//!     position: Position::new("mysql-bin.000003", 1024),
//!     timestamp: Utc::now(),
//! };
//!
//! assert!(event.is_insert());
//! assert_eq!(event.qualified_name(), "app.users");
//! ```

use crate::position::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row image: column name → value.
pub type RowImage = serde_json::Map<String, Value>;

/// The kind of mutation a [`RowEvent`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A row was inserted; only the after-image is present.
    Insert,

    /// A row was updated; both images are present.
    Update,

    /// A row was deleted; only the before-image is present.
    Delete,

    /// A schema change hit the table; no row images.
    Ddl,
}

impl EventKind {
    /// Lowercase label, used for metric labels and script input.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Ddl => "ddl",
        }
    }
}

/// One row mutation read from the binary log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowEvent {
    /// Mutation kind.
    pub kind: EventKind,

    /// Schema (database) the table lives in.
    pub schema: String,

    /// Table name.
    pub table: String,

    /// Row state before the mutation (update and delete).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<RowImage>,

    /// Row state after the mutation (insert and update).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<RowImage>,

    /// Commit position of the enclosing binlog event.
    pub position: Position,

    /// Server timestamp from the binlog event header.
    pub timestamp: DateTime<Utc>,
}

impl RowEvent {
    /// Returns true for insert events.
    #[inline]
    #[must_use]
    pub fn is_insert(&self) -> bool {
        self.kind == EventKind::Insert
    }

    /// Returns true for update events.
    #[inline]
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.kind == EventKind::Update
    }

    /// Returns true for delete events.
    #[inline]
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.kind == EventKind::Delete
    }

    /// Fully-qualified table name, `schema.table`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}
