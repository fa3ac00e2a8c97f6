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

//! Bucatini Core — MySQL change-data-capture transfer engine.
//!
//! Bucatini tails a MySQL primary's binary log, transforms row mutations
//! through per-table rules, and publishes the results to downstream sinks,
//! checkpointing binlog positions so the stream survives restarts. Delivery
//! is at-least-once with idempotent routing keys.
//!
//! # Key Components
//!
//! - **Events**: [`event`] defines the typed change events decoded from the
//!   binlog; [`position`] the durable `(file, offset)` checkpoints
//! - **Rules**: [`rule`] compiles per-table directives (wildcard expansion,
//!   projections, routing, Lua transforms via [`script`])
//! - **Source**: [`source`] is the replication client seam; [`mysql`] the
//!   `mysql_async`-backed adapter
//! - **Sinks**: [`destination`] is the uniform endpoint capability;
//!   concrete sinks live in the `bucatini-destinations` crate
//! - **State**: [`state`] abstracts position persistence; implementations
//!   live in the `bucatini-stores` crate
//! - **Engine**: [`pipeline`] wires it all together — handler, bounded
//!   request queue, dispatcher, lifecycle state machine, metrics loop

pub mod destination;
pub mod event;
pub mod metrics;
pub mod mysql;
pub mod pipeline;
pub mod position;
pub mod rule;
pub mod script;
pub mod source;
pub mod state;
