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

//! Redis key-value destination.
//!
//! Maps requests onto Redis commands: upserts become `SET` (with an optional
//! TTL), deletes become `DEL`. Keys are
//! `[namespace:]target:routing-key`, so a rule for `app.users` with primary
//! key `7` lands at `app.users:7`.
//!
//! Replays after a crash rewrite the same keys — `SET` and `DEL` are
//! idempotent, which is exactly what the engine's at-least-once delivery
//! needs.

mod config;
mod destination;

pub use config::{RedisConfig, RedisConfigBuilder, RedisConfigError};
pub use destination::RedisDestination;
