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

//! Bucatini Destinations — sink implementations.
//!
//! Implementations of the
//! [`Destination`](bucatini_core::destination::Destination) capability:
//!
//! - [`memory::MemoryDestination`] — captures requests in process memory;
//!   for tests, demos, and prototyping
//! - [`redis::RedisDestination`] — key-value sink: upserts become `SET`,
//!   deletes become `DEL` (enabled with the `redis` feature, on by default)
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use bucatini_destinations::redis::{RedisConfig, RedisDestination};
//!
//! let config = RedisConfig::builder()
//!     .url("redis://localhost:6379")
//!     .namespace("bucatini")
//!     .build()?;
//! let destination = RedisDestination::new(config);
//! ```

pub mod memory;

// Redis sink (enabled with the "redis" feature)
#[cfg(feature = "redis")]
pub mod redis;
