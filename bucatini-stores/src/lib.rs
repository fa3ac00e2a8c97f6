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

//! Bucatini Stores — position store implementations.
//!
//! Implementations of the
//! [`PositionStore`](bucatini_core::state::PositionStore) trait:
//!
//! - [`memory::MemoryStore`] — in-process, for tests and ephemeral runs
//! - [`file::FileStore`] — a JSON file written with temp-file-then-rename
//!   atomicity, for single-node deployments

pub mod file;
pub mod memory;
