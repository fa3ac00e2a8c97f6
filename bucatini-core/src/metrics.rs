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

//! Metrics instrumentation for the transfer engine.
//!
//! Uses the `metrics` facade crate, so any exporter (Prometheus, StatsD, …)
//! can be installed by the embedding application; the engine itself never
//! binds a listener.
//!
//! # Naming
//!
//! Prometheus conventions: underscores, unit suffixes, `bucatini_` prefix,
//! counters ending in `_total`.
//!
//! # Labels
//!
//! Low-cardinality only: `table` is `schema.table` (bounded by the rule set),
//! `op` is one of four mutation kinds, `target` is the routing target. Never
//! label with row keys or positions.

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Destination reachability: 1 = OK, 0 = unreachable.
const DESTINATION_STATE: &str = "bucatini_destination_state";

/// Replication delay behind the source, in seconds.
const REPLICATION_DELAY_SECONDS: &str = "bucatini_replication_delay_seconds";

/// Change events handed to the handler.
const EVENTS_TOTAL: &str = "bucatini_events_total";

/// Requests delivered to the destination.
const REQUESTS_PUBLISHED_TOTAL: &str = "bucatini_requests_published_total";

/// Positions checkpointed by the dispatcher.
const POSITIONS_SAVED_TOTAL: &str = "bucatini_positions_saved_total";

/// Publish failures surfaced past the sink's retry policy.
const PUBLISH_ERRORS_TOTAL: &str = "bucatini_publish_errors_total";

/// Registers metric descriptions with the installed recorder.
///
/// Call once at application startup, before the transfer runs.
pub fn init_metrics() {
    describe_gauge!(
        DESTINATION_STATE,
        "Destination reachability: 1 when the endpoint answers pings, 0 otherwise"
    );
    describe_gauge!(
        REPLICATION_DELAY_SECONDS,
        "Seconds the replication stream lags behind the source"
    );
    describe_counter!(
        EVENTS_TOTAL,
        "Total change events handed to the handler, labeled by table and op"
    );
    describe_counter!(
        REQUESTS_PUBLISHED_TOTAL,
        "Total requests delivered to the destination, labeled by target"
    );
    describe_counter!(
        POSITIONS_SAVED_TOTAL,
        "Total binlog positions persisted by the dispatcher"
    );
    describe_counter!(
        PUBLISH_ERRORS_TOTAL,
        "Total publish failures surfaced past the sink's retry policy"
    );
}

/// Records destination reachability from the metrics loop.
pub fn set_destination_state(ok: bool) {
    gauge!(DESTINATION_STATE).set(if ok { 1.0 } else { 0.0 });
}

/// Records the replication delay gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_replication_delay(seconds: u64) {
    gauge!(REPLICATION_DELAY_SECONDS).set(seconds as f64);
}

/// Counts one change event for `schema.table`.
pub fn increment_events(table: &str, op: &'static str) {
    counter!(EVENTS_TOTAL, "table" => table.to_string(), "op" => op).increment(1);
}

/// Counts requests delivered to a routing target.
pub fn increment_requests_published(target: &str, count: u64) {
    counter!(REQUESTS_PUBLISHED_TOTAL, "target" => target.to_string()).increment(count);
}

/// Counts one persisted position.
pub fn increment_positions_saved() {
    counter!(POSITIONS_SAVED_TOTAL).increment(1);
}

/// Counts one surfaced publish failure.
pub fn increment_publish_errors() {
    counter!(PUBLISH_ERRORS_TOTAL).increment(1);
}
