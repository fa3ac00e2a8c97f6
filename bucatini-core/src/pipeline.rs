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

//! The transfer engine.
//!
//! [`Transfer`] owns every moving part: the replication client (rebuilt on
//! each pause/resume cycle), the compiled rule registry, the position store,
//! and the destination endpoint. Three loops cooperate:
//!
//! - the **client task** decodes binlog events and invokes the
//!   [`TransferHandler`] synchronously; the handler does nothing heavier than
//!   building requests and admitting them to the bounded queue, so a full
//!   queue backpressures the source;
//! - the **dispatcher** is the queue's single consumer: it publishes request
//!   batches, applies rule refreshes, and checkpoints positions — in the
//!   exact order the client produced them, which is binlog order;
//! - the **metrics loop** pings the endpoint and samples replication delay
//!   every ten seconds.
//!
//! The lifecycle is one enum-typed state advanced with atomic
//! compare-and-swap: `Uninitialized → Initialized → Running ⇄ Paused →
//! Closed`. The dispatcher is started at most once per process; pausing
//! closes the client and lets the dispatcher drain in-flight items.
//!
//! Positions are checkpointed only by the dispatcher, after the requests
//! ahead of them have been published. On restart the stream resumes from the
//! last persisted position, so delivery is at-least-once and destinations
//! must be idempotent on the request's routing key.
//!
//! # Example
//!
//! ```rust,no_run
//! use bucatini_core::mysql::MySqlSourceFactory;
//! use bucatini_core::pipeline::{Transfer, TransferConfig};
//! use bucatini_core::rule::RuleConfig;
//! use bucatini_core::source::SourceConfig;
//!
//! # async fn example(
//! #     store: impl bucatini_core::state::PositionStore + 'static,
//! #     endpoint: impl bucatini_core::destination::Destination + 'static,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = TransferConfig::builder()
//!     .source(SourceConfig {
//!         addr: "127.0.0.1:3306".into(),
//!         user: "repl".into(),
//!         password: "secret".into(),
//!         charset: "utf8mb4".into(),
//!         flavor: Default::default(),
//!         server_id: 1001,
//!         skip_master_data: false,
//!         include_table_regex: vec![],
//!     })
//!     .rule(RuleConfig::new("app", "users"))
//!     .build()?;
//!
//! let transfer = Transfer::new(config, MySqlSourceFactory, store, endpoint);
//! transfer.initialize().await?;
//! transfer.run().await?; // blocks until the stream ends
//! # Ok(())
//! # }
//! ```

use crate::destination::{Destination, DestinationError, Request, RequestOp};
use crate::event::{EventKind, RowEvent, RowImage};
use crate::metrics;
use crate::position::Position;
use crate::rule::{Rule, RuleConfig, RuleError, RuleRegistry};
use crate::script::{ScriptRuntime, TransformInput};
use crate::source::{
    BinlogSource, EventHandler, HandlerError, SourceConfig, SourceError, SourceFactory,
};
use crate::state::{PositionStore, PositionStoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Metrics loop tick.
const METRICS_TICK: Duration = Duration::from_secs(10);

/// Default request queue capacity — the backpressure boundary toward the
/// source.
const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Smallest queue the builder accepts.
const MIN_QUEUE_CAPACITY: usize = 16;

/// Largest queue the builder accepts.
const MAX_QUEUE_CAPACITY: usize = 1 << 20;

/// Configuration for the transfer engine.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Replication source settings.
    pub source: SourceConfig,

    /// Rule templates, expanded at initialization.
    pub rules: Vec<RuleConfig>,

    /// Working directory for transform script files.
    pub data_dir: PathBuf,

    /// Permit tables without a primary key.
    pub skip_no_pk_table: bool,

    /// Request queue capacity.
    pub queue_capacity: usize,

    /// Run the metrics loop.
    pub metrics_enabled: bool,
}

impl TransferConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> TransferConfigBuilder {
        TransferConfigBuilder::default()
    }
}

/// Builder for [`TransferConfig`] with validation.
#[derive(Debug, Default)]
pub struct TransferConfigBuilder {
    source: Option<SourceConfig>,
    rules: Vec<RuleConfig>,
    data_dir: Option<PathBuf>,
    skip_no_pk_table: bool,
    queue_capacity: usize,
    metrics_enabled: bool,
}

impl TransferConfigBuilder {
    /// Sets the replication source.
    #[must_use]
    pub fn source(mut self, source: SourceConfig) -> Self {
        self.source = Some(source);
        self
    }

    /// Adds one rule template.
    #[must_use]
    pub fn rule(mut self, rule: RuleConfig) -> Self {
        self.rules.push(rule);
        self
    }

    /// Adds several rule templates.
    #[must_use]
    pub fn rules(mut self, rules: impl IntoIterator<Item = RuleConfig>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Sets the working directory for transform scripts.
    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Permits tables without a primary key.
    #[must_use]
    pub fn skip_no_pk_table(mut self, skip: bool) -> Self {
        self.skip_no_pk_table = skip;
        self
    }

    /// Overrides the request queue capacity.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Enables the metrics loop.
    #[must_use]
    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    /// Builds the configuration.
    ///
    /// Derives the source-side table filter from the raw rule templates when
    /// none was given explicitly.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or invalid.
    pub fn build(self) -> Result<TransferConfig, ConfigError> {
        let mut source = self.source.ok_or(ConfigError::MissingSource)?;
        if source.addr.is_empty() {
            return Err(ConfigError::MissingAddr);
        }
        if source.user.is_empty() {
            return Err(ConfigError::MissingUser);
        }
        if source.server_id == 0 {
            return Err(ConfigError::InvalidServerId);
        }
        if self.rules.is_empty() {
            return Err(ConfigError::NoRules);
        }

        let queue_capacity = match self.queue_capacity {
            0 => DEFAULT_QUEUE_CAPACITY,
            n if n < MIN_QUEUE_CAPACITY => {
                return Err(ConfigError::InvalidQueueCapacity {
                    value: n,
                    reason: "below the minimum of 16",
                })
            }
            n if n > MAX_QUEUE_CAPACITY => {
                return Err(ConfigError::InvalidQueueCapacity {
                    value: n,
                    reason: "above the maximum of 1048576",
                })
            }
            n => n,
        };

        if source.include_table_regex.is_empty() {
            source.include_table_regex = self
                .rules
                .iter()
                .map(|rule| format!("{}\\.{}", rule.schema, rule.table))
                .collect();
        }

        Ok(TransferConfig {
            source,
            rules: self.rules,
            data_dir: self.data_dir.unwrap_or_else(|| PathBuf::from(".")),
            skip_no_pk_table: self.skip_no_pk_table,
            queue_capacity,
            metrics_enabled: self.metrics_enabled,
        })
    }
}

/// Transfer configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No source configuration was supplied.
    #[error("source configuration is required")]
    MissingSource,

    /// The source address is empty.
    #[error("source addr is required")]
    MissingAddr,

    /// The source user is empty.
    #[error("source user is required")]
    MissingUser,

    /// The replication server id is zero.
    #[error("server_id must be non-zero and unique per source")]
    InvalidServerId,

    /// No rule templates were supplied.
    #[error("at least one rule is required")]
    NoRules,

    /// The queue capacity is out of range.
    #[error("invalid queue_capacity: {value} ({reason})")]
    InvalidQueueCapacity {
        /// The rejected value.
        value: usize,
        /// Why it was rejected.
        reason: &'static str,
    },
}

/// Lifecycle states of a [`Transfer`].
///
/// The legacy pair of atomic flags (`running`, `listener started`) are views
/// over this single state plus the dispatcher-start latch; see
/// [`Transfer::is_running`] and [`Transfer::listener_started`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferState {
    /// Built, not yet initialized.
    Uninitialized = 0,
    /// Components wired; ready to run.
    Initialized = 1,
    /// Replication client streaming.
    Running = 2,
    /// Client closed; dispatcher alive and draining.
    Paused = 3,
    /// Shut down; terminal.
    Closed = 4,
}

impl TransferState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initialized,
            2 => Self::Running,
            3 => Self::Paused,
            4 => Self::Closed,
            _ => Self::Uninitialized,
        }
    }
}

/// Counters kept by the engine, snapshotted by [`Transfer::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Change events handed to the handler.
    pub events_received: u64,

    /// Requests delivered to the destination.
    pub requests_published: u64,

    /// Positions checkpointed.
    pub positions_saved: u64,

    /// Publish failures surfaced past the sink's retries.
    pub publish_errors: u64,

    /// DDL-driven rule refreshes applied.
    pub rule_refreshes: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    events_received: AtomicU64,
    requests_published: AtomicU64,
    positions_saved: AtomicU64,
    publish_errors: AtomicU64,
    rule_refreshes: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> TransferStats {
        TransferStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            requests_published: self.requests_published.load(Ordering::Relaxed),
            positions_saved: self.positions_saved.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            rule_refreshes: self.rule_refreshes.load(Ordering::Relaxed),
        }
    }
}

/// What travels through the request queue, in binlog order.
#[derive(Debug)]
enum QueueItem {
    /// Publish a batch of prepared requests.
    Publish(Vec<Request>),

    /// Refresh one rule's table metadata (DDL seen on its table).
    RefreshRule { schema: String, table: String },

    /// Checkpoint a position (rotate or transaction commit).
    Advance(Position),
}

/// The event handler wired into the replication client.
///
/// Runs on the client's task: looks up the rule, builds requests (running
/// the transform script when the rule has one), and admits them to the
/// bounded queue. Admission is the only place it may block.
pub struct TransferHandler {
    registry: Arc<RuleRegistry>,
    queue: mpsc::Sender<QueueItem>,
    scripts: Mutex<ScriptRuntime>,
    stats: Arc<StatsInner>,
}

impl TransferHandler {
    fn build_requests(&self, rule: &Rule, event: &RowEvent) -> Result<Vec<Request>, HandlerError> {
        match event.kind {
            EventKind::Insert => {
                let Some(after) = &event.after else {
                    return Ok(Vec::new());
                };
                if rule.script.is_some() {
                    self.scripted_request(rule, event, after, None, RequestOp::Upsert)
                } else {
                    Ok(vec![Request::upsert(
                        &rule.target,
                        rule.routing_key(after),
                        rule.payload(after),
                        event.position.clone(),
                    )])
                }
            }
            EventKind::Update => {
                let (Some(before), Some(after)) = (&event.before, &event.after) else {
                    return Ok(Vec::new());
                };
                if rule.script.is_some() {
                    return self.scripted_request(rule, event, after, Some(before), RequestOp::Upsert);
                }

                let old_key = rule.routing_key(before);
                let new_key = rule.routing_key(after);
                let mut requests = Vec::with_capacity(2);
                // A primary-key change moves the row to a new routing key;
                // the old one must be tombstoned first.
                if old_key != new_key {
                    requests.push(Request::delete(
                        &rule.target,
                        old_key,
                        event.position.clone(),
                    ));
                }
                requests.push(Request::upsert(
                    &rule.target,
                    new_key,
                    rule.payload(after),
                    event.position.clone(),
                ));
                Ok(requests)
            }
            EventKind::Delete => {
                let Some(before) = &event.before else {
                    return Ok(Vec::new());
                };
                if rule.script.is_some() {
                    self.scripted_request(rule, event, before, None, RequestOp::Delete)
                } else {
                    Ok(vec![Request::delete(
                        &rule.target,
                        rule.routing_key(before),
                        event.position.clone(),
                    )])
                }
            }
            EventKind::Ddl => Ok(Vec::new()),
        }
    }

    fn scripted_request(
        &self,
        rule: &Rule,
        event: &RowEvent,
        row: &RowImage,
        before: Option<&RowImage>,
        default_op: RequestOp,
    ) -> Result<Vec<Request>, HandlerError> {
        let Some(script) = &rule.script else {
            return Ok(Vec::new());
        };

        let input = TransformInput {
            schema: &event.schema,
            table: &event.table,
            action: event.kind.as_str(),
            row,
            before,
        };
        let output = self
            .scripts
            .lock()
            .apply(script, &input)
            .map_err(|e| HandlerError::Script(e.to_string()))?;

        let Some(output) = output else {
            return Ok(Vec::new());
        };

        let key = output.key.unwrap_or_else(|| rule.routing_key(row));
        let op = match output.action.as_deref() {
            None => default_op,
            Some("upsert") => RequestOp::Upsert,
            Some("delete") => RequestOp::Delete,
            Some(other) => {
                return Err(HandlerError::Script(format!(
                    "unknown action {other:?} returned by {}",
                    script.name()
                )))
            }
        };

        let request = match op {
            RequestOp::Upsert => Request::upsert(
                &rule.target,
                key,
                output.value.unwrap_or_else(|| rule.payload(row)),
                event.position.clone(),
            ),
            RequestOp::Delete => Request::delete(&rule.target, key, event.position.clone()),
        };
        Ok(vec![request])
    }
}

#[async_trait]
impl EventHandler for TransferHandler {
    async fn on_row(&self, event: RowEvent) -> Result<(), HandlerError> {
        if event.kind == EventKind::Ddl {
            return Ok(());
        }

        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
        metrics::increment_events(&event.qualified_name(), event.kind.as_str());

        let Some(rule) = self.registry.get(&event.schema, &event.table).await else {
            return Ok(());
        };

        let requests = self.build_requests(&rule, &event)?;
        if !requests.is_empty() {
            self.queue
                .send(QueueItem::Publish(requests))
                .await
                .map_err(|_| HandlerError::QueueClosed)?;
        }
        Ok(())
    }

    async fn on_ddl(
        &self,
        schema: &str,
        table: &str,
        _position: Position,
    ) -> Result<(), HandlerError> {
        if self.registry.contains(schema, table).await {
            self.queue
                .send(QueueItem::RefreshRule {
                    schema: schema.to_string(),
                    table: table.to_string(),
                })
                .await
                .map_err(|_| HandlerError::QueueClosed)?;
        }
        Ok(())
    }

    async fn on_position(&self, position: Position) -> Result<(), HandlerError> {
        self.queue
            .send(QueueItem::Advance(position))
            .await
            .map_err(|_| HandlerError::QueueClosed)
    }
}

/// Errors surfaced by the transfer controller.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// A lifecycle method was called in the wrong state.
    #[error("invalid lifecycle transition: {0}")]
    InvalidState(&'static str),

    /// Rule expansion or compilation failed.
    #[error(transparent)]
    Rule(#[from] RuleError),

    /// The replication source failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The destination endpoint failed.
    #[error(transparent)]
    Destination(#[from] DestinationError),

    /// The position store failed.
    #[error(transparent)]
    PositionStore(#[from] PositionStoreError),

    /// The dispatcher aborted the engine (publish or persist failure).
    #[error("transfer aborted: {0}")]
    Aborted(String),
}

/// The transfer controller.
///
/// Owns the replication client, rule registry, position store, and
/// destination endpoint; drives the lifecycle state machine. See the module
/// docs for the task layout.
pub struct Transfer<F: SourceFactory, P, D> {
    config: TransferConfig,
    factory: F,
    registry: Arc<RuleRegistry>,
    source: Arc<AsyncMutex<Option<Arc<F::Source>>>>,
    store: Arc<P>,
    endpoint: Arc<AsyncMutex<D>>,
    handler: OnceLock<Arc<TransferHandler>>,
    queue_rx: AsyncMutex<Option<mpsc::Receiver<QueueItem>>>,
    state: AtomicU8,
    dispatcher: AsyncMutex<Option<JoinHandle<()>>>,
    dispatcher_started: AtomicBool,
    metrics_started: AtomicBool,
    shutdown: broadcast::Sender<()>,
    stats: Arc<StatsInner>,
    fatal: Arc<Mutex<Option<String>>>,
}

impl<F, P, D> Transfer<F, P, D>
where
    F: SourceFactory + Send + Sync + 'static,
    P: PositionStore + 'static,
    D: Destination + 'static,
{
    /// Creates a transfer in the `Uninitialized` state.
    pub fn new(config: TransferConfig, factory: F, store: P, endpoint: D) -> Self {
        let registry = Arc::new(RuleRegistry::new(
            config.skip_no_pk_table,
            config.data_dir.clone(),
        ));
        let (shutdown, _) = broadcast::channel(4);

        Self {
            config,
            factory,
            registry,
            source: Arc::new(AsyncMutex::new(None)),
            store: Arc::new(store),
            endpoint: Arc::new(AsyncMutex::new(endpoint)),
            handler: OnceLock::new(),
            queue_rx: AsyncMutex::new(None),
            state: AtomicU8::new(TransferState::Uninitialized as u8),
            dispatcher: AsyncMutex::new(None),
            dispatcher_started: AtomicBool::new(false),
            metrics_started: AtomicBool::new(false),
            shutdown,
            stats: Arc::new(StatsInner::default()),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransferState {
        TransferState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// View: true while the replication client is streaming.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == TransferState::Running
    }

    /// View: true once the dispatcher has been started (it starts at most
    /// once per process).
    #[must_use]
    pub fn listener_started(&self) -> bool {
        self.dispatcher_started.load(Ordering::SeqCst)
    }

    /// Snapshot of the engine counters.
    #[must_use]
    pub fn stats(&self) -> TransferStats {
        self.stats.snapshot()
    }

    /// The compiled rule registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    fn transition(&self, from: TransferState, to: TransferState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Builds the replication client, compiles the rules, starts the
    /// endpoint, seeds the dumper, and opens the position store.
    ///
    /// # Errors
    ///
    /// Any failure aborts initialization and leaves the transfer
    /// `Uninitialized` with no partial state.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), TransferError> {
        if self.state() != TransferState::Uninitialized {
            return Err(TransferError::InvalidState(
                "initialize requires an uninitialized transfer",
            ));
        }

        match self.initialize_inner().await {
            Ok(()) => {
                self.state
                    .store(TransferState::Initialized as u8, Ordering::SeqCst);
                info!(rules = self.registry.len().await, "transfer initialized");
                Ok(())
            }
            Err(e) => {
                *self.source.lock().await = None;
                *self.queue_rx.lock().await = None;
                self.registry.clear().await;
                Err(e)
            }
        }
    }

    async fn initialize_inner(&self) -> Result<(), TransferError> {
        let source = Arc::new(self.factory.create(&self.config.source).await?);

        self.registry
            .compile(source.as_ref(), &self.config.rules)
            .await?;

        self.endpoint.lock().await.start().await?;
        metrics::set_destination_state(true);

        self.seed_dumper(source.as_ref()).await;

        self.store.initialize().await?;

        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        let handler = Arc::new(TransferHandler {
            registry: Arc::clone(&self.registry),
            queue: queue_tx,
            scripts: Mutex::new(ScriptRuntime::new()),
            stats: Arc::clone(&self.stats),
        });
        let _ = self.handler.set(handler);
        *self.queue_rx.lock().await = Some(queue_rx);
        *self.source.lock().await = Some(source);

        Ok(())
    }

    /// Seeds the initial snapshot: a single distinct schema dumps its tables,
    /// several schemas dump whole databases.
    async fn seed_dumper(&self, source: &F::Source) {
        let rules = self.registry.snapshot().await;
        let mut schemas: BTreeSet<&str> = BTreeSet::new();
        let mut tables: Vec<String> = Vec::with_capacity(rules.len());
        for rule in &rules {
            schemas.insert(rule.schema.as_str());
            tables.push(rule.table.clone());
        }

        if schemas.len() == 1 {
            if let Some(schema) = schemas.iter().next() {
                source.add_dump_tables(schema, &tables);
            }
        } else if !schemas.is_empty() {
            let schemas: Vec<String> = schemas.into_iter().map(String::from).collect();
            source.add_dump_databases(&schemas);
        }
    }

    /// Starts the dispatcher and metrics loops, reads the persisted position,
    /// and runs replication. Blocks until the client exits, errors, or the
    /// dispatcher aborts the engine.
    ///
    /// # Errors
    ///
    /// Returns the stream or abort error; the transfer parks in `Paused` on
    /// stream failure so a supervisor may [`Transfer::restart`] it.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), TransferError> {
        if !self.transition(TransferState::Initialized, TransferState::Running) {
            return Err(TransferError::InvalidState(
                "run requires an initialized transfer",
            ));
        }

        self.start_dispatcher().await;
        if self.config.metrics_enabled {
            self.start_metrics_loop();
        }

        self.run_client().await
    }

    /// Closes the replication client and leaves the dispatcher draining
    /// in-flight queue items. No-op unless running.
    pub async fn pause(&self) {
        if self.transition(TransferState::Running, TransferState::Paused) {
            if let Some(source) = self.source.lock().await.take() {
                source.close().await;
            }
            info!("transfer paused");
        }
    }

    /// Resumes a transfer: first-ever start goes through [`Transfer::run`],
    /// a paused transfer gets a fresh replication client and reruns from the
    /// last persisted position, anything else is a no-op. The dispatcher is
    /// never restarted.
    ///
    /// # Errors
    ///
    /// Propagates the same errors as [`Transfer::run`].
    #[instrument(skip(self))]
    pub async fn restart(&self) -> Result<(), TransferError> {
        if !self.dispatcher_started.load(Ordering::SeqCst) {
            info!("transfer run");
            return self.run().await;
        }

        if self.state() == TransferState::Paused && self.source.lock().await.is_none() {
            info!("transfer rerun");
            return self.rerun().await;
        }

        debug!("restart ignored");
        Ok(())
    }

    async fn rerun(&self) -> Result<(), TransferError> {
        if !self.transition(TransferState::Paused, TransferState::Running) {
            return Err(TransferError::InvalidState("rerun requires a paused transfer"));
        }

        let source = match self.factory.create(&self.config.source).await {
            Ok(source) => Arc::new(source),
            Err(e) => {
                let _ = self.transition(TransferState::Running, TransferState::Paused);
                return Err(e.into());
            }
        };
        self.seed_dumper(source.as_ref()).await;
        *self.source.lock().await = Some(source);

        self.run_client().await
    }

    async fn run_client(&self) -> Result<(), TransferError> {
        let result = self.run_client_inner().await;
        // A finished client parks the transfer in Paused unless close() has
        // already marked it Closed.
        let _ = self.transition(TransferState::Running, TransferState::Paused);
        result
    }

    async fn run_client_inner(&self) -> Result<(), TransferError> {
        let position = self.store.get().await?;
        let source = self
            .source
            .lock()
            .await
            .clone()
            .ok_or(TransferError::InvalidState("no replication client"))?;
        let handler = self
            .handler
            .get()
            .cloned()
            .ok_or(TransferError::InvalidState("transfer not initialized"))?;

        info!(position = %position, "transfer running from position");

        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::select! {
            result = source.run_from(position, handler) => {
                *self.source.lock().await = None;
                match result {
                    Ok(()) => {
                        info!("replication client closed");
                        Ok(())
                    }
                    Err(e) => {
                        if self.state() == TransferState::Closed {
                            info!("replication client closed");
                            return Ok(());
                        }
                        error!(error = %e, "replication stream failed");
                        Err(e.into())
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                source.close().await;
                *self.source.lock().await = None;
                match self.fatal.lock().take() {
                    Some(reason) => {
                        self.state.store(TransferState::Closed as u8, Ordering::SeqCst);
                        Err(TransferError::Aborted(reason))
                    }
                    None => {
                        info!("replication client closed");
                        Ok(())
                    }
                }
            }
        }
    }

    async fn start_dispatcher(&self) {
        if self.dispatcher_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(queue) = self.queue_rx.lock().await.take() else {
            return;
        };

        let handle = tokio::spawn(Self::dispatcher_loop(
            queue,
            Arc::clone(&self.endpoint),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.source),
            Arc::clone(&self.stats),
            Arc::clone(&self.fatal),
            self.shutdown.clone(),
        ));
        *self.dispatcher.lock().await = Some(handle);
    }

    /// The queue's single consumer: publishes, refreshes rules, checkpoints.
    #[allow(clippy::too_many_arguments)]
    async fn dispatcher_loop(
        mut queue: mpsc::Receiver<QueueItem>,
        endpoint: Arc<AsyncMutex<D>>,
        store: Arc<P>,
        registry: Arc<RuleRegistry>,
        source: Arc<AsyncMutex<Option<Arc<F::Source>>>>,
        stats: Arc<StatsInner>,
        fatal: Arc<Mutex<Option<String>>>,
        shutdown: broadcast::Sender<()>,
    ) {
        let mut shutdown_rx = shutdown.subscribe();
        info!("dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("dispatcher shutting down");
                    break;
                }
                item = queue.recv() => {
                    let Some(item) = item else { break };
                    match item {
                        QueueItem::Publish(requests) => {
                            let count = requests.len() as u64;
                            let target = requests
                                .first()
                                .map(|r| r.target.clone())
                                .unwrap_or_default();

                            let result = endpoint.lock().await.publish(requests).await;
                            match result {
                                Ok(()) => {
                                    stats.requests_published.fetch_add(count, Ordering::Relaxed);
                                    metrics::increment_requests_published(&target, count);
                                }
                                Err(e) => {
                                    stats.publish_errors.fetch_add(1, Ordering::Relaxed);
                                    metrics::increment_publish_errors();
                                    metrics::set_destination_state(false);
                                    error!(error = %e, sink_target = %target, "publish failed; aborting transfer");
                                    *fatal.lock() = Some(format!("publish failed: {e}"));
                                    let _ = shutdown.send(());
                                    break;
                                }
                            }
                        }
                        QueueItem::RefreshRule { schema, table } => {
                            let client = source.lock().await.clone();
                            match client {
                                Some(client) => {
                                    match registry.update_rule(client.as_ref(), &schema, &table).await {
                                        Ok(()) => {
                                            stats.rule_refreshes.fetch_add(1, Ordering::Relaxed);
                                        }
                                        Err(e) => {
                                            // The rule keeps its prior metadata;
                                            // stale but usable until the next DDL.
                                            error!(
                                                rule = %format!("{schema}.{table}"),
                                                error = %e,
                                                "rule refresh failed"
                                            );
                                        }
                                    }
                                }
                                None => {
                                    warn!(
                                        rule = %format!("{schema}.{table}"),
                                        "rule refresh skipped; source not connected"
                                    );
                                }
                            }
                        }
                        QueueItem::Advance(position) => {
                            if let Err(e) = store.save(&position).await {
                                error!(error = %e, position = %position, "position persist failed; aborting transfer");
                                *fatal.lock() = Some(format!("position persist failed: {e}"));
                                let _ = shutdown.send(());
                                break;
                            }
                            stats.positions_saved.fetch_add(1, Ordering::Relaxed);
                            metrics::increment_positions_saved();
                        }
                    }
                }
            }
        }

        info!("dispatcher stopped");
    }

    fn start_metrics_loop(&self) {
        if self.metrics_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let endpoint = Arc::clone(&self.endpoint);
        let source = Arc::clone(&self.source);
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + METRICS_TICK, METRICS_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let ok = endpoint.lock().await.ping().await.is_ok();
                        metrics::set_destination_state(ok);
                        if let Some(client) = source.lock().await.as_ref() {
                            metrics::set_replication_delay(client.delay());
                        }
                    }
                }
            }
            debug!("metrics loop stopped");
        });
    }

    /// Cancels the scope, closes the client and endpoint, and waits for the
    /// dispatcher. Idempotent; queued items not yet dispatched are discarded
    /// (their positions were never checkpointed, so a later run replays
    /// them).
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let previous = self
            .state
            .swap(TransferState::Closed as u8, Ordering::SeqCst);
        if previous == TransferState::Closed as u8 {
            return;
        }
        info!("closing transfer");

        if let Some(source) = self.source.lock().await.take() {
            source.close().await;
        }
        let _ = self.shutdown.send(());

        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatcher task failed");
            }
        }

        if let Err(e) = self.endpoint.lock().await.close().await {
            warn!(error = %e, "endpoint close failed");
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "position store close failed");
        }

        let stats = self.stats();
        info!(
            events_received = stats.events_received,
            requests_published = stats.requests_published,
            positions_saved = stats.positions_saved,
            publish_errors = stats.publish_errors,
            "transfer closed"
        );
    }
}
