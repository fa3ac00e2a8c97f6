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

//! Integration tests for the transfer engine.
//!
//! These tests drive a [`Transfer`] end to end against a scripted source:
//! - Insert propagation and position checkpointing
//! - Primary-key transitions on update
//! - Publish-failure abort semantics
//! - Pause / restart from the persisted position
//! - DDL-driven rule refresh
//! - Queue backpressure toward the source
//! - Dumper seeding
//! - Lua transforms on the hot path

use bucatini_core::destination::{Destination, DestinationError, Request, RequestOp};
use bucatini_core::event::{EventKind, RowEvent, RowImage};
use bucatini_core::pipeline::{Transfer, TransferConfig, TransferState};
use bucatini_core::position::Position;
use bucatini_core::rule::RuleConfig;
use bucatini_core::source::{
    BinlogSource, ColumnInfo, EventHandler, Flavor, SourceConfig, SourceError, SourceFactory,
    TableInfo,
};
use bucatini_core::state::{PositionStore, PositionStoreError};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;

// ============================================================================
// Scripted source
// ============================================================================

/// One step of a scripted replication session.
#[derive(Debug, Clone)]
enum Feed {
    Row(RowEvent),
    Ddl {
        schema: String,
        table: String,
        position: Position,
    },
    Advance(Position),
}

/// A recorded dumper seeding call.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Seed {
    Tables(String, Vec<String>),
    Databases(Vec<String>),
}

/// State shared between the test body, the factory, and every source it
/// vends.
#[derive(Clone, Default)]
struct SourceWorld {
    tables: Arc<Mutex<HashMap<(String, String), TableInfo>>>,
    run_positions: Arc<Mutex<Vec<Position>>>,
    seeds: Arc<Mutex<Vec<Seed>>>,
    delivered: Arc<AtomicUsize>,
}

impl SourceWorld {
    fn add_table(&self, schema: &str, table: &str, pk: &[&str], columns: &[&str]) {
        let info = TableInfo {
            schema: schema.to_string(),
            table: table.to_string(),
            columns: columns
                .iter()
                .map(|c| ColumnInfo {
                    name: (*c).to_string(),
                    column_type: "varchar".into(),
                    is_pk: pk.contains(c),
                })
                .collect(),
        };
        self.tables
            .lock()
            .unwrap()
            .insert((schema.to_string(), table.to_string()), info);
    }

    fn scripted(&self, feed: Vec<Feed>, hold_open: bool) -> FakeSource {
        FakeSource {
            feed: Mutex::new(feed),
            world: self.clone(),
            hold_open,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn saved_runs(&self) -> Vec<Position> {
        self.run_positions.lock().unwrap().clone()
    }
}

/// A replication client that plays a prepared feed through the handler.
struct FakeSource {
    feed: Mutex<Vec<Feed>>,
    world: SourceWorld,
    hold_open: bool,
    closed: AtomicBool,
    notify: Notify,
}

#[async_trait::async_trait]
impl BinlogSource for FakeSource {
    async fn list_tables(&self, schema: &str, pattern: &str) -> Result<Vec<String>, SourceError> {
        let regex = regex::Regex::new(pattern)
            .map_err(|e| SourceError::Query(format!("bad pattern: {e}")))?;
        let mut tables: Vec<String> = self
            .world
            .tables
            .lock()
            .unwrap()
            .keys()
            .filter(|(s, t)| s == schema && regex.is_match(t))
            .map(|(_, t)| t.clone())
            .collect();
        tables.sort();
        Ok(tables)
    }

    async fn table_info(&self, schema: &str, table: &str) -> Result<TableInfo, SourceError> {
        self.world
            .tables
            .lock()
            .unwrap()
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
            .ok_or_else(|| SourceError::Metadata {
                schema: schema.to_string(),
                table: table.to_string(),
                reason: "table not found".into(),
            })
    }

    fn add_dump_tables(&self, schema: &str, tables: &[String]) {
        let mut sorted = tables.to_vec();
        sorted.sort();
        self.world
            .seeds
            .lock()
            .unwrap()
            .push(Seed::Tables(schema.to_string(), sorted));
    }

    fn add_dump_databases(&self, schemas: &[String]) {
        self.world
            .seeds
            .lock()
            .unwrap()
            .push(Seed::Databases(schemas.to_vec()));
    }

    async fn run_from(
        &self,
        from: Position,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SourceError> {
        self.world.run_positions.lock().unwrap().push(from);

        let feed: Vec<Feed> = self.feed.lock().unwrap().drain(..).collect();
        for item in feed {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            match item {
                Feed::Row(event) => handler.on_row(event).await?,
                Feed::Ddl {
                    schema,
                    table,
                    position,
                } => handler.on_ddl(&schema, &table, position).await?,
                Feed::Advance(position) => handler.on_position(position).await?,
            }
            self.world.delivered.fetch_add(1, Ordering::SeqCst);
        }

        if self.hold_open {
            while !self.closed.load(Ordering::SeqCst) {
                let _ = tokio::time::timeout(Duration::from_millis(20), self.notify.notified())
                    .await;
            }
        }
        Ok(())
    }

    fn delay(&self) -> u64 {
        0
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Vends pre-built sources in order; once exhausted, idle sources that wait
/// for close.
struct FakeFactory {
    world: SourceWorld,
    queue: Mutex<VecDeque<FakeSource>>,
}

impl FakeFactory {
    fn new(world: SourceWorld, sources: Vec<FakeSource>) -> Self {
        Self {
            world,
            queue: Mutex::new(sources.into()),
        }
    }
}

#[async_trait::async_trait]
impl SourceFactory for FakeFactory {
    type Source = FakeSource;

    async fn create(&self, _config: &SourceConfig) -> Result<FakeSource, SourceError> {
        Ok(self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.world.scripted(Vec::new(), true)))
    }
}

// ============================================================================
// Stores and destinations
// ============================================================================

/// In-memory position store with a synchronously inspectable slot.
#[derive(Clone, Default)]
struct MemoryPositionStore {
    current: Arc<Mutex<Option<Position>>>,
}

impl MemoryPositionStore {
    fn saved(&self) -> Option<Position> {
        self.current.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PositionStore for MemoryPositionStore {
    async fn initialize(&self) -> Result<(), PositionStoreError> {
        Ok(())
    }

    async fn get(&self) -> Result<Position, PositionStoreError> {
        Ok(self
            .current
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(Position::genesis))
    }

    async fn save(&self, position: &Position) -> Result<(), PositionStoreError> {
        *self.current.lock().unwrap() = Some(position.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), PositionStoreError> {
        Ok(())
    }
}

/// Captures published requests.
#[derive(Clone, Default)]
struct RecordingDestination {
    requests: Arc<Mutex<Vec<Request>>>,
}

impl RecordingDestination {
    fn captured(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    fn len(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Destination for RecordingDestination {
    async fn start(&mut self) -> Result<(), DestinationError> {
        Ok(())
    }

    async fn publish(&mut self, requests: Vec<Request>) -> Result<(), DestinationError> {
        self.requests.lock().unwrap().extend(requests);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), DestinationError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DestinationError> {
        Ok(())
    }
}

/// Fails every publish with a non-retryable error.
#[derive(Clone, Default)]
struct FailingDestination;

#[async_trait::async_trait]
impl Destination for FailingDestination {
    async fn start(&mut self) -> Result<(), DestinationError> {
        Ok(())
    }

    async fn publish(&mut self, _requests: Vec<Request>) -> Result<(), DestinationError> {
        Err(DestinationError::publish_msg("sink unavailable", false))
    }

    async fn ping(&mut self) -> Result<(), DestinationError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DestinationError> {
        Ok(())
    }
}

/// Holds every publish until released, then records it.
#[derive(Clone, Default)]
struct GatedDestination {
    released: Arc<AtomicBool>,
    published: Arc<AtomicUsize>,
}

impl GatedDestination {
    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Destination for GatedDestination {
    async fn start(&mut self) -> Result<(), DestinationError> {
        Ok(())
    }

    async fn publish(&mut self, requests: Vec<Request>) -> Result<(), DestinationError> {
        while !self.released.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(5)).await;
        }
        self.published.fetch_add(requests.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), DestinationError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DestinationError> {
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn source_config() -> SourceConfig {
    SourceConfig {
        addr: "127.0.0.1:3306".into(),
        user: "repl".into(),
        password: "secret".into(),
        charset: "utf8mb4".into(),
        flavor: Flavor::Mysql,
        server_id: 1001,
        skip_master_data: false,
        include_table_regex: vec![],
    }
}

fn config_for(rules: Vec<RuleConfig>) -> TransferConfig {
    TransferConfig::builder()
        .source(source_config())
        .rules(rules)
        .queue_capacity(64)
        .build()
        .unwrap()
}

fn image(value: Value) -> RowImage {
    value.as_object().cloned().expect("object literal")
}

fn row(kind: EventKind, table: &str, before: Option<Value>, after: Option<Value>, position: Position) -> Feed {
    Feed::Row(RowEvent {
        kind,
        schema: "app".into(),
        table: table.into(),
        before: before.map(image),
        after: after.map(image),
        position,
        timestamp: Utc::now(),
    })
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn insert_propagates_and_position_checkpoints() {
    let world = SourceWorld::default();
    world.add_table("app", "t", &["id"], &["id", "name"]);

    let position = Position::new("mysql-bin.000003", 1024);
    let feed = vec![
        row(
            EventKind::Insert,
            "t",
            None,
            Some(json!({ "id": 7, "name": "x" })),
            position.clone(),
        ),
        // Events for tables without a rule are dropped.
        row(
            EventKind::Insert,
            "orders",
            None,
            Some(json!({ "id": 1 })),
            position.clone(),
        ),
        Feed::Advance(position.clone()),
    ];
    let source = world.scripted(feed, false);
    let factory = FakeFactory::new(world.clone(), vec![source]);

    let store = MemoryPositionStore::default();
    let destination = RecordingDestination::default();
    let transfer = Arc::new(Transfer::new(
        config_for(vec![RuleConfig::new("app", "t")]),
        factory,
        store.clone(),
        destination.clone(),
    ));

    transfer.initialize().await.unwrap();
    let runner = {
        let transfer = Arc::clone(&transfer);
        tokio::spawn(async move { transfer.run().await })
    };
    runner.await.unwrap().unwrap();

    wait_for("request published and position saved", || {
        destination.len() == 1 && store.saved().is_some()
    })
    .await;

    let captured = destination.captured();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].target, "app.t");
    assert_eq!(captured[0].key, "7");
    assert_eq!(captured[0].op, RequestOp::Upsert);
    assert_eq!(captured[0].payload, Some(json!({ "id": 7, "name": "x" })));
    assert_eq!(store.saved(), Some(position));

    transfer.close().await;
    let stats = transfer.stats();
    assert_eq!(stats.events_received, 2);
    assert_eq!(stats.requests_published, 1);
    assert_eq!(stats.positions_saved, 1);
}

#[tokio::test]
async fn requests_and_checkpoints_preserve_binlog_order() {
    let world = SourceWorld::default();
    world.add_table("app", "t", &["id"], &["id", "n"]);

    let p1 = Position::new("mysql-bin.000001", 100);
    let p2 = Position::new("mysql-bin.000001", 200);
    let p3 = Position::new("mysql-bin.000002", 50);
    let feed = vec![
        row(EventKind::Insert, "t", None, Some(json!({ "id": 1, "n": 1 })), p1.clone()),
        Feed::Advance(p1),
        row(EventKind::Insert, "t", None, Some(json!({ "id": 2, "n": 2 })), p2.clone()),
        Feed::Advance(p2),
        row(EventKind::Insert, "t", None, Some(json!({ "id": 3, "n": 3 })), p3.clone()),
        Feed::Advance(p3.clone()),
    ];
    let source = world.scripted(feed, false);
    let factory = FakeFactory::new(world.clone(), vec![source]);

    let store = MemoryPositionStore::default();
    let destination = RecordingDestination::default();
    let transfer = Arc::new(Transfer::new(
        config_for(vec![RuleConfig::new("app", "t")]),
        factory,
        store.clone(),
        destination.clone(),
    ));

    transfer.initialize().await.unwrap();
    {
        let transfer = Arc::clone(&transfer);
        tokio::spawn(async move { transfer.run().await })
    }
    .await
    .unwrap()
    .unwrap();

    wait_for("all requests published", || destination.len() == 3).await;

    let keys: Vec<String> = destination.captured().iter().map(|r| r.key.clone()).collect();
    assert_eq!(keys, vec!["1", "2", "3"]);
    assert_eq!(store.saved(), Some(p3));

    transfer.close().await;
}

#[tokio::test]
async fn update_with_key_change_deletes_old_key_first() {
    let world = SourceWorld::default();
    world.add_table("app", "t", &["id"], &["id", "name"]);

    let position = Position::new("mysql-bin.000001", 300);
    let feed = vec![
        row(
            EventKind::Update,
            "t",
            Some(json!({ "id": 7, "name": "x" })),
            Some(json!({ "id": 8, "name": "x" })),
            position.clone(),
        ),
        Feed::Advance(position),
    ];
    let source = world.scripted(feed, false);
    let factory = FakeFactory::new(world.clone(), vec![source]);

    let destination = RecordingDestination::default();
    let transfer = Arc::new(Transfer::new(
        config_for(vec![RuleConfig::new("app", "t")]),
        factory,
        MemoryPositionStore::default(),
        destination.clone(),
    ));

    transfer.initialize().await.unwrap();
    {
        let transfer = Arc::clone(&transfer);
        tokio::spawn(async move { transfer.run().await })
    }
    .await
    .unwrap()
    .unwrap();

    wait_for("both requests published", || destination.len() == 2).await;

    let captured = destination.captured();
    assert_eq!(captured[0].op, RequestOp::Delete);
    assert_eq!(captured[0].key, "7");
    assert_eq!(captured[1].op, RequestOp::Upsert);
    assert_eq!(captured[1].key, "8");

    transfer.close().await;
}

#[tokio::test]
async fn publish_failure_aborts_without_advancing_position() {
    let world = SourceWorld::default();
    world.add_table("app", "t", &["id"], &["id"]);

    let position = Position::new("mysql-bin.000001", 500);
    let feed = vec![
        row(EventKind::Insert, "t", None, Some(json!({ "id": 1 })), position.clone()),
        Feed::Advance(position),
    ];
    let source = world.scripted(feed, true);
    let factory = FakeFactory::new(world.clone(), vec![source]);

    let store = MemoryPositionStore::default();
    let transfer = Arc::new(Transfer::new(
        config_for(vec![RuleConfig::new("app", "t")]),
        factory,
        store.clone(),
        FailingDestination,
    ));

    transfer.initialize().await.unwrap();
    let result = {
        let transfer = Arc::clone(&transfer);
        tokio::spawn(async move { transfer.run().await })
    }
    .await
    .unwrap();

    let err = result.unwrap_err();
    assert!(err.to_string().contains("publish failed"));

    // The position never advanced past the unpublished request.
    assert_eq!(store.saved(), None);
    assert_eq!(transfer.state(), TransferState::Closed);
    assert_eq!(transfer.stats().publish_errors, 1);
}

#[tokio::test]
async fn pause_then_restart_resumes_from_saved_position() {
    let world = SourceWorld::default();
    world.add_table("app", "t", &["id"], &["id"]);

    let p1 = Position::new("mysql-bin.000005", 42);
    let feed = vec![
        row(EventKind::Insert, "t", None, Some(json!({ "id": 1 })), p1.clone()),
        Feed::Advance(p1.clone()),
    ];
    let first = world.scripted(feed, true);
    let second = world.scripted(Vec::new(), true);
    let factory = FakeFactory::new(world.clone(), vec![first, second]);

    let store = MemoryPositionStore::default();
    let destination = RecordingDestination::default();
    let transfer = Arc::new(Transfer::new(
        config_for(vec![RuleConfig::new("app", "t")]),
        factory,
        store.clone(),
        destination.clone(),
    ));

    transfer.initialize().await.unwrap();
    let runner = {
        let transfer = Arc::clone(&transfer);
        tokio::spawn(async move { transfer.run().await })
    };

    {
        let store = store.clone();
        wait_for("first checkpoint", move || store.saved() == Some(p1.clone())).await;
    }
    assert!(transfer.is_running());

    transfer.pause().await;
    assert!(!transfer.is_running());
    assert_eq!(transfer.state(), TransferState::Paused);
    runner.await.unwrap().unwrap();

    // Restart reruns the stream from the persisted position, not genesis.
    let rerunner = {
        let transfer = Arc::clone(&transfer);
        tokio::spawn(async move { transfer.restart().await })
    };

    {
        let world = world.clone();
        wait_for("second run begins", move || world.saved_runs().len() == 2).await;
    }
    let runs = world.saved_runs();
    assert!(runs[0].is_genesis());
    assert_eq!(runs[1], Position::new("mysql-bin.000005", 42));
    assert!(transfer.is_running());

    transfer.close().await;
    rerunner.await.unwrap().unwrap();
}

#[tokio::test]
async fn ddl_marker_refreshes_rule_metadata() {
    let world = SourceWorld::default();
    world.add_table("app", "t", &["id"], &["id", "name", "c3"]);

    let position = Position::new("mysql-bin.000001", 700);
    // The stream stays open while the marker drains; metadata refreshes go
    // through the live client.
    let source = world.scripted(
        vec![Feed::Ddl {
            schema: "app".into(),
            table: "t".into(),
            position,
        }],
        true,
    );
    let factory = FakeFactory::new(world.clone(), vec![source]);

    let transfer = Arc::new(Transfer::new(
        config_for(vec![RuleConfig::new("app", "t")]),
        factory,
        MemoryPositionStore::default(),
        RecordingDestination::default(),
    ));

    transfer.initialize().await.unwrap();
    let rule = transfer.registry().get("app", "t").await.unwrap();
    assert_eq!(rule.column_count, 3);

    // ALTER TABLE t ADD c4 lands on the source before the marker drains.
    world.add_table("app", "t", &["id"], &["id", "name", "c3", "c4"]);

    let runner = {
        let transfer = Arc::clone(&transfer);
        tokio::spawn(async move { transfer.run().await })
    };

    let mut refreshed = false;
    for _ in 0..500 {
        if let Some(rule) = transfer.registry().get("app", "t").await {
            if rule.column_count == 4 {
                refreshed = true;
                break;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(refreshed, "rule metadata was not refreshed");
    assert_eq!(transfer.stats().rule_refreshes, 1);

    transfer.close().await;
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn full_queue_backpressures_the_source() {
    let world = SourceWorld::default();
    world.add_table("app", "t", &["id"], &["id"]);

    let total = 40usize;
    let feed: Vec<Feed> = (0..total)
        .map(|i| {
            row(
                EventKind::Insert,
                "t",
                None,
                Some(json!({ "id": i })),
                Position::new("mysql-bin.000001", 100 + i as u64),
            )
        })
        .collect();
    let source = world.scripted(feed, false);
    let factory = FakeFactory::new(world.clone(), vec![source]);

    let destination = GatedDestination::default();
    let config = TransferConfig::builder()
        .source(source_config())
        .rule(RuleConfig::new("app", "t"))
        .queue_capacity(16)
        .build()
        .unwrap();
    let transfer = Arc::new(Transfer::new(
        config,
        factory,
        MemoryPositionStore::default(),
        destination.clone(),
    ));

    transfer.initialize().await.unwrap();
    let runner = {
        let transfer = Arc::clone(&transfer);
        tokio::spawn(async move { transfer.run().await })
    };

    // The gated destination never completes its first publish, so the client
    // must stall once the queue fills: capacity plus the in-flight item.
    sleep(Duration::from_millis(300)).await;
    let stalled = world.delivered.load(Ordering::SeqCst);
    assert!(
        stalled < total,
        "source delivered all {total} events despite a full queue"
    );
    assert!(stalled >= 16, "source stalled before the queue filled");

    destination.release();
    {
        let world = world.clone();
        wait_for("all events delivered after release", move || {
            world.delivered.load(Ordering::SeqCst) == total
        })
        .await;
    }
    runner.await.unwrap().unwrap();
    wait_for("all requests drained to the sink", || {
        destination.published.load(Ordering::SeqCst) == total
    })
    .await;

    transfer.close().await;
}

#[tokio::test]
async fn dumper_seeds_tables_for_a_single_schema() {
    let world = SourceWorld::default();
    world.add_table("app", "t", &["id"], &["id"]);
    world.add_table("app", "u", &["id"], &["id"]);

    let source = world.scripted(Vec::new(), false);
    let factory = FakeFactory::new(world.clone(), vec![source]);
    let transfer = Arc::new(Transfer::new(
        config_for(vec![RuleConfig::new("app", "t"), RuleConfig::new("app", "u")]),
        factory,
        MemoryPositionStore::default(),
        RecordingDestination::default(),
    ));

    transfer.initialize().await.unwrap();

    let seeds = world.seeds.lock().unwrap().clone();
    assert_eq!(
        seeds,
        vec![Seed::Tables("app".into(), vec!["t".into(), "u".into()])]
    );
    transfer.close().await;
}

#[tokio::test]
async fn dumper_seeds_databases_for_multiple_schemas() {
    let world = SourceWorld::default();
    world.add_table("app", "t", &["id"], &["id"]);
    world.add_table("crm", "c", &["id"], &["id"]);

    let source = world.scripted(Vec::new(), false);
    let factory = FakeFactory::new(world.clone(), vec![source]);
    let transfer = Arc::new(Transfer::new(
        config_for(vec![RuleConfig::new("app", "t"), RuleConfig::new("crm", "c")]),
        factory,
        MemoryPositionStore::default(),
        RecordingDestination::default(),
    ));

    transfer.initialize().await.unwrap();

    let seeds = world.seeds.lock().unwrap().clone();
    assert_eq!(seeds, vec![Seed::Databases(vec!["app".into(), "crm".into()])]);
    transfer.close().await;
}

#[tokio::test]
async fn lua_transform_drops_and_rekeys_rows() {
    let world = SourceWorld::default();
    world.add_table("app", "t", &["id"], &["id", "name"]);

    let position = Position::new("mysql-bin.000001", 900);
    let feed = vec![
        row(
            EventKind::Insert,
            "t",
            None,
            Some(json!({ "id": 1, "name": "skip" })),
            position.clone(),
        ),
        row(
            EventKind::Insert,
            "t",
            None,
            Some(json!({ "id": 2, "name": "keep" })),
            position.clone(),
        ),
        Feed::Advance(position),
    ];
    let source = world.scripted(feed, false);
    let factory = FakeFactory::new(world.clone(), vec![source]);

    let mut rule = RuleConfig::new("app", "t");
    rule.script = Some(
        r#"
        local ctx = ...
        if ctx.row.name == "skip" then return nil end
        return {
            key = "user:" .. ctx.row.id,
            value = { id = ctx.row.id, name = ctx.row.name },
        }
        "#
        .to_string(),
    );

    let destination = RecordingDestination::default();
    let transfer = Arc::new(Transfer::new(
        config_for(vec![rule]),
        factory,
        MemoryPositionStore::default(),
        destination.clone(),
    ));

    transfer.initialize().await.unwrap();
    {
        let transfer = Arc::clone(&transfer);
        tokio::spawn(async move { transfer.run().await })
    }
    .await
    .unwrap()
    .unwrap();

    wait_for("transformed request published", || destination.len() == 1).await;

    let captured = destination.captured();
    assert_eq!(captured[0].key, "user:2");
    assert_eq!(captured[0].payload, Some(json!({ "id": 2, "name": "keep" })));

    transfer.close().await;
}

#[tokio::test]
async fn run_requires_initialization_and_close_is_idempotent() {
    let world = SourceWorld::default();
    world.add_table("app", "t", &["id"], &["id"]);

    let factory = FakeFactory::new(world.clone(), vec![]);
    let transfer: Transfer<FakeFactory, MemoryPositionStore, RecordingDestination> =
        Transfer::new(
            config_for(vec![RuleConfig::new("app", "t")]),
            factory,
            MemoryPositionStore::default(),
            RecordingDestination::default(),
        );

    let err = transfer.run().await.unwrap_err();
    assert!(err.to_string().contains("invalid lifecycle transition"));

    transfer.initialize().await.unwrap();
    transfer.close().await;
    transfer.close().await; // second close is a no-op
    assert_eq!(transfer.state(), TransferState::Closed);
}
