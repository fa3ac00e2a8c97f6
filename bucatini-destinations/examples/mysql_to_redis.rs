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

//! End-to-end pipeline: MySQL binlog → Redis.
//!
//! Requires a MySQL primary with binary logging enabled and a reachable
//! Redis. Environment:
//!
//! - `MYSQL_ADDR` (default `127.0.0.1:3306`)
//! - `MYSQL_USER` (default `root`), `MYSQL_PASSWORD`
//! - `REDIS_URL`  (default `redis://localhost:6379`)
//!
//! ```sh
//! cargo run --example mysql_to_redis
//! ```
//!
//! Ctrl-C shuts the transfer down; the persisted position lets the next run
//! resume where this one stopped.

use bucatini_core::mysql::MySqlSourceFactory;
use bucatini_core::pipeline::{Transfer, TransferConfig};
use bucatini_core::rule::RuleConfig;
use bucatini_core::source::{Flavor, SourceConfig};
use bucatini_destinations::redis::{RedisConfig, RedisDestination};
use bucatini_stores::file::FileStore;
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let source = SourceConfig {
        addr: env::var("MYSQL_ADDR").unwrap_or_else(|_| "127.0.0.1:3306".into()),
        user: env::var("MYSQL_USER").unwrap_or_else(|_| "root".into()),
        password: env::var("MYSQL_PASSWORD").unwrap_or_default(),
        charset: "utf8mb4".into(),
        flavor: Flavor::Mysql,
        server_id: 1001,
        skip_master_data: false,
        include_table_regex: vec![],
    };

    let config = TransferConfig::builder()
        .source(source)
        .rule(RuleConfig::new("app", "users"))
        .data_dir(".")
        .build()?;

    let store = FileStore::new("./bucatini-position.json");
    let redis = RedisDestination::new(
        RedisConfig::builder()
            .url(env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into()))
            .namespace("bucatini")
            .build()?,
    );

    let transfer = Arc::new(Transfer::new(config, MySqlSourceFactory, store, redis));
    transfer.initialize().await?;

    let closer = Arc::clone(&transfer);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        closer.close().await;
    });

    transfer.run().await?;
    Ok(())
}
