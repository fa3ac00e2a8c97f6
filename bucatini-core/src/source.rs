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

//! The replication source seam.
//!
//! [`BinlogSource`] is the contract between the engine and the replication
//! client. The concrete MySQL adapter lives in [`crate::mysql`]; tests plug in
//! scripted implementations. The client invokes an [`EventHandler`] for every
//! decoded event on its own task — the handler must not do more than queue
//! admission there, because it sits on the binlog decoder's critical path.
//!
//! A source is a disposable value: the controller builds one at initialize,
//! drops it on pause, and asks a [`SourceFactory`] for a fresh one on resume.
//! The rule registry and position store survive across rebuilds.

use crate::event::RowEvent;
use crate::position::Position;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// MySQL flavor of the source server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    /// Oracle MySQL.
    #[default]
    Mysql,

    /// MariaDB.
    Mariadb,
}

impl Flavor {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
        }
    }
}

/// Connection settings for the replication source.
///
/// `server_id` must be unique among all replicas of the source, bucatini
/// included: MySQL disconnects duplicate server ids mid-stream.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source address, `host:port`. Port defaults to 3306 when omitted.
    pub addr: String,

    /// Username for both the SQL channel and replication.
    pub user: String,

    /// Password.
    pub password: String,

    /// Connection charset, e.g. `utf8mb4`.
    #[serde(default = "default_charset")]
    pub charset: String,

    /// Server flavor.
    #[serde(default)]
    pub flavor: Flavor,

    /// Replication server id, unique per source.
    pub server_id: u32,

    /// Skip reading binlog coordinates before the initial snapshot; for
    /// users without the `REPLICATION CLIENT` privilege. The coordinates are
    /// then read after the snapshot instead.
    #[serde(default)]
    pub skip_master_data: bool,

    /// Source-side table filter, `schema\.table-pattern` entries built from
    /// the raw rule templates before wildcard expansion.
    #[serde(default)]
    pub include_table_regex: Vec<String>,
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

impl SourceConfig {
    /// Splits `addr` into host and port, defaulting the port to 3306.
    #[must_use]
    pub fn host_and_port(&self) -> (String, u16) {
        match self.addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().unwrap_or(3306);
                (host.to_string(), port)
            }
            None => (self.addr.clone(), 3306),
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("charset", &self.charset)
            .field("flavor", &self.flavor)
            .field("server_id", &self.server_id)
            .field("skip_master_data", &self.skip_master_data)
            .field("include_table_regex", &self.include_table_regex)
            .finish()
    }
}

/// One column of a source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// MySQL data type, e.g. `bigint`, `varchar`.
    pub column_type: String,

    /// True if the column is part of the primary key.
    pub is_pk: bool,
}

/// Metadata for one source table, fetched from `information_schema`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Schema name.
    pub schema: String,

    /// Table name.
    pub table: String,

    /// Columns in ordinal order.
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    /// Ordinal indices of the primary-key columns, in declaration order.
    #[must_use]
    pub fn pk_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_pk)
            .map(|(i, _)| i)
            .collect()
    }

    /// Names of the primary-key columns, in declaration order.
    #[must_use]
    pub fn pk_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_pk)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Number of columns.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// Errors produced inside an [`EventHandler`].
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The request queue's receiving side is gone; the engine is shutting
    /// down.
    #[error("request queue closed")]
    QueueClosed,

    /// A transform script failed at runtime.
    #[error("transform script failed: {0}")]
    Script(String),

    /// Other handler failures.
    #[error("{0}")]
    Other(String),
}

/// Callback seam invoked by the replication client for every decoded event.
///
/// All three methods run on the client's task; blocking here blocks the
/// binlog decoder, which is exactly the designed backpressure path when the
/// request queue is full.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// A row mutation on some table.
    ///
    /// # Errors
    ///
    /// An error aborts the replication stream.
    async fn on_row(&self, event: RowEvent) -> Result<(), HandlerError>;

    /// A DDL statement touched `schema.table`.
    ///
    /// # Errors
    ///
    /// An error aborts the replication stream.
    async fn on_ddl(
        &self,
        schema: &str,
        table: &str,
        position: Position,
    ) -> Result<(), HandlerError>;

    /// A position-only event (rotate, transaction commit).
    ///
    /// # Errors
    ///
    /// An error aborts the replication stream.
    async fn on_position(&self, position: Position) -> Result<(), HandlerError>;
}

/// The replication client contract.
///
/// Implementations use interior mutability: `run_from` blocks for the life
/// of the stream while `close` must remain callable from another task to
/// interrupt it. `close` is idempotent.
#[async_trait]
pub trait BinlogSource: Send + Sync {
    /// Lists tables in `schema` whose names match `pattern` as a POSIX-style
    /// regex. Used only during rule compilation (wildcard expansion).
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata query fails.
    async fn list_tables(&self, schema: &str, pattern: &str) -> Result<Vec<String>, SourceError>;

    /// Fetches column metadata for one table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is unknown or the query fails.
    async fn table_info(&self, schema: &str, table: &str) -> Result<TableInfo, SourceError>;

    /// Seeds the initial snapshot with explicit tables of a single schema.
    fn add_dump_tables(&self, schema: &str, tables: &[String]);

    /// Seeds the initial snapshot with whole schemas.
    fn add_dump_databases(&self, schemas: &[String]);

    /// Runs replication from `from`, invoking `handler` for every event.
    /// Blocks until the stream ends, errors, or [`BinlogSource::close`] is
    /// called. Starting from the genesis position triggers the initial
    /// snapshot of the dump seeds first.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream fails or the handler rejects an event.
    async fn run_from(
        &self,
        from: Position,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SourceError>;

    /// Current replication delay in seconds, for the metrics loop.
    fn delay(&self) -> u64;

    /// Stops the stream and releases connections. Idempotent.
    async fn close(&self);
}

/// Builds replication clients.
///
/// The controller recreates the client on every pause/resume cycle, so
/// construction lives behind a factory instead of on the client itself.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    /// The client type this factory produces.
    type Source: BinlogSource + 'static;

    /// Connects a fresh client.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is unreachable or the configuration is
    /// rejected.
    async fn create(&self, config: &SourceConfig) -> Result<Self::Source, SourceError>;
}

/// Errors from the replication source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Connecting to the source failed.
    #[error("source connection failed: {0}")]
    Connection(String),

    /// The replication stream broke.
    #[error("replication stream error: {0}")]
    Stream(String),

    /// A metadata fetch failed.
    #[error("metadata fetch failed for {schema}.{table}: {reason}")]
    Metadata {
        /// Schema name.
        schema: String,
        /// Table name.
        table: String,
        /// Underlying cause.
        reason: String,
    },

    /// A SQL-channel query failed.
    #[error("query failed: {0}")]
    Query(String),

    /// The event handler rejected an event.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_password() {
        let config = SourceConfig {
            addr: "127.0.0.1:3306".into(),
            user: "repl".into(),
            password: "s3cret".into(),
            charset: default_charset(),
            flavor: Flavor::Mysql,
            server_id: 1001,
            skip_master_data: false,
            include_table_regex: vec![],
        };

        let rendered = format!("{config:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn host_and_port_defaults_port() {
        let mut config = SourceConfig {
            addr: "db.internal".into(),
            user: "repl".into(),
            password: String::new(),
            charset: default_charset(),
            flavor: Flavor::default(),
            server_id: 1,
            skip_master_data: false,
            include_table_regex: vec![],
        };
        assert_eq!(config.host_and_port(), ("db.internal".to_string(), 3306));

        config.addr = "db.internal:3307".into();
        assert_eq!(config.host_and_port(), ("db.internal".to_string(), 3307));
    }

    #[test]
    fn pk_metadata_helpers() {
        let info = TableInfo {
            schema: "app".into(),
            table: "t".into(),
            columns: vec![
                ColumnInfo {
                    name: "tenant".into(),
                    column_type: "bigint".into(),
                    is_pk: true,
                },
                ColumnInfo {
                    name: "name".into(),
                    column_type: "varchar".into(),
                    is_pk: false,
                },
                ColumnInfo {
                    name: "id".into(),
                    column_type: "bigint".into(),
                    is_pk: true,
                },
            ],
        };

        assert_eq!(info.pk_indices(), vec![0, 2]);
        assert_eq!(info.pk_names(), vec!["tenant", "id"]);
        assert_eq!(info.column_count(), 3);
    }
}
