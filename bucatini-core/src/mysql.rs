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

//! MySQL source adapter.
//!
//! [`MySqlSource`] implements [`BinlogSource`] over `mysql_async`: a pooled
//! SQL channel for `information_schema` lookups, `SHOW MASTER STATUS`, and
//! the initial snapshot, plus a dedicated replication connection for the
//! binlog stream.
//!
//! Binlog row events carry ordinals and values but no column names, so the
//! adapter keeps a per-table column-name cache fed from `information_schema`
//! and invalidated on DDL.
//!
//! The initial snapshot is read natively over the SQL channel (`SELECT *`
//! per seeded table) rather than shelling out to `mysqldump`; rows surface
//! as insert events at the genesis position, then streaming starts from the
//! coordinates reported by `SHOW MASTER STATUS`.

use crate::event::{EventKind, RowEvent, RowImage};
use crate::position::Position;
use crate::source::{
    BinlogSource, ColumnInfo, EventHandler, SourceConfig, SourceError, SourceFactory, TableInfo,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use mysql_async::binlog::events::{EventData, RowsEventData, TableMapEvent};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts, OptsBuilder, Pool, Row};
use parking_lot::Mutex;
use regex::{Regex, RegexSet};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

/// What the initial snapshot reads before streaming begins.
#[derive(Debug, Clone, Default)]
enum DumpSeed {
    /// Nothing seeded; streaming starts immediately.
    #[default]
    None,
    /// Explicit tables of a single schema.
    Tables { schema: String, tables: Vec<String> },
    /// Whole schemas.
    Databases(Vec<String>),
}

/// A replication client backed by `mysql_async`.
///
/// Disposable: the controller builds one per streaming session via
/// [`MySqlSourceFactory`] and drops it on pause. [`MySqlSource::close`] is
/// idempotent and interrupts a blocked [`MySqlSource::run_from`].
pub struct MySqlSource {
    opts: Opts,
    pool: Pool,
    server_id: u32,
    skip_master_data: bool,
    filter: Option<RegexSet>,
    dump_seed: Mutex<DumpSeed>,
    column_cache: AsyncMutex<HashMap<(String, String), Vec<String>>>,
    last_event_ts: AtomicU64,
    closing: AtomicBool,
    close_notify: Notify,
}

impl MySqlSource {
    /// Connects the SQL channel and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is unreachable or the table filter
    /// patterns do not compile.
    pub async fn connect(config: &SourceConfig) -> Result<Self, SourceError> {
        let (host, port) = config.host_and_port();
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .init(vec![format!("SET NAMES {}", config.charset)])
            .into();

        let pool = Pool::new(opts.clone());
        // Probe the channel now so initialization fails fast.
        let conn = pool
            .get_conn()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        drop(conn);

        let filter = if config.include_table_regex.is_empty() {
            None
        } else {
            Some(
                RegexSet::new(&config.include_table_regex)
                    .map_err(|e| SourceError::Query(format!("invalid include_table_regex: {e}")))?,
            )
        };

        info!(
            addr = %config.addr,
            server_id = config.server_id,
            flavor = config.flavor.as_str(),
            "mysql source connected"
        );

        Ok(Self {
            opts,
            pool,
            server_id: config.server_id,
            skip_master_data: config.skip_master_data,
            filter,
            dump_seed: Mutex::new(DumpSeed::None),
            column_cache: AsyncMutex::new(HashMap::new()),
            last_event_ts: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    fn table_allowed(&self, schema: &str, table: &str) -> bool {
        match &self.filter {
            Some(set) => set.is_match(&format!("{schema}.{table}")),
            None => true,
        }
    }

    async fn master_position(&self) -> Result<Position, SourceError> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        let row: Option<Row> = conn
            .query_first("SHOW MASTER STATUS")
            .await
            .map_err(|e| SourceError::Query(e.to_string()))?;

        let row = row.ok_or_else(|| {
            SourceError::Query(
                "SHOW MASTER STATUS returned no rows; is binary logging enabled?".into(),
            )
        })?;
        let file: String = row
            .get(0)
            .ok_or_else(|| SourceError::Query("malformed SHOW MASTER STATUS row".into()))?;
        let offset: u64 = row
            .get(1)
            .ok_or_else(|| SourceError::Query("malformed SHOW MASTER STATUS row".into()))?;

        Ok(Position::new(file, offset))
    }

    async fn columns_for(&self, schema: &str, table: &str) -> Result<Vec<String>, SourceError> {
        let key = (schema.to_string(), table.to_string());
        if let Some(columns) = self.column_cache.lock().await.get(&key) {
            return Ok(columns.clone());
        }

        let info = self.table_info(schema, table).await?;
        let columns: Vec<String> = info.columns.into_iter().map(|c| c.name).collect();
        self.column_cache.lock().await.insert(key, columns.clone());
        Ok(columns)
    }

    async fn snapshot(&self, handler: &Arc<dyn EventHandler>) -> Result<(), SourceError> {
        let seed = self.dump_seed.lock().clone();
        let targets: Vec<(String, String)> = match seed {
            DumpSeed::None => return Ok(()),
            DumpSeed::Tables { schema, tables } => tables
                .into_iter()
                .map(|table| (schema.clone(), table))
                .collect(),
            DumpSeed::Databases(schemas) => {
                let mut conn = self
                    .pool
                    .get_conn()
                    .await
                    .map_err(|e| SourceError::Connection(e.to_string()))?;
                let mut pairs = Vec::new();
                for schema in schemas {
                    let tables: Vec<String> = conn
                        .exec(
                            "SELECT table_name FROM information_schema.tables \
                             WHERE table_schema = ?",
                            (schema.as_str(),),
                        )
                        .await
                        .map_err(|e| SourceError::Query(e.to_string()))?;
                    pairs.extend(tables.into_iter().map(|table| (schema.clone(), table)));
                }
                pairs
            }
        };

        info!(tables = targets.len(), "initial snapshot starting");
        for (schema, table) in targets {
            if self.closing.load(Ordering::SeqCst) {
                return Ok(());
            }
            if !self.table_allowed(&schema, &table) {
                continue;
            }
            self.snapshot_table(&schema, &table, handler).await?;
        }
        info!("initial snapshot finished");
        Ok(())
    }

    async fn snapshot_table(
        &self,
        schema: &str,
        table: &str,
        handler: &Arc<dyn EventHandler>,
    ) -> Result<(), SourceError> {
        let columns = self.columns_for(schema, table).await?;
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        let query = format!(
            "SELECT * FROM `{}`.`{}`",
            schema.replace('`', "``"),
            table.replace('`', "``")
        );
        let mut result = conn
            .query_iter(query)
            .await
            .map_err(|e| SourceError::Query(e.to_string()))?;

        let mut count = 0u64;
        while let Some(row) = result
            .next()
            .await
            .map_err(|e| SourceError::Query(e.to_string()))?
        {
            handler
                .on_row(RowEvent {
                    kind: EventKind::Insert,
                    schema: schema.to_string(),
                    table: table.to_string(),
                    before: None,
                    after: Some(sql_row_to_image(&columns, row)),
                    position: Position::genesis(),
                    timestamp: Utc::now(),
                })
                .await?;
            count += 1;
        }

        debug!(table = %format!("{schema}.{table}"), rows = count, "table snapshot complete");
        Ok(())
    }

    async fn stream(
        &self,
        start: Position,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SourceError> {
        let conn = Conn::new(self.opts.clone())
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        let request = BinlogStreamRequest::new(self.server_id)
            .with_filename(start.file.as_bytes())
            .with_pos(start.offset);
        let mut stream = conn
            .get_binlog_stream(request)
            .await
            .map_err(|e| SourceError::Stream(e.to_string()))?;

        info!(position = %start, "binlog stream started");
        let mut file = start.file;

        loop {
            if self.closing.load(Ordering::SeqCst) {
                info!("binlog stream closed");
                return Ok(());
            }

            tokio::select! {
                _ = self.close_notify.notified() => {
                    info!("binlog stream closed");
                    return Ok(());
                }
                next = stream.next() => match next {
                    None => {
                        info!("binlog stream ended by server");
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(SourceError::Stream(e.to_string())),
                    Some(Ok(event)) => {
                        self.process_event(&stream, &event, &mut file, &handler).await?;
                    }
                },
            }
        }
    }

    async fn process_event(
        &self,
        stream: &BinlogStream,
        event: &mysql_async::binlog::events::Event,
        file: &mut String,
        handler: &Arc<dyn EventHandler>,
    ) -> Result<(), SourceError> {
        let header = event.header();
        if header.timestamp() != 0 {
            self.last_event_ts
                .store(u64::from(header.timestamp()), Ordering::Relaxed);
        }
        let log_pos = u64::from(header.log_pos());

        let data = match event.read_data() {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "undecodable binlog event skipped");
                return Ok(());
            }
        };

        match data {
            EventData::RotateEvent(rotate) => {
                *file = rotate.name().to_string();
                handler
                    .on_position(Position::new(file.clone(), rotate.position()))
                    .await?;
            }
            EventData::XidEvent(_) => {
                handler
                    .on_position(Position::new(file.clone(), log_pos))
                    .await?;
            }
            EventData::QueryEvent(query) => {
                let sql = query.query();
                let default_schema = query.schema();
                if let Some((schema, table)) = parse_ddl(sql.as_ref(), default_schema.as_ref()) {
                    self.column_cache
                        .lock()
                        .await
                        .remove(&(schema.clone(), table.clone()));
                    if self.table_allowed(&schema, &table) {
                        handler
                            .on_ddl(&schema, &table, Position::new(file.clone(), log_pos))
                            .await?;
                    }
                }
            }
            EventData::RowsEvent(rows) => {
                let Some(tme) = stream.get_tme(rows.table_id()) else {
                    return Ok(());
                };
                let schema = tme.database_name().to_string();
                let table = tme.table_name().to_string();
                if !self.table_allowed(&schema, &table) {
                    return Ok(());
                }

                let columns = self.columns_for(&schema, &table).await?;
                let timestamp = Utc
                    .timestamp_opt(i64::from(header.timestamp()), 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                let position = Position::new(file.clone(), log_pos);

                let events =
                    decode_rows(&rows, tme, &columns, &schema, &table, &position, timestamp)?;
                for event in events {
                    handler.on_row(event).await?;
                }
            }
            _ => {}
        }

        Ok(())
    }
}

#[async_trait]
impl BinlogSource for MySqlSource {
    async fn list_tables(&self, schema: &str, pattern: &str) -> Result<Vec<String>, SourceError> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        conn.exec(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_name RLIKE ? AND table_schema = ?",
            (pattern, schema),
        )
        .await
        .map_err(|e| SourceError::Query(e.to_string()))
    }

    async fn table_info(&self, schema: &str, table: &str) -> Result<TableInfo, SourceError> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        let rows: Vec<(String, String, String)> = conn
            .exec(
                "SELECT column_name, data_type, column_key \
                 FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? \
                 ORDER BY ordinal_position",
                (schema, table),
            )
            .await
            .map_err(|e| SourceError::Metadata {
                schema: schema.to_string(),
                table: table.to_string(),
                reason: e.to_string(),
            })?;

        if rows.is_empty() {
            return Err(SourceError::Metadata {
                schema: schema.to_string(),
                table: table.to_string(),
                reason: "table not found".into(),
            });
        }

        Ok(TableInfo {
            schema: schema.to_string(),
            table: table.to_string(),
            columns: rows
                .into_iter()
                .map(|(name, column_type, column_key)| ColumnInfo {
                    name,
                    column_type,
                    is_pk: column_key == "PRI",
                })
                .collect(),
        })
    }

    fn add_dump_tables(&self, schema: &str, tables: &[String]) {
        *self.dump_seed.lock() = DumpSeed::Tables {
            schema: schema.to_string(),
            tables: tables.to_vec(),
        };
    }

    fn add_dump_databases(&self, schemas: &[String]) {
        *self.dump_seed.lock() = DumpSeed::Databases(schemas.to_vec());
    }

    async fn run_from(
        &self,
        from: Position,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SourceError> {
        let mut start = from;
        if start.is_genesis() {
            // Coordinates before the snapshot replay the overlap (idempotent
            // keys absorb it); with skip_master_data the read moves after the
            // snapshot so it works without REPLICATION CLIENT during the copy.
            if self.skip_master_data {
                self.snapshot(&handler).await?;
                start = self.master_position().await?;
            } else {
                start = self.master_position().await?;
                self.snapshot(&handler).await?;
            }
            handler.on_position(start.clone()).await?;
        }

        if self.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.stream(start, handler).await
    }

    fn delay(&self) -> u64 {
        let last = self.last_event_ts.load(Ordering::Relaxed);
        if last == 0 {
            return 0;
        }
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        now.saturating_sub(last)
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_notify.notify_waiters();
        if let Err(e) = self.pool.clone().disconnect().await {
            debug!(error = %e, "pool disconnect failed");
        }
        info!("mysql source closed");
    }
}

/// Builds [`MySqlSource`] clients for the controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlSourceFactory;

#[async_trait]
impl SourceFactory for MySqlSourceFactory {
    type Source = MySqlSource;

    async fn create(&self, config: &SourceConfig) -> Result<Self::Source, SourceError> {
        MySqlSource::connect(config).await
    }
}

fn decode_rows(
    rows: &RowsEventData<'_>,
    tme: &TableMapEvent<'_>,
    columns: &[String],
    schema: &str,
    table: &str,
    position: &Position,
    timestamp: DateTime<Utc>,
) -> Result<Vec<RowEvent>, SourceError> {
    let mut events = Vec::new();
    match rows {
        RowsEventData::WriteRowsEvent(ev) => collect_rows(
            ev.rows(tme),
            EventKind::Insert,
            columns,
            schema,
            table,
            position,
            timestamp,
            &mut events,
        )?,
        RowsEventData::WriteRowsEventV1(ev) => collect_rows(
            ev.rows(tme),
            EventKind::Insert,
            columns,
            schema,
            table,
            position,
            timestamp,
            &mut events,
        )?,
        RowsEventData::UpdateRowsEvent(ev) => collect_rows(
            ev.rows(tme),
            EventKind::Update,
            columns,
            schema,
            table,
            position,
            timestamp,
            &mut events,
        )?,
        RowsEventData::UpdateRowsEventV1(ev) => collect_rows(
            ev.rows(tme),
            EventKind::Update,
            columns,
            schema,
            table,
            position,
            timestamp,
            &mut events,
        )?,
        RowsEventData::DeleteRowsEvent(ev) => collect_rows(
            ev.rows(tme),
            EventKind::Delete,
            columns,
            schema,
            table,
            position,
            timestamp,
            &mut events,
        )?,
        RowsEventData::DeleteRowsEventV1(ev) => collect_rows(
            ev.rows(tme),
            EventKind::Delete,
            columns,
            schema,
            table,
            position,
            timestamp,
            &mut events,
        )?,
        other => {
            debug!(event = ?other.table_id(), "unsupported rows event variant skipped");
        }
    }
    Ok(events)
}

#[allow(clippy::too_many_arguments)]
fn collect_rows(
    rows: impl Iterator<Item = std::io::Result<(Option<BinlogRow>, Option<BinlogRow>)>>,
    kind: EventKind,
    columns: &[String],
    schema: &str,
    table: &str,
    position: &Position,
    timestamp: DateTime<Utc>,
    events: &mut Vec<RowEvent>,
) -> Result<(), SourceError> {
    for row in rows {
        let (before, after) =
            row.map_err(|e| SourceError::Stream(format!("row decode failed: {e}")))?;
        events.push(RowEvent {
            kind,
            schema: schema.to_string(),
            table: table.to_string(),
            before: before.map(|r| binlog_row_to_image(columns, r)),
            after: after.map(|r| binlog_row_to_image(columns, r)),
            position: position.clone(),
            timestamp,
        });
    }
    Ok(())
}

fn binlog_row_to_image(columns: &[String], row: BinlogRow) -> RowImage {
    let mut image = RowImage::new();
    for (i, value) in row.unwrap().into_iter().enumerate() {
        let name = columns
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("col_{i}"));
        let json = match value {
            BinlogValue::Value(v) => sql_value_to_json(v),
            BinlogValue::Jsonb(j) => Value::try_from(j).unwrap_or(Value::Null),
            BinlogValue::JsonDiff(_) => Value::Null,
        };
        image.insert(name, json);
    }
    image
}

fn sql_row_to_image(columns: &[String], row: Row) -> RowImage {
    let mut image = RowImage::new();
    for (i, value) in row.unwrap().into_iter().enumerate() {
        let name = columns
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("col_{i}"));
        image.insert(name, sql_value_to_json(value));
    }
    image
}

fn sql_value_to_json(value: mysql_async::Value) -> Value {
    use mysql_async::Value as V;
    match value {
        V::NULL => Value::Null,
        V::Bytes(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        V::Int(i) => Value::from(i),
        V::UInt(u) => Value::from(u),
        V::Float(f) => Value::from(f),
        V::Double(d) => Value::from(d),
        V::Date(year, month, day, hour, minute, second, micro) => {
            if hour == 0 && minute == 0 && second == 0 && micro == 0 {
                Value::String(format!("{year:04}-{month:02}-{day:02}"))
            } else {
                Value::String(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micro:06}"
                ))
            }
        }
        V::Time(negative, days, hours, minutes, seconds, micro) => {
            let sign = if negative { "-" } else { "" };
            let total_hours = u32::from(days) * 24 + u32::from(hours);
            Value::String(format!(
                "{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micro:06}"
            ))
        }
    }
}

static DDL_REGEX: OnceLock<Regex> = OnceLock::new();

fn ddl_regex() -> &'static Regex {
    DDL_REGEX.get_or_init(|| {
        Regex::new(
            r"(?ix) ^\s* (?:alter|create|drop|rename|truncate) \s+ table \s+
              (?:if\s+(?:not\s+)?exists\s+)?
              (?: `(?P<first_q>[^`]+)` | (?P<first>[A-Za-z0-9_$]+) )
              (?: \s*\.\s* (?: `(?P<second_q>[^`]+)` | (?P<second>[A-Za-z0-9_$]+) ) )?",
        )
        .expect("DDL regex is a compile-time constant")
    })
}

/// Extracts `(schema, table)` from a DDL statement, falling back to the
/// session's default schema for unqualified names.
fn parse_ddl(sql: &str, default_schema: &str) -> Option<(String, String)> {
    let caps = ddl_regex().captures(sql)?;
    let first = caps
        .name("first_q")
        .or_else(|| caps.name("first"))?
        .as_str()
        .to_string();
    let second = caps
        .name("second_q")
        .or_else(|| caps.name("second"))
        .map(|m| m.as_str().to_string());

    match second {
        Some(table) => Some((first, table)),
        None if default_schema.is_empty() => None,
        None => Some((default_schema.to_string(), first)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ddl_qualified_name() {
        assert_eq!(
            parse_ddl("ALTER TABLE app.t ADD c4 INT", ""),
            Some(("app".to_string(), "t".to_string()))
        );
        assert_eq!(
            parse_ddl("alter table `app`.`t` drop column c4", "other"),
            Some(("app".to_string(), "t".to_string()))
        );
    }

    #[test]
    fn parse_ddl_uses_default_schema() {
        assert_eq!(
            parse_ddl("ALTER TABLE t ADD c4 INT", "app"),
            Some(("app".to_string(), "t".to_string()))
        );
        assert_eq!(parse_ddl("ALTER TABLE t ADD c4 INT", ""), None);
    }

    #[test]
    fn parse_ddl_ignores_dml() {
        assert_eq!(parse_ddl("INSERT INTO t VALUES (1)", "app"), None);
        assert_eq!(parse_ddl("BEGIN", "app"), None);
    }

    #[test]
    fn parse_ddl_handles_create_and_drop() {
        assert_eq!(
            parse_ddl("CREATE TABLE IF NOT EXISTS app.orders (id INT)", ""),
            Some(("app".to_string(), "orders".to_string()))
        );
        assert_eq!(
            parse_ddl("DROP TABLE orders", "app"),
            Some(("app".to_string(), "orders".to_string()))
        );
        assert_eq!(
            parse_ddl("TRUNCATE TABLE app.orders", ""),
            Some(("app".to_string(), "orders".to_string()))
        );
    }

    #[test]
    fn sql_values_map_to_json() {
        use mysql_async::Value as V;

        assert_eq!(sql_value_to_json(V::NULL), Value::Null);
        assert_eq!(sql_value_to_json(V::Int(-7)), Value::from(-7));
        assert_eq!(sql_value_to_json(V::UInt(7)), Value::from(7u64));
        assert_eq!(
            sql_value_to_json(V::Bytes(b"hello".to_vec())),
            Value::String("hello".into())
        );
        assert_eq!(
            sql_value_to_json(V::Date(2024, 5, 1, 0, 0, 0, 0)),
            Value::String("2024-05-01".into())
        );
        assert_eq!(
            sql_value_to_json(V::Date(2024, 5, 1, 12, 30, 5, 1)),
            Value::String("2024-05-01 12:30:05.000001".into())
        );
    }
}
