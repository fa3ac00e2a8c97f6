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

//! Rules and the rule registry.
//!
//! A [`RuleConfig`] is the template the operator writes: a schema, a table
//! name or pattern, and routing/projection/transform options. During
//! initialization the [`RuleRegistry`] expands wildcard templates against the
//! source's `information_schema`, fetches table metadata for every concrete
//! table, and compiles one immutable [`Rule`] per `schema.table` key.
//!
//! Expansion rules, in order:
//!
//! - a bare `*` table pattern is rejected outright;
//! - a pattern containing regex metacharacters (`regex::escape(p) != p`) is
//!   expanded via the source into one rule per matching table, and supplying
//!   the same `(schema, pattern)` twice is rejected;
//! - anything else compiles to a single rule.
//!
//! After compilation the registry is read-mostly: the dispatcher is the only
//! mutator, through [`RuleRegistry::update_rule`] on DDL, which replaces the
//! `Arc<Rule>` under a single write guard so in-flight readers keep their
//! snapshot.

use crate::event::RowImage;
use crate::script::CompiledScript;
use crate::source::{BinlogSource, SourceError, TableInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A rule template from configuration.
///
/// `table` may be a literal name or a POSIX-style regex pattern; patterns are
/// expanded against the source at initialization time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Schema (database) name. Literal, never a pattern.
    pub schema: String,

    /// Table name or pattern.
    pub table: String,

    /// Optional column projection; only these columns reach the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,

    /// Routing target (topic / index / key namespace). Defaults to
    /// `schema.table`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Prefix prepended to every routing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,

    /// Inline Lua transform source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// Path to a Lua transform, relative to the configured data directory.
    /// Takes precedence over `script`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_file: Option<String>,
}

impl RuleConfig {
    /// Creates a template with just a schema and table.
    #[must_use]
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            columns: None,
            target: None,
            key_prefix: None,
            script: None,
            script_file: None,
        }
    }
}

/// The compiled directive for one fully-qualified table.
///
/// Immutable after compilation; a DDL refresh builds a replacement via
/// [`Rule::with_table_info`] rather than mutating in place.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Schema name.
    pub schema: String,

    /// Concrete table name (wildcards already expanded).
    pub table: String,

    /// Routing target.
    pub target: String,

    /// Routing key prefix.
    pub key_prefix: String,

    /// Column projection, if declared.
    pub projection: Option<Vec<String>>,

    /// Table metadata as of the last fetch.
    pub table_info: TableInfo,

    /// True when the primary key spans more than one column.
    pub composite_key: bool,

    /// Column count as of the last fetch.
    pub column_count: usize,

    /// Precompiled transform, if declared.
    pub script: Option<CompiledScript>,
}

impl Rule {
    /// Registry key for a `(schema, table)` pair.
    #[must_use]
    pub fn key_for(schema: &str, table: &str) -> String {
        format!("{schema}.{table}")
    }

    /// This rule's registry key.
    #[must_use]
    pub fn key(&self) -> String {
        Self::key_for(&self.schema, &self.table)
    }

    /// Compiles a concrete template against fetched table metadata.
    ///
    /// # Errors
    ///
    /// Fails when the table has no primary key and `skip_no_pk` is off, when
    /// the projection names an unknown column, or when the transform script
    /// does not compile.
    pub async fn compile(
        config: &RuleConfig,
        table_info: TableInfo,
        skip_no_pk: bool,
        data_dir: &Path,
    ) -> Result<Self, RuleError> {
        let key = Self::key_for(&config.schema, &config.table);

        let pk_count = table_info.pk_indices().len();
        if pk_count == 0 && !skip_no_pk {
            return Err(RuleError::MissingPrimaryKey {
                schema: config.schema.clone(),
                table: config.table.clone(),
            });
        }

        let script = Self::compile_script(config, &key, data_dir).await?;

        let rule = Self {
            schema: config.schema.clone(),
            table: config.table.clone(),
            target: config.target.clone().unwrap_or_else(|| key.clone()),
            key_prefix: config.key_prefix.clone().unwrap_or_default(),
            projection: config.columns.clone(),
            composite_key: pk_count > 1,
            column_count: table_info.column_count(),
            table_info,
            script,
        };
        rule.validate_projection()?;

        Ok(rule)
    }

    async fn compile_script(
        config: &RuleConfig,
        key: &str,
        data_dir: &Path,
    ) -> Result<Option<CompiledScript>, RuleError> {
        let source = if let Some(file) = &config.script_file {
            let path = data_dir.join(file);
            Some(tokio::fs::read_to_string(&path).await.map_err(|e| {
                RuleError::ScriptCompile {
                    key: key.to_string(),
                    reason: format!("read {}: {e}", path.display()),
                }
            })?)
        } else {
            config.script.clone()
        };

        match source {
            Some(source) => CompiledScript::compile(key, &source)
                .map(Some)
                .map_err(|e| RuleError::ScriptCompile {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Builds the replacement rule after a DDL-driven metadata refresh.
    ///
    /// The compiled script is carried over untouched; scripts bind logical
    /// column names.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Rule::compile`], minus script compilation.
    pub fn with_table_info(
        &self,
        table_info: TableInfo,
        skip_no_pk: bool,
    ) -> Result<Self, RuleError> {
        let pk_count = table_info.pk_indices().len();
        if pk_count == 0 && !skip_no_pk {
            return Err(RuleError::MissingPrimaryKey {
                schema: self.schema.clone(),
                table: self.table.clone(),
            });
        }

        let updated = Self {
            composite_key: pk_count > 1,
            column_count: table_info.column_count(),
            table_info,
            ..self.clone()
        };
        updated.validate_projection()?;

        Ok(updated)
    }

    fn validate_projection(&self) -> Result<(), RuleError> {
        let Some(projection) = &self.projection else {
            return Ok(());
        };
        for name in projection {
            if !self.table_info.columns.iter().any(|c| &c.name == name) {
                return Err(RuleError::UnknownColumn {
                    key: self.key(),
                    column: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Derives the routing key for a row image: the primary-key values joined
    /// with `:`, behind the rule's prefix. Tables without a primary key fall
    /// back to every column value, which keeps the key deterministic for
    /// replays.
    #[must_use]
    pub fn routing_key(&self, image: &RowImage) -> String {
        let names = self.table_info.pk_names();
        let parts: Vec<String> = if names.is_empty() {
            self.table_info
                .columns
                .iter()
                .map(|c| scalar_to_string(image.get(&c.name)))
                .collect()
        } else {
            names
                .iter()
                .map(|name| scalar_to_string(image.get(*name)))
                .collect()
        };

        format!("{}{}", self.key_prefix, parts.join(":"))
    }

    /// Builds the request payload for a row image, applying the projection
    /// when one is declared.
    #[must_use]
    pub fn payload(&self, image: &RowImage) -> Value {
        match &self.projection {
            Some(projection) => {
                let mut projected = serde_json::Map::with_capacity(projection.len());
                for name in projection {
                    projected.insert(
                        name.clone(),
                        image.get(name).cloned().unwrap_or(Value::Null),
                    );
                }
                Value::Object(projected)
            }
            None => Value::Object(image.clone()),
        }
    }
}

fn scalar_to_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    }
}

/// The compiled table → rule mapping.
///
/// Keys are `schema.table` and unique. Mutated only during initialization
/// and, on DDL, by the dispatcher through [`RuleRegistry::update_rule`].
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Arc<Rule>>>,
    skip_no_pk: bool,
    data_dir: PathBuf,
}

impl RuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(skip_no_pk: bool, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            skip_no_pk,
            data_dir: data_dir.into(),
        }
    }

    /// Expands and compiles the configured templates.
    ///
    /// Replaces the registry's contents wholesale; call once during
    /// initialization.
    ///
    /// # Errors
    ///
    /// Any failure leaves the registry empty — no partial rule set survives.
    pub async fn compile<S>(&self, source: &S, templates: &[RuleConfig]) -> Result<(), RuleError>
    where
        S: BinlogSource + ?Sized,
    {
        let result = self.compile_inner(source, templates).await;
        if result.is_err() {
            self.rules.write().await.clear();
        }
        result
    }

    async fn compile_inner<S>(&self, source: &S, templates: &[RuleConfig]) -> Result<(), RuleError>
    where
        S: BinlogSource + ?Sized,
    {
        let mut expanded = Vec::with_capacity(templates.len());
        let mut wildcard_seen: HashSet<(String, String)> = HashSet::new();

        for template in templates {
            if template.table == "*" {
                return Err(RuleError::BareWildcard {
                    schema: template.schema.clone(),
                });
            }

            if regex::escape(&template.table) != template.table {
                if !wildcard_seen.insert((template.schema.clone(), template.table.clone())) {
                    return Err(RuleError::DuplicateWildcard {
                        schema: template.schema.clone(),
                        pattern: template.table.clone(),
                    });
                }

                let tables = source.list_tables(&template.schema, &template.table).await?;
                debug!(
                    schema = %template.schema,
                    pattern = %template.table,
                    matches = tables.len(),
                    "expanded wildcard rule"
                );
                for table in tables {
                    let mut concrete = template.clone();
                    concrete.table = table;
                    expanded.push(concrete);
                }
            } else {
                expanded.push(template.clone());
            }
        }

        let mut compiled: HashMap<String, Arc<Rule>> = HashMap::with_capacity(expanded.len());
        for config in &expanded {
            let key = Rule::key_for(&config.schema, &config.table);
            if compiled.contains_key(&key) {
                return Err(RuleError::DuplicateRule { key });
            }

            let table_info = source.table_info(&config.schema, &config.table).await?;
            if table_info.pk_indices().is_empty() && self.skip_no_pk {
                info!(rule = %key, "table has no primary key; routing keys fall back to full rows");
            }

            let rule = Rule::compile(config, table_info, self.skip_no_pk, &self.data_dir).await?;
            compiled.insert(key, Arc::new(rule));
        }

        info!(rules = compiled.len(), "rule registry compiled");
        *self.rules.write().await = compiled;
        Ok(())
    }

    /// Refreshes one rule's table metadata after DDL. Absent rule → no-op.
    ///
    /// # Errors
    ///
    /// On a metadata fetch failure the rule keeps its prior `TableInfo` —
    /// stale, but usable until the next DDL or a manual refresh.
    pub async fn update_rule<S>(
        &self,
        source: &S,
        schema: &str,
        table: &str,
    ) -> Result<(), RuleError>
    where
        S: BinlogSource + ?Sized,
    {
        let Some(existing) = self.get(schema, table).await else {
            return Ok(());
        };

        let table_info = source.table_info(schema, table).await?;
        let updated = existing.with_table_info(table_info, self.skip_no_pk)?;

        info!(
            rule = %updated.key(),
            columns = updated.column_count,
            composite_key = updated.composite_key,
            "rule metadata refreshed"
        );
        self.rules
            .write()
            .await
            .insert(updated.key(), Arc::new(updated));
        Ok(())
    }

    /// Looks up the rule for a `(schema, table)` pair.
    pub async fn get(&self, schema: &str, table: &str) -> Option<Arc<Rule>> {
        self.rules
            .read()
            .await
            .get(&Rule::key_for(schema, table))
            .cloned()
    }

    /// Returns true if a rule exists for the pair.
    pub async fn contains(&self, schema: &str, table: &str) -> bool {
        self.rules
            .read()
            .await
            .contains_key(&Rule::key_for(schema, table))
    }

    /// Number of compiled rules.
    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    /// Returns true when no rules are compiled.
    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }

    /// Sorted registry keys, for logs and tests.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.rules.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// A point-in-time snapshot of every rule.
    pub async fn snapshot(&self) -> Vec<Arc<Rule>> {
        self.rules.read().await.values().cloned().collect()
    }

    /// Empties the registry. Used when initialization fails partway so no
    /// partial rule set survives.
    pub async fn clear(&self) {
        self.rules.write().await.clear();
    }
}

/// Errors from rule expansion and compilation.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// A template used the forbidden bare `*` table pattern.
    #[error("wildcard * is not allowed for table name ({schema}.*)")]
    BareWildcard {
        /// Schema of the offending template.
        schema: String,
    },

    /// The same `(schema, pattern)` wildcard was supplied twice.
    #[error("duplicate wildcard rule for {schema}.{pattern}")]
    DuplicateWildcard {
        /// Schema of the offending template.
        schema: String,
        /// The repeated pattern.
        pattern: String,
    },

    /// Two templates resolved to the same concrete table.
    #[error("duplicate rule for {key}")]
    DuplicateRule {
        /// The repeated registry key.
        key: String,
    },

    /// The table has no primary key and `skip_no_pk_table` is off.
    #[error("{schema}.{table} must have a primary key")]
    MissingPrimaryKey {
        /// Schema name.
        schema: String,
        /// Table name.
        table: String,
    },

    /// The projection names a column the table does not have.
    #[error("rule {key} projects unknown column {column}")]
    UnknownColumn {
        /// Registry key of the rule.
        key: String,
        /// The unknown column.
        column: String,
    },

    /// The transform script failed to compile.
    #[error("transform script for {key} failed to compile: {reason}")]
    ScriptCompile {
        /// Registry key of the rule.
        key: String,
        /// Compiler message.
        reason: String,
    },

    /// A source query failed during expansion or metadata fetch.
    #[error(transparent)]
    Source(#[from] SourceError),
}
