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

//! Lua transform scripts.
//!
//! A rule may carry a user-supplied Lua script that rewrites each row before
//! it becomes a destination request. Scripts are compiled to bytecode once,
//! during rule compilation, and the [`CompiledScript`] artifact is retained
//! on the rule; DDL-driven metadata refreshes do not recompile (scripts
//! address logical column names, not physical metadata).
//!
//! The script runs once per row with a single table argument:
//!
//! ```lua
//! local ctx = ...
//! -- ctx.schema, ctx.table, ctx.action ("insert"/"update"/"delete")
//! -- ctx.row    (after-image for insert/update, before-image for delete)
//! -- ctx.before (before-image for update, nil otherwise)
//! if ctx.row.status == "internal" then
//!     return nil -- drop the row
//! end
//! return {
//!     key = "user:" .. ctx.row.id,
//!     value = { id = ctx.row.id, name = ctx.row.name },
//! }
//! ```
//!
//! Returning `nil` drops the row. Returning a table overrides the routing
//! key (`key`), the payload (`value`), and optionally the operation
//! (`action`, `"upsert"` or `"delete"`); omitted fields fall back to the
//! rule's defaults.

use crate::event::RowImage;
use mlua::{ChunkMode, Lua};
use serde_json::Value;
use std::fmt;

/// A transform script precompiled to Lua bytecode.
///
/// The bytecode is plain data, so the artifact is freely shareable across
/// tasks while execution stays confined to a [`ScriptRuntime`].
#[derive(Clone)]
pub struct CompiledScript {
    name: String,
    bytecode: Vec<u8>,
}

impl fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledScript")
            .field("name", &self.name)
            .field("bytecode_len", &self.bytecode.len())
            .finish()
    }
}

impl CompiledScript {
    /// Compiles Lua source to bytecode.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Compile`] if the source does not parse.
    pub fn compile(name: impl Into<String>, source: &str) -> Result<Self, ScriptError> {
        let name = name.into();
        let lua = Lua::new();
        let function = lua
            .load(source)
            .set_name(name.clone())
            .into_function()
            .map_err(|e| ScriptError::Compile(e.to_string()))?;

        Ok(Self {
            bytecode: function.dump(true),
            name,
        })
    }

    /// Script name, for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Per-row input handed to a script.
#[derive(Debug, Clone, Copy)]
pub struct TransformInput<'a> {
    /// Schema name.
    pub schema: &'a str,
    /// Table name.
    pub table: &'a str,
    /// Mutation kind label: `insert`, `update`, or `delete`.
    pub action: &'a str,
    /// Primary row image (after-image, or before-image for deletes).
    pub row: &'a RowImage,
    /// Before-image for updates.
    pub before: Option<&'a RowImage>,
}

/// What a script returned for one row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutput {
    /// Routing key override.
    pub key: Option<String>,
    /// Payload override.
    pub value: Option<Value>,
    /// Operation override: `upsert` or `delete`.
    pub action: Option<String>,
}

/// A Lua VM that executes compiled transforms.
///
/// Not `Sync`; the handler keeps one behind a mutex and runs scripts on the
/// ingest path only.
pub struct ScriptRuntime {
    lua: Lua,
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRuntime {
    /// Creates a fresh VM.
    #[must_use]
    pub fn new() -> Self {
        Self { lua: Lua::new() }
    }

    /// Runs `script` against one row.
    ///
    /// Returns `None` when the script dropped the row.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Runtime`] if the script raises, or
    /// [`ScriptError::BadReturn`] if it returns something other than `nil`
    /// or a table.
    pub fn apply(
        &self,
        script: &CompiledScript,
        input: &TransformInput<'_>,
    ) -> Result<Option<TransformOutput>, ScriptError> {
        let function = self
            .lua
            .load(&script.bytecode[..])
            .set_name(script.name.clone())
            .set_mode(ChunkMode::Binary)
            .into_function()
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;

        let ctx = self
            .build_context(input)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;

        let returned: mlua::Value = function
            .call(ctx)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;

        match returned {
            mlua::Value::Nil => Ok(None),
            mlua::Value::Table(table) => {
                let key = table
                    .get::<_, Option<String>>("key")
                    .map_err(|e| ScriptError::BadReturn(e.to_string()))?;
                let value = match table
                    .get::<_, mlua::Value>("value")
                    .map_err(|e| ScriptError::BadReturn(e.to_string()))?
                {
                    mlua::Value::Nil => None,
                    other => Some(lua_to_json(other)?),
                };
                let action = table
                    .get::<_, Option<String>>("action")
                    .map_err(|e| ScriptError::BadReturn(e.to_string()))?;

                Ok(Some(TransformOutput { key, value, action }))
            }
            other => Err(ScriptError::BadReturn(format!(
                "expected nil or table, got {}",
                other.type_name()
            ))),
        }
    }

    fn build_context(&self, input: &TransformInput<'_>) -> mlua::Result<mlua::Table<'_>> {
        let ctx = self.lua.create_table()?;
        ctx.set("schema", input.schema)?;
        ctx.set("table", input.table)?;
        ctx.set("action", input.action)?;
        ctx.set("row", image_to_lua(&self.lua, input.row)?)?;
        if let Some(before) = input.before {
            ctx.set("before", image_to_lua(&self.lua, before)?)?;
        }
        Ok(ctx)
    }
}

fn image_to_lua<'lua>(lua: &'lua Lua, image: &RowImage) -> mlua::Result<mlua::Table<'lua>> {
    let table = lua.create_table()?;
    for (name, value) in image {
        table.set(name.as_str(), json_to_lua(lua, value)?)?;
    }
    Ok(table)
}

fn json_to_lua<'lua>(lua: &'lua Lua, value: &Value) -> mlua::Result<mlua::Value<'lua>> {
    Ok(match value {
        Value::Null => mlua::Value::Nil,
        Value::Bool(b) => mlua::Value::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                mlua::Value::Integer(i)
            } else {
                mlua::Value::Number(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => mlua::Value::String(lua.create_string(s)?),
        Value::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.set(i + 1, json_to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            mlua::Value::Table(table)
        }
    })
}

fn lua_to_json(value: mlua::Value) -> Result<Value, ScriptError> {
    Ok(match value {
        mlua::Value::Nil => Value::Null,
        mlua::Value::Boolean(b) => Value::Bool(b),
        mlua::Value::Integer(i) => Value::from(i),
        mlua::Value::Number(n) => serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        mlua::Value::String(s) => Value::String(
            s.to_str()
                .map_err(|e| ScriptError::BadReturn(e.to_string()))?
                .to_string(),
        ),
        mlua::Value::Table(table) => {
            if table.raw_len() > 0 {
                let mut items = Vec::with_capacity(table.raw_len());
                for item in table.sequence_values::<mlua::Value>() {
                    let item = item.map_err(|e| ScriptError::BadReturn(e.to_string()))?;
                    items.push(lua_to_json(item)?);
                }
                Value::Array(items)
            } else {
                let mut map = serde_json::Map::new();
                for pair in table.pairs::<String, mlua::Value>() {
                    let (k, v) = pair.map_err(|e| ScriptError::BadReturn(e.to_string()))?;
                    map.insert(k, lua_to_json(v)?);
                }
                Value::Object(map)
            }
        }
        other => {
            return Err(ScriptError::BadReturn(format!(
                "unsupported Lua value of type {}",
                other.type_name()
            )))
        }
    })
}

/// Errors from compiling or running a transform script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The source did not parse.
    #[error("script compile failed: {0}")]
    Compile(String),

    /// The script raised at runtime.
    #[error("script runtime error: {0}")]
    Runtime(String),

    /// The script returned something the engine cannot interpret.
    #[error("script returned an unusable value: {0}")]
    BadReturn(String),
}
