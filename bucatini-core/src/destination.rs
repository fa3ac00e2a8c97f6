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

//! Destination endpoint trait and prepared requests.
//!
//! A [`Request`] is a fully prepared destination operation: routing target,
//! idempotency key, payload, and the binlog position it originated from. The
//! [`Destination`] trait is the uniform capability the engine requires of
//! every concrete sink — message broker, key-value store, or search index:
//! `{start, publish, ping, close}`.
//!
//! Retries for transient failures are the sink's own responsibility inside
//! [`Destination::publish`]; an error surfaced to the dispatcher aborts the
//! engine so the persisted position never advances past an unpublished
//! request.
//!
//! # Implementing a Destination
//!
//! ```rust
//! use bucatini_core::destination::{Destination, DestinationError, Request};
//! use async_trait::async_trait;
//!
//! /// A sink that prints requests, for demos.
//! struct StdoutDestination;
//!
//! #[async_trait]
//! impl Destination for StdoutDestination {
//!     async fn start(&mut self) -> Result<(), DestinationError> {
//!         Ok(())
//!     }
//!
//!     async fn publish(&mut self, requests: Vec<Request>) -> Result<(), DestinationError> {
//!         for request in requests {
//!             println!("{} {} -> {}", request.op.as_str(), request.target, request.key);
//!         }
//!         Ok(())
//!     }
//!
//!     async fn ping(&mut self) -> Result<(), DestinationError> {
//!         Ok(())
//!     }
//!
//!     async fn close(&mut self) -> Result<(), DestinationError> {
//!         Ok(())
//!     }
//! }
//! ```

use crate::position::Position;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The operation a [`Request`] asks of the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOp {
    /// Write or overwrite the value at the routing key.
    Upsert,

    /// Remove the value at the routing key.
    Delete,
}

impl RequestOp {
    /// Lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

/// A prepared destination operation.
///
/// Requests are immutable once built by the handler. The routing key doubles
/// as the idempotency key: replaying a request after a crash converges on the
/// same destination state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Routing target: topic, index, or key namespace. Defaults to the
    /// rule's `schema.table`.
    pub target: String,

    /// Routing key, derived from the row's primary key values.
    pub key: String,

    /// Payload for upserts; `None` for deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Operation kind.
    pub op: RequestOp,

    /// Position of the originating binlog event.
    pub position: Position,
}

impl Request {
    /// Builds an upsert request.
    #[must_use]
    pub fn upsert(
        target: impl Into<String>,
        key: impl Into<String>,
        payload: Value,
        position: Position,
    ) -> Self {
        Self {
            target: target.into(),
            key: key.into(),
            payload: Some(payload),
            op: RequestOp::Upsert,
            position,
        }
    }

    /// Builds a delete request.
    #[must_use]
    pub fn delete(target: impl Into<String>, key: impl Into<String>, position: Position) -> Self {
        Self {
            target: target.into(),
            key: key.into(),
            payload: None,
            op: RequestOp::Delete,
            position,
        }
    }
}

/// Errors surfaced by destination implementations.
#[derive(Error, Debug)]
pub enum DestinationError {
    /// Connecting to the destination failed.
    #[error("connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// The underlying connection error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A request payload could not be serialized for the sink.
    #[error("serialization error: {message}")]
    Serialization {
        /// Human-readable error message.
        message: String,
        /// The underlying serialization error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Delivering a batch failed, past the sink's own retry policy.
    #[error("publish error: {message}")]
    Publish {
        /// Human-readable error message.
        message: String,
        /// Whether another attempt could succeed.
        retryable: bool,
        /// The underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid destination configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Human-readable error message.
        message: String,
        /// Offending parameter, if known.
        parameter: Option<String>,
    },
}

impl DestinationError {
    /// Creates a connection error from any error type.
    #[must_use]
    pub fn connection(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Connection {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a connection error with a custom message.
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a serialization error from any error type.
    #[must_use]
    pub fn serialization(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Serialization {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a publish error with retryability information.
    #[must_use]
    pub fn publish(
        source: impl std::error::Error + Send + Sync + 'static,
        retryable: bool,
    ) -> Self {
        Self::Publish {
            message: source.to_string(),
            retryable,
            source: Some(Box::new(source)),
        }
    }

    /// Creates a publish error with a custom message.
    #[must_use]
    pub fn publish_msg(message: impl Into<String>, retryable: bool) -> Self {
        Self::Publish {
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>, parameter: Option<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            parameter,
        }
    }

    /// Returns whether another attempt at the failed operation could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Serialization { .. } | Self::Configuration { .. } => false,
            Self::Publish { retryable, .. } => *retryable,
        }
    }
}

/// The capability set common to all concrete sinks.
///
/// The engine requires exactly four operations. Batch semantics, schema
/// validation, and retry policy belong to the implementation; the dispatcher
/// only distinguishes success from surfaced failure.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Establishes connections and validates whatever schemas the sink cares
    /// about. Called once during transfer initialization.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination is unavailable; initialization
    /// aborts.
    async fn start(&mut self) -> Result<(), DestinationError>;

    /// Delivers a batch of requests, applying the sink's own retry policy.
    ///
    /// Requests within a batch must be applied in order.
    ///
    /// # Errors
    ///
    /// A surfaced error aborts the engine; the position does not advance past
    /// the failed batch.
    async fn publish(&mut self, requests: Vec<Request>) -> Result<(), DestinationError>;

    /// Cheap liveness check used by the metrics loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination is unreachable.
    async fn ping(&mut self) -> Result<(), DestinationError>;

    /// Releases resources. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown fails; the controller logs and proceeds.
    async fn close(&mut self) -> Result<(), DestinationError>;
}
