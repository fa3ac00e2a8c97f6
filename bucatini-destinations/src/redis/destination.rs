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

//! The Redis destination implementation.

use super::config::RedisConfig;
use bucatini_core::destination::{Destination, DestinationError, Request, RequestOp};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

/// A key-value sink over Redis.
///
/// Connections are established by [`Destination::start`] through a
/// [`ConnectionManager`], which reconnects transparently on broken
/// connections; errors that still surface from a command are reported with
/// their retryability so the dispatcher can decide to abort.
pub struct RedisDestination {
    config: RedisConfig,
    conn: Option<ConnectionManager>,
}

impl RedisDestination {
    /// Creates a destination; nothing connects until [`Destination::start`].
    #[must_use]
    pub fn new(config: RedisConfig) -> Self {
        Self { config, conn: None }
    }

    fn connection(&mut self) -> Result<&mut ConnectionManager, DestinationError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DestinationError::connection_msg("redis destination not started"))
    }
}

fn command_error(e: redis::RedisError) -> DestinationError {
    let retryable = e.is_timeout() || e.is_io_error() || e.is_cluster_error();
    DestinationError::publish(e, retryable)
}

#[async_trait::async_trait]
impl Destination for RedisDestination {
    async fn start(&mut self) -> Result<(), DestinationError> {
        let client = redis::Client::open(self.config.url.as_str()).map_err(|e| {
            DestinationError::configuration(
                format!("invalid redis url: {e}"),
                Some("url".to_string()),
            )
        })?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(DestinationError::connection)?;

        info!(url = %self.config.url, "redis destination started");
        self.conn = Some(conn);
        Ok(())
    }

    async fn publish(&mut self, requests: Vec<Request>) -> Result<(), DestinationError> {
        let ttl = self.config.ttl;
        let config = self.config.clone();
        let conn = self.connection()?;

        for request in requests {
            let key = config.full_key(&request.target, &request.key);
            match request.op {
                RequestOp::Upsert => {
                    let payload = serde_json::to_string(&request.payload)
                        .map_err(DestinationError::serialization)?;
                    match ttl {
                        Some(ttl) => {
                            let _: () = conn
                                .set_ex(&key, payload, ttl.as_secs())
                                .await
                                .map_err(command_error)?;
                        }
                        None => {
                            let _: () = conn.set(&key, payload).await.map_err(command_error)?;
                        }
                    }
                }
                RequestOp::Delete => {
                    let _: () = conn.del(&key).await.map_err(command_error)?;
                }
            }
            debug!(key = %key, op = request.op.as_str(), "request applied");
        }

        Ok(())
    }

    async fn ping(&mut self) -> Result<(), DestinationError> {
        let conn = self.connection()?;
        let _: String = redis::cmd("PING")
            .query_async(conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DestinationError> {
        if self.conn.take().is_some() {
            info!("redis destination closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucatini_core::position::Position;
    use serde_json::json;

    #[tokio::test]
    async fn publish_before_start_is_rejected() {
        let mut destination =
            RedisDestination::new(RedisConfig::builder().build().unwrap());

        let err = destination
            .publish(vec![Request::upsert(
                "app.t",
                "1",
                json!({ "id": 1 }),
                Position::genesis(),
            )])
            .await
            .unwrap_err();

        assert!(matches!(err, DestinationError::Connection { .. }));
    }

    #[tokio::test]
    async fn close_without_start_is_a_no_op() {
        let mut destination =
            RedisDestination::new(RedisConfig::builder().build().unwrap());
        destination.close().await.unwrap();
    }
}
