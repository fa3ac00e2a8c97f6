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

//! Redis destination configuration.

use std::time::Duration;

/// Configuration for the Redis destination.
///
/// Use [`RedisConfig::builder`] to construct with validation.
///
/// # Example
///
/// ```rust
/// use bucatini_destinations::redis::RedisConfig;
/// use std::time::Duration;
///
/// let config = RedisConfig::builder()
///     .url("redis://localhost:6379")
///     .namespace("bucatini")
///     .ttl(Duration::from_secs(7 * 24 * 60 * 60))
///     .build()
///     .expect("valid config");
/// ```
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL, `redis://` or `rediss://`.
    pub url: String,

    /// Key namespace prepended to every key; empty disables it.
    pub namespace: String,

    /// Optional TTL applied to upserted keys.
    ///
    /// Leave unset for CDC mirrors — an expired key silently diverges from
    /// the source row until the next mutation rewrites it.
    pub ttl: Option<Duration>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            namespace: String::new(),
            ttl: None,
        }
    }
}

impl RedisConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::default()
    }

    /// Builds the full Redis key for a routing target and key.
    #[must_use]
    pub fn full_key(&self, target: &str, key: &str) -> String {
        if self.namespace.is_empty() {
            format!("{target}:{key}")
        } else {
            format!("{}:{target}:{key}", self.namespace)
        }
    }
}

/// Builder for [`RedisConfig`] with validation.
#[derive(Debug, Default)]
pub struct RedisConfigBuilder {
    url: Option<String>,
    namespace: Option<String>,
    ttl: Option<Duration>,
}

impl RedisConfigBuilder {
    /// Sets the connection URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the key namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets a TTL for upserted keys.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL scheme is not `redis://`/`rediss://`, or
    /// the TTL is zero.
    pub fn build(self) -> Result<RedisConfig, RedisConfigError> {
        let url = self
            .url
            .unwrap_or_else(|| "redis://localhost:6379".to_string());
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(RedisConfigError::InvalidUrl { url });
        }

        if let Some(ttl) = self.ttl {
            if ttl.is_zero() {
                return Err(RedisConfigError::ZeroTtl);
            }
        }

        Ok(RedisConfig {
            url,
            namespace: self.namespace.unwrap_or_default(),
            ttl: self.ttl,
        })
    }
}

/// Redis configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum RedisConfigError {
    /// The URL scheme is not `redis://` or `rediss://`.
    #[error("invalid redis url {url:?}: expected a redis:// or rediss:// scheme")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
    },

    /// A zero TTL would expire keys immediately.
    #[error("ttl must be non-zero")]
    ZeroTtl,
}
