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

//! Tests for Redis destination configuration.
//!
//! These tests verify builder validation and key construction:
//! - Defaults and field passthrough
//! - URL scheme validation (`redis://` / `rediss://` only)
//! - TTL validation
//! - Key namespacing

#![cfg(feature = "redis")]

use bucatini_destinations::redis::{RedisConfig, RedisConfigError};
use std::time::Duration;

#[test]
fn defaults_are_valid() {
    let config = RedisConfig::builder().build().unwrap();
    assert_eq!(config.url, "redis://localhost:6379");
    assert!(config.namespace.is_empty());
    assert!(config.ttl.is_none());
}

#[test]
fn builder_passes_fields_through() {
    let config = RedisConfig::builder()
        .url("redis://cache.internal:6380")
        .namespace("bucatini")
        .ttl(Duration::from_secs(3600))
        .build()
        .unwrap();

    assert_eq!(config.url, "redis://cache.internal:6380");
    assert_eq!(config.namespace, "bucatini");
    assert_eq!(config.ttl, Some(Duration::from_secs(3600)));
}

#[test]
fn tls_scheme_is_accepted() {
    let config = RedisConfig::builder()
        .url("rediss://cache.internal:6379")
        .build()
        .unwrap();
    assert_eq!(config.url, "rediss://cache.internal:6379");
}

#[test]
fn rejects_non_redis_scheme() {
    let err = RedisConfig::builder()
        .url("http://localhost:6379")
        .build()
        .unwrap_err();
    assert!(matches!(err, RedisConfigError::InvalidUrl { .. }));
}

#[test]
fn rejects_empty_url() {
    let err = RedisConfig::builder().url("").build().unwrap_err();
    assert!(matches!(err, RedisConfigError::InvalidUrl { .. }));
}

#[test]
fn rejects_zero_ttl() {
    let err = RedisConfig::builder()
        .ttl(Duration::ZERO)
        .build()
        .unwrap_err();
    assert!(matches!(err, RedisConfigError::ZeroTtl));
}

#[test]
fn full_key_with_and_without_namespace() {
    let bare = RedisConfig::builder().build().unwrap();
    assert_eq!(bare.full_key("app.users", "7"), "app.users:7");

    let namespaced = RedisConfig::builder()
        .namespace("bucatini")
        .build()
        .unwrap();
    assert_eq!(namespaced.full_key("app.users", "7"), "bucatini:app.users:7");
}

#[test]
fn full_key_preserves_composite_routing_keys() {
    let config = RedisConfig::builder().namespace("ns").build().unwrap();
    assert_eq!(
        config.full_key("app.memberships", "3:7"),
        "ns:app.memberships:3:7"
    );
}
