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

//! Integration tests for the file-backed position store.
//!
//! These tests verify the store's durability contract:
//! - Round-trip of saved positions
//! - Genesis fallback when nothing has been persisted
//! - Atomic overwrite (no leftover temp files)
//! - Survival across reopen (the crash-recovery path)
//! - Corrupt payloads surfacing as serialization errors

use bucatini_core::position::Position;
use bucatini_core::state::{PositionStore, PositionStoreError};
use bucatini_stores::file::FileStore;

#[tokio::test]
async fn missing_file_returns_genesis() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("position.json"));
    store.initialize().await.unwrap();

    assert!(store.get().await.unwrap().is_genesis());
}

#[tokio::test]
async fn save_then_get_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("position.json"));
    store.initialize().await.unwrap();

    let position = Position::new("mysql-bin.000042", 987_654);
    store.save(&position).await.unwrap();
    assert_eq!(store.get().await.unwrap(), position);
}

#[tokio::test]
async fn save_overwrites_previous_position() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("position.json"));
    store.initialize().await.unwrap();

    store
        .save(&Position::new("mysql-bin.000001", 4))
        .await
        .unwrap();
    store
        .save(&Position::new("mysql-bin.000002", 1024))
        .await
        .unwrap();

    assert_eq!(
        store.get().await.unwrap(),
        Position::new("mysql-bin.000002", 1024)
    );
}

#[tokio::test]
async fn save_leaves_no_temp_file_behind() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("position.json"));
    store.initialize().await.unwrap();

    store
        .save(&Position::new("mysql-bin.000003", 555))
        .await
        .unwrap();

    assert!(dir.path().join("position.json").exists());
    assert!(!dir.path().join("position.tmp").exists());
}

#[tokio::test]
async fn initialize_creates_missing_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("nested").join("position.json");

    let store = FileStore::new(&path);
    store.initialize().await.unwrap();
    store
        .save(&Position::new("mysql-bin.000001", 4))
        .await
        .unwrap();

    assert_eq!(
        store.get().await.unwrap(),
        Position::new("mysql-bin.000001", 4)
    );
}

#[tokio::test]
async fn survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("position.json");

    {
        let store = FileStore::new(&path);
        store.initialize().await.unwrap();
        store
            .save(&Position::new("mysql-bin.000009", 77))
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let reopened = FileStore::new(&path);
    reopened.initialize().await.unwrap();
    assert_eq!(
        reopened.get().await.unwrap(),
        Position::new("mysql-bin.000009", 77)
    );
}

#[tokio::test]
async fn corrupt_file_surfaces_serialization_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("position.json");
    tokio::fs::write(&path, b"not json").await.unwrap();

    let store = FileStore::new(&path);
    let err = store.get().await.unwrap_err();
    assert!(matches!(err, PositionStoreError::Serialization(_)));
}

#[tokio::test]
async fn corrupt_file_recovers_after_next_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("position.json");
    tokio::fs::write(&path, b"{ torn write").await.unwrap();

    let store = FileStore::new(&path);
    store.initialize().await.unwrap();
    assert!(store.get().await.is_err());

    store
        .save(&Position::new("mysql-bin.000010", 2048))
        .await
        .unwrap();
    assert_eq!(
        store.get().await.unwrap(),
        Position::new("mysql-bin.000010", 2048)
    );
}
