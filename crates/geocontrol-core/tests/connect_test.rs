// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend selection by URL.

mod common;

use common::*;
use geocontrol_core::store::{self, LAST_FULL_SYNC_KEY};
use geocontrol_core::StoreError;

#[tokio::test]
async fn test_connect_sqlite_memory() {
    let store = store::connect("sqlite::memory:").await.unwrap();

    assert_eq!(store.get_setting(LAST_FULL_SYNC_KEY).await.unwrap(), None);
    store
        .put_setting(LAST_FULL_SYNC_KEY, &t0().to_rfc3339(), t0())
        .await
        .unwrap();
    assert_eq!(
        store.get_setting(LAST_FULL_SYNC_KEY).await.unwrap(),
        Some(t0().to_rfc3339())
    );

    let m = manifest("XYZ987");
    store.save_manifest(&m).await.unwrap();
    assert_eq!(store.list_monitorable_manifests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_connect_sqlite_file() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("gc.db").display());

    let store = store::connect(&url).await.unwrap();
    store.put_setting("k", "v", t0()).await.unwrap();
    drop(store);

    let reopened = store::connect(&url).await.unwrap();
    assert_eq!(reopened.get_setting("k").await.unwrap().as_deref(), Some("v"));
}

#[tokio::test]
async fn test_connect_rejects_unknown_scheme() {
    let err = store::connect("mysql://user:secret@db/geo").await.err().unwrap();

    match err {
        StoreError::UnsupportedUrl(shown) => assert!(!shown.contains("secret")),
        other => panic!("unexpected error: {other}"),
    }
}
