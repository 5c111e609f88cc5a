// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Audit log retention.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use geocontrol_core::{
    InteractionFilter, InteractionKind, InteractionOutcome, RegulatorInteraction, SqliteStore,
    Store,
};
use geocontrol_worker::audit_retention::{AuditRetention, AuditRetentionConfig};
use uuid::Uuid;

use common::*;

fn interaction(occurred_at: DateTime<Utc>) -> RegulatorInteraction {
    RegulatorInteraction {
        id: Uuid::new_v4(),
        occurred_at,
        kind: InteractionKind::SubmitReport,
        endpoint: "https://regulator.test/ws".to_string(),
        outcome: InteractionOutcome::Success,
        duration_ms: 120,
        request_payload: "<request/>".to_string(),
        response_payload: Some("<response/>".to_string()),
        metadata: serde_json::json!({ "plate": PLATE }),
    }
}

#[tokio::test]
async fn test_purges_only_expired_interactions() {
    let store = store().await;
    store
        .record_interaction(&interaction(t0() - chrono::Duration::days(8)))
        .await
        .unwrap();
    let recent = interaction(t0() - chrono::Duration::days(1));
    store.record_interaction(&recent).await.unwrap();

    let retention = AuditRetention::new(store.clone(), AuditRetentionConfig::default());
    assert_eq!(retention.run_once(t0()).await.unwrap(), Some(1));

    let left = store
        .list_interactions(&InteractionFilter::page(10))
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, recent.id);

    assert_eq!(retention.run_once(t0()).await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_purge_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("geocontrol.db");

    {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::from_path(&path).await.unwrap());
        for days in [10, 9, 2] {
            store
                .record_interaction(&interaction(t0() - chrono::Duration::days(days)))
                .await
                .unwrap();
        }
        let retention = AuditRetention::new(
            store,
            AuditRetentionConfig {
                retention: Duration::from_secs(5 * 24 * 3600),
                ..Default::default()
            },
        );
        assert_eq!(retention.run_once(t0()).await.unwrap(), Some(2));
    }

    let reopened = SqliteStore::from_path(&path).await.unwrap();
    let left = reopened
        .list_interactions(&InteractionFilter::page(10))
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].occurred_at, t0() - chrono::Duration::days(2));
}
