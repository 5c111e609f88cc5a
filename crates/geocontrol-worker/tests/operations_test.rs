// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator operations: retry, annul, refresh and read access.

mod common;

use std::sync::Arc;

use geocontrol_core::{
    Fix, ModelError, NotMonitorableReason, Page, ReasonKind, Report, Store, SubmissionOutcome,
    SubmissionState,
};
use geocontrol_gateways::{MockPositionGateway, MockRegulatorGateway};
use geocontrol_worker::WorkerError;
use geocontrol_worker::operations::Operations;
use geocontrol_worker::sync::{ManifestSyncConfig, ManifestSynchronizer};
use uuid::Uuid;

use common::*;

struct Harness {
    store: Arc<dyn Store>,
    position: Arc<MockPositionGateway>,
    regulator: Arc<MockRegulatorGateway>,
    ops: Operations,
}

async fn harness() -> Harness {
    let store = store().await;
    let position = Arc::new(MockPositionGateway::new());
    let regulator = Arc::new(MockRegulatorGateway::new());
    let sync = Arc::new(ManifestSynchronizer::new(
        store.clone(),
        position.clone(),
        regulator.clone(),
        ManifestSyncConfig::default(),
    ));
    let ops = Operations::new(store.clone(), regulator.clone(), sync);
    Harness {
        store,
        position,
        regulator,
        ops,
    }
}

/// Report at point 1 accepted with confirmation "100001".
async fn seed_accepted(store: &Arc<dyn Store>, external_id: &str) -> Report {
    let (_, report) = seed_report(store, external_id, t0()).await;
    store.claim_report(report.id, at(0, 1)).await.unwrap();
    let accepted = SubmissionOutcome::Accepted {
        confirmation_id: "100001".to_string(),
    };
    store
        .finish_report(report.id, &accepted, None, at(0, 1))
        .await
        .unwrap();
    store
        .set_control_point_confirmation(report.control_point_id, Some("100001"))
        .await
        .unwrap();
    reload_report(store, &report).await
}

/// Report at point 1 that used up its attempts.
async fn seed_exhausted(store: &Arc<dyn Store>, external_id: &str) -> Report {
    let (_, report) = seed_report(store, external_id, t0()).await;
    for minute in 1..=3 {
        store.claim_report(report.id, at(0, minute)).await.unwrap();
        let failed = SubmissionOutcome::Failed {
            error: "rejected".to_string(),
        };
        store
            .finish_report(report.id, &failed, None, at(0, minute))
            .await
            .unwrap();
    }
    reload_report(store, &report).await
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test]
async fn test_retry_restores_attempt_budget() {
    let h = harness().await;
    let report = seed_exhausted(&h.store, "M-1").await;
    assert_eq!(report.attempts, 3);

    let retried = h.ops.retry_report(report.id, at(1, 0)).await.unwrap();
    assert_eq!(retried.state, SubmissionState::Pending);
    assert_eq!(retried.attempts, 0);
    assert!(retried.last_error.is_none());

    let stored = reload_report(&h.store, &report).await;
    assert_eq!(stored.state, SubmissionState::Pending);
    assert_eq!(stored.attempts, 0);
    let dispatchable = h
        .store
        .list_dispatchable_reports(at(1, 0), 3, 10)
        .await
        .unwrap();
    assert_eq!(dispatchable.len(), 1);
}

#[tokio::test]
async fn test_retry_after_deadline_is_refused() {
    let h = harness().await;
    let report = seed_exhausted(&h.store, "M-1").await;

    let err = h.ops.retry_report(report.id, at(72, 1)).await.unwrap_err();
    assert!(matches!(
        err,
        WorkerError::Model(ModelError::DeadlinePassed(_))
    ));
    assert_eq!(reload_report(&h.store, &report).await.attempts, 3);
}

#[tokio::test]
async fn test_retry_terminal_report_is_refused() {
    let h = harness().await;
    let (_, report) = seed_report(&h.store, "M-1", t0()).await;
    h.store.mark_overdue_reports(at(72, 1)).await.unwrap();

    let err = h.ops.retry_report(report.id, at(1, 0)).await.unwrap_err();
    assert!(matches!(
        err,
        WorkerError::Model(ModelError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_retry_unknown_report() {
    let h = harness().await;

    let err = h.ops.retry_report(Uuid::new_v4(), t0()).await.unwrap_err();
    assert!(matches!(err, WorkerError::NotFound { entity: "report", .. }));
}

#[tokio::test]
async fn test_retry_exception() {
    let h = harness().await;
    let manifest = seed_manifest(&h.store, "M-1", PLATE).await;
    let exception = seed_exception(&h.store, &manifest, 0, SubmissionState::Error).await;

    let retried = h.ops.retry_exception(exception.id, at(30, 0)).await.unwrap();
    assert_eq!(retried.state, SubmissionState::Pending);

    let err = h.ops.retry_exception(exception.id, at(36, 1)).await.unwrap_err();
    assert!(matches!(
        err,
        WorkerError::Model(ModelError::DeadlinePassed(_))
    ));
}

// ============================================================================
// Annulment
// ============================================================================

#[tokio::test]
async fn test_annul_frees_control_point() {
    let h = harness().await;
    let report = seed_accepted(&h.store, "M-1").await;

    let annulled = h
        .ops
        .annul_report(report.id, "wrong vehicle", at(2, 0))
        .await
        .unwrap();
    assert_eq!(annulled.state, SubmissionState::Annulled);

    let sent = h.regulator.annulments().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].confirmation_id, "100001");
    assert_eq!(sent[0].point_code, 1);
    assert_eq!(sent[0].observations, "wrong vehicle");

    let manifest = reload(&h.store, "M-1").await;
    assert!(manifest.control_points[0].confirmation_id.is_none());

    // The point accepts a fresh report once the old one is annulled.
    let replacement = Report::for_arrival(
        &manifest,
        &manifest.control_points[0],
        Fix::new(at(3, 0), POINT_1),
    );
    h.store.insert_report(&replacement).await.unwrap();
}

#[tokio::test]
async fn test_annul_requires_accepted_report() {
    let h = harness().await;
    let (_, report) = seed_report(&h.store, "M-1", t0()).await;

    let err = h
        .ops
        .annul_report(report.id, "duplicate", at(1, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::InvalidOperation(_)));
    assert!(h.regulator.annulments().await.is_empty());
}

#[tokio::test]
async fn test_rejected_annulment_keeps_report() {
    let h = harness().await;
    let report = seed_accepted(&h.store, "M-1").await;
    h.regulator
        .script_annul(Err(MockRegulatorGateway::rejection("annulment window closed")))
        .await;

    let err = h
        .ops
        .annul_report(report.id, "duplicate", at(2, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Regulator(_)));

    let stored = reload_report(&h.store, &report).await;
    assert_eq!(stored.state, SubmissionState::Reported);
    let manifest = reload(&h.store, "M-1").await;
    assert_eq!(
        manifest.control_points[0].confirmation_id.as_deref(),
        Some("100001")
    );
}

// ============================================================================
// Refresh and reads
// ============================================================================

#[tokio::test]
async fn test_refresh_manifest() {
    let h = harness().await;
    h.position.authorize(VEHICLE_ID, PLATE).await;
    h.regulator.set_manifests(vec![document("M-1", PLATE)]).await;

    let manifest = h.ops.refresh_manifest("M-1", t0()).await.unwrap();
    assert!(manifest.monitorable);
    assert_eq!(manifest.control_points.len(), 2);
    assert_eq!(h.regulator.single_queries().await, vec!["M-1".to_string()]);

    assert_eq!(h.ops.manifest("M-1").await.unwrap().id, manifest.id);
}

#[tokio::test]
async fn test_unknown_records() {
    let h = harness().await;

    assert!(matches!(
        h.ops.manifest("nope").await.unwrap_err(),
        WorkerError::NotFound { entity: "manifest", .. }
    ));
    assert!(matches!(
        h.ops.exception(Uuid::new_v4()).await.unwrap_err(),
        WorkerError::NotFound { .. }
    ));
}

#[tokio::test]
async fn test_statistics() {
    let h = harness().await;
    seed_accepted(&h.store, "M-1").await;
    seed_exhausted(&h.store, "M-2").await;
    let mut unregistered = manifest("M-3", "ZZZ999");
    unregistered.classify(false, false, Some(NotMonitorableReason::not_registered()));
    h.store.save_manifest(&unregistered).await.unwrap();

    let reports = h.ops.report_counts(None).await.unwrap();
    assert_eq!(reports.reported, 1);
    assert_eq!(reports.error, 1);
    assert_eq!(reports.total(), 2);

    let by_plate = h.ops.report_counts_by_plate(Page::default()).await.unwrap();
    assert_eq!(by_plate.len(), 1);
    assert_eq!(by_plate[0].plate, PLATE);
    assert_eq!(by_plate[0].counts.total(), 2);

    assert_eq!(h.ops.report_counts(Some("ZZZ999")).await.unwrap().total(), 0);
    assert_eq!(h.ops.exception_counts(None).await.unwrap().total(), 0);

    let manifests = h.ops.manifest_counts().await.unwrap();
    assert_eq!(manifests.total, 3);
    assert_eq!(manifests.active, 3);
    assert_eq!(manifests.monitorable, 2);
    assert_eq!(manifests.not_monitorable, 1);
    assert_eq!(manifests.by_reason, vec![(ReasonKind::NotRegistered, 1)]);
}
