// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Geofence monitor against the in-memory store and mock telemetry.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use geocontrol_core::{ControlPointState, ManifestState, Store, SubmissionState};
use geocontrol_gateways::{
    AuthorizedVehicle, Enrollment, MockPositionGateway, Position, PositionError, PositionGateway,
    VehicleDetail,
};
use geocontrol_worker::monitor::{GeofenceMonitor, GeofenceMonitorConfig};
use uuid::Uuid;

use common::*;

struct Harness {
    store: Arc<dyn Store>,
    position: Arc<MockPositionGateway>,
    monitor: GeofenceMonitor,
}

async fn harness() -> Harness {
    let store = store().await;
    let position = Arc::new(MockPositionGateway::new());
    position.authorize(VEHICLE_ID, PLATE).await;
    let monitor = GeofenceMonitor::new(
        store.clone(),
        position.clone(),
        GeofenceMonitorConfig::default(),
    );
    Harness {
        store,
        position,
        monitor,
    }
}

async fn report_for_point(h: &Harness, external_id: &str, idx: usize) -> geocontrol_core::Report {
    let manifest = reload(&h.store, external_id).await;
    h.store
        .find_report_for_point(manifest.id, manifest.control_points[idx].id)
        .await
        .unwrap()
        .expect("report exists")
}

#[tokio::test]
async fn test_arrival_queues_report() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", PLATE).await;
    h.position.push_position(VEHICLE_ID, position(POINT_1)).await;

    let summary = h.monitor.run_once(at(0, 5)).await.unwrap().unwrap();
    assert_eq!(summary.polled, 1);
    assert_eq!(summary.arrivals, 1);

    let manifest = reload(&h.store, "M-1").await;
    let point = &manifest.control_points[0];
    assert_eq!(point.state, ControlPointState::AtPoint);
    assert_eq!(point.arrival.map(|f| f.at), Some(at(0, 5)));
    assert_eq!(manifest.control_points[1].state, ControlPointState::Pending);

    let report = report_for_point(&h, "M-1", 0).await;
    assert_eq!(point.report_id, Some(report.id));
    assert_eq!(report.state, SubmissionState::Pending);
    assert_eq!(report.plate, PLATE);
    assert_eq!(report.point_code, 1);
    assert_eq!(report.arrival.at, at(0, 5));
    assert_eq!(report.deadline, at(72, 5));
    assert!(report.departure.is_none());
}

#[tokio::test]
async fn test_staying_inside_does_not_duplicate_report() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", PLATE).await;
    h.position.push_position(VEHICLE_ID, position(POINT_1)).await;

    h.monitor.run_once(at(0, 5)).await.unwrap();
    let summary = h.monitor.run_once(at(0, 6)).await.unwrap().unwrap();

    assert_eq!(summary.arrivals, 0);
    assert_eq!(summary.departures, 0);
    let counts = h.store.report_counts(None).await.unwrap();
    assert_eq!(counts.total(), 1);
}

#[tokio::test]
async fn test_departure_completes_point_and_updates_report() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", PLATE).await;
    h.position.push_position(VEHICLE_ID, position(POINT_1)).await;
    h.position.push_position(VEHICLE_ID, position(AWAY)).await;

    h.monitor.run_once(at(0, 5)).await.unwrap();
    let summary = h.monitor.run_once(at(0, 50)).await.unwrap().unwrap();
    assert_eq!(summary.departures, 1);

    let manifest = reload(&h.store, "M-1").await;
    let point = &manifest.control_points[0];
    assert_eq!(point.state, ControlPointState::Completed);
    assert_eq!(point.departure.map(|f| f.at), Some(at(0, 50)));

    let report = report_for_point(&h, "M-1", 0).await;
    assert_eq!(report.state, SubmissionState::Pending);
    let departure = report.departure.expect("departure recorded");
    assert_eq!(departure.at, at(0, 50));
    assert_eq!(departure.point, AWAY);
    assert!(!report.departure_estimated);
}

#[tokio::test]
async fn test_departure_reopens_reported_report() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", PLATE).await;
    h.position.push_position(VEHICLE_ID, position(POINT_1)).await;
    h.position.push_position(VEHICLE_ID, position(AWAY)).await;

    h.monitor.run_once(at(0, 5)).await.unwrap();

    let mut report = report_for_point(&h, "M-1", 0).await;
    report.state = SubmissionState::Reported;
    report.attempts = 1;
    report.confirmation_id = Some("100001".to_string());
    h.store.update_report(&report).await.unwrap();

    h.monitor.run_once(at(1, 0)).await.unwrap();

    let report = report_for_point(&h, "M-1", 0).await;
    assert_eq!(report.state, SubmissionState::Pending);
    assert_eq!(report.attempts, 0);
    assert!(report.departure.is_some());
}

#[tokio::test]
async fn test_departure_after_overdue_is_recorded_only() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", PLATE).await;
    h.position.push_position(VEHICLE_ID, position(POINT_1)).await;
    h.position.push_position(VEHICLE_ID, position(AWAY)).await;

    h.monitor.run_once(at(0, 5)).await.unwrap();

    let mut report = report_for_point(&h, "M-1", 0).await;
    report.state = SubmissionState::Overdue;
    h.store.update_report(&report).await.unwrap();

    h.monitor.run_once(at(1, 0)).await.unwrap();

    let report = report_for_point(&h, "M-1", 0).await;
    assert_eq!(report.state, SubmissionState::Overdue);
    assert_eq!(report.departure.map(|f| f.at), Some(at(1, 0)));
}

#[tokio::test]
async fn test_no_departure_flagged_after_72_hours() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", PLATE).await;
    h.position.push_position(VEHICLE_ID, position(POINT_1)).await;

    h.monitor.run_once(t0()).await.unwrap();

    let summary = h.monitor.run_once(at(71, 59)).await.unwrap().unwrap();
    assert_eq!(summary.no_departure, 0);

    let summary = h.monitor.run_once(at(72, 0)).await.unwrap().unwrap();
    assert_eq!(summary.no_departure, 1);

    let manifest = reload(&h.store, "M-1").await;
    assert!(manifest.control_points[0].no_departure);
    assert_eq!(manifest.control_points[0].state, ControlPointState::AtPoint);
    let report = report_for_point(&h, "M-1", 0).await;
    assert!(report.no_departure);

    // Flagged once.
    let summary = h.monitor.run_once(at(73, 0)).await.unwrap().unwrap();
    assert_eq!(summary.no_departure, 0);
}

#[tokio::test]
async fn test_missing_position_skips_manifest() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", PLATE).await;

    let summary = h.monitor.run_once(at(0, 5)).await.unwrap().unwrap();
    assert_eq!(summary.polled, 1);
    assert_eq!(summary.without_position, 1);
    assert_eq!(h.position.position_calls().await, vec![VEHICLE_ID]);
}

#[tokio::test]
async fn test_unknown_vehicle_is_not_polled() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", "NOPE01").await;

    let summary = h.monitor.run_once(at(0, 5)).await.unwrap().unwrap();
    assert_eq!(summary.without_position, 1);
    assert!(h.position.position_calls().await.is_empty());
}

#[tokio::test]
async fn test_vehicle_resolved_by_platform_lookup() {
    let h = harness().await;
    h.position.register(11, "OFF001", true).await;
    seed_manifest(&h.store, "M-1", "OFF001").await;
    h.position.push_position(11, position(POINT_1)).await;

    let summary = h.monitor.run_once(at(0, 5)).await.unwrap().unwrap();
    assert_eq!(summary.arrivals, 1);
    assert_eq!(h.position.position_calls().await, vec![11]);
}

#[tokio::test]
async fn test_manifests_outside_window_are_not_polled() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", PLATE).await;
    h.position.push_position(VEHICLE_ID, position(POINT_1)).await;

    // Point 1 opens two hours before its appointment.
    let summary = h.monitor.run_once(at(-3, 0)).await.unwrap().unwrap();
    assert_eq!(summary.polled, 0);
    assert!(h.position.position_calls().await.is_empty());

    let summary = h.monitor.run_once(at(-2, 0)).await.unwrap().unwrap();
    assert_eq!(summary.polled, 1);
}

#[tokio::test]
async fn test_not_monitorable_manifest_is_ignored() {
    let h = harness().await;
    let mut manifest = manifest("M-1", PLATE);
    manifest.classify(true, false, None);
    h.store.save_manifest(&manifest).await.unwrap();
    h.position.push_position(VEHICLE_ID, position(POINT_1)).await;

    let summary = h.monitor.run_once(at(0, 5)).await.unwrap().unwrap();
    assert_eq!(summary.polled, 0);
}

#[tokio::test]
async fn test_accepted_exception_blocks_report() {
    let h = harness().await;
    let manifest = seed_manifest(&h.store, "M-1", PLATE).await;
    seed_exception(&h.store, &manifest, 0, SubmissionState::Reported).await;
    h.position.push_position(VEHICLE_ID, position(POINT_1)).await;

    let summary = h.monitor.run_once(at(0, 5)).await.unwrap().unwrap();
    assert_eq!(summary.arrivals, 1);

    let manifest = reload(&h.store, "M-1").await;
    assert_eq!(manifest.control_points[0].state, ControlPointState::AtPoint);
    assert!(manifest.control_points[0].report_id.is_none());
    assert_eq!(h.store.report_counts(None).await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_pending_exception_does_not_block_report() {
    let h = harness().await;
    let manifest = seed_manifest(&h.store, "M-1", PLATE).await;
    seed_exception(&h.store, &manifest, 0, SubmissionState::Pending).await;
    h.position.push_position(VEHICLE_ID, position(POINT_1)).await;

    h.monitor.run_once(at(0, 5)).await.unwrap();
    assert_eq!(h.store.report_counts(None).await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_manifest_completes_after_last_departure() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", PLATE).await;
    for point in [POINT_1, AWAY, POINT_2, AWAY] {
        h.position.push_position(VEHICLE_ID, position(point)).await;
    }

    h.monitor.run_once(at(0, 5)).await.unwrap();
    h.monitor.run_once(at(0, 50)).await.unwrap();
    h.monitor.run_once(at(7, 30)).await.unwrap();
    let summary = h.monitor.run_once(at(8, 30)).await.unwrap().unwrap();
    assert_eq!(summary.departures, 1);
    assert_eq!(summary.completed, 1);

    let manifest = reload(&h.store, "M-1").await;
    assert_eq!(manifest.state, ManifestState::Completed);
    assert!(
        manifest
            .control_points
            .iter()
            .all(|p| p.state == ControlPointState::Completed)
    );
    assert_eq!(h.store.report_counts(None).await.unwrap().pending, 2);

    // Completed manifests are no longer monitored.
    let summary = h.monitor.run_once(at(9, 0)).await.unwrap().unwrap();
    assert_eq!(summary.polled, 0);
}

#[tokio::test]
async fn test_position_failure_counts_as_error() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", PLATE).await;
    seed_manifest(&h.store, "M-2", PLATE).await;
    h.position.fail_positions(true).await;

    let summary = h.monitor.run_once(at(0, 5)).await.unwrap().unwrap();
    assert_eq!(summary.polled, 2);
    assert_eq!(summary.errors, 2);
}

#[tokio::test]
async fn test_fleet_listing_failure_fails_cycle() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", PLATE).await;
    h.position.fail_listing(true).await;

    assert!(h.monitor.run_once(at(0, 5)).await.is_err());
    assert!(h.position.position_calls().await.is_empty());
}

/// Telemetry whose position lookup races a confirmation landing on a point.
struct ConfirmedWhilePolling {
    inner: Arc<MockPositionGateway>,
    store: Arc<dyn Store>,
    control_point_id: Uuid,
}

#[async_trait]
impl PositionGateway for ConfirmedWhilePolling {
    async fn list_authorized_vehicles(&self) -> Result<Vec<AuthorizedVehicle>, PositionError> {
        self.inner.list_authorized_vehicles().await
    }

    async fn vehicle_detail_by_plate(
        &self,
        plate: &str,
    ) -> Result<Option<VehicleDetail>, PositionError> {
        self.inner.vehicle_detail_by_plate(plate).await
    }

    async fn last_position(&self, vehicle_id: i64) -> Result<Option<Position>, PositionError> {
        self.store
            .set_control_point_confirmation(self.control_point_id, Some("C-2"))
            .await
            .unwrap();
        self.inner.last_position(vehicle_id).await
    }

    async fn authorize_vehicle(&self, vehicle_id: i64) -> Result<Enrollment, PositionError> {
        self.inner.authorize_vehicle(vehicle_id).await
    }
}

#[tokio::test]
async fn test_concurrent_confirmation_survives_cycle() {
    let h = harness().await;
    seed_manifest(&h.store, "M-1", PLATE).await;
    for point in [POINT_1, AWAY, POINT_2] {
        h.position.push_position(VEHICLE_ID, position(point)).await;
    }
    h.monitor.run_once(at(0, 5)).await.unwrap();
    h.monitor.run_once(at(0, 50)).await.unwrap();

    let first = reload(&h.store, "M-1").await.control_points[0].id;
    h.store
        .set_control_point_confirmation(first, Some("C-1"))
        .await
        .unwrap();

    let racing = GeofenceMonitor::new(
        h.store.clone(),
        Arc::new(ConfirmedWhilePolling {
            inner: h.position.clone(),
            store: h.store.clone(),
            control_point_id: first,
        }),
        GeofenceMonitorConfig::default(),
    );
    let summary = racing.run_once(at(7, 30)).await.unwrap().unwrap();
    assert_eq!(summary.arrivals, 1);

    let manifest = reload(&h.store, "M-1").await;
    assert_eq!(manifest.control_points[0].state, ControlPointState::Completed);
    assert_eq!(
        manifest.control_points[0].confirmation_id.as_deref(),
        Some("C-2")
    );
    assert_eq!(manifest.control_points[1].state, ControlPointState::AtPoint);
    assert!(manifest.control_points[1].report_id.is_some());
}
