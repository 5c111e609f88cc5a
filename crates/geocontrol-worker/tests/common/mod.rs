// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for geocontrol-worker integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use geocontrol_core::{
    ControlPoint, ExceptionCode, ExceptionReport, Fix, GeoPoint, Manifest, Report, SqliteStore,
    Store, SubmissionState,
};
use geocontrol_gateways::{ControlPointDocument, ManifestDocument, Position};

pub const PLATE: &str = "ABC123";
pub const VEHICLE_ID: i64 = 7;

/// Control point 1, appointment at [`t0`].
pub const POINT_1: GeoPoint = GeoPoint::new(4.60, -74.08);
/// Control point 2, appointment eight hours after [`t0`].
pub const POINT_2: GeoPoint = GeoPoint::new(6.24, -75.58);
/// Well outside both geofences.
pub const AWAY: GeoPoint = GeoPoint::new(5.30, -74.90);

pub async fn store() -> Arc<dyn Store> {
    Arc::new(
        SqliteStore::connect("sqlite::memory:")
            .await
            .expect("in-memory store"),
    )
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub fn at(hours: i64, minutes: i64) -> DateTime<Utc> {
    t0() + Duration::hours(hours) + Duration::minutes(minutes)
}

pub fn position(point: GeoPoint) -> Position {
    Position {
        latitude: point.latitude,
        longitude: point.longitude,
        reported_at: None,
        speed: Some(0.0),
    }
}

/// Regulator listing with the two standard control points.
pub fn document(external_id: &str, plate: &str) -> ManifestDocument {
    ManifestDocument {
        external_id: external_id.to_string(),
        number: format!("N-{external_id}"),
        carrier_tax_id: "900111222".to_string(),
        plate: plate.to_string(),
        issued_on: Some(t0().date_naive()),
        control_points: vec![
            point_document(1, POINT_1, t0()),
            point_document(2, POINT_2, at(8, 0)),
        ],
    }
}

pub fn point_document(code: i32, location: GeoPoint, appointment: DateTime<Utc>) -> ControlPointDocument {
    ControlPointDocument {
        code,
        municipality_code: Some("11001000".to_string()),
        address: Some(format!("Stop {code}")),
        latitude: location.latitude,
        longitude: location.longitude,
        appointment: Some(appointment),
        pact_minutes: 45,
        adjusted: false,
    }
}

/// Monitorable manifest with the two standard control points, not yet saved.
pub fn manifest(external_id: &str, plate: &str) -> Manifest {
    let mut m = Manifest::new(external_id, format!("N-{external_id}"), "900111222", plate, t0());
    let mut p1 = ControlPoint::new(1, POINT_1, 300.0);
    p1.appointment = Some(t0());
    p1.pact_minutes = 45;
    let mut p2 = ControlPoint::new(2, POINT_2, 300.0);
    p2.appointment = Some(at(8, 0));
    p2.pact_minutes = 45;
    m.control_points = vec![p1, p2];
    m.classify(true, true, None);
    m
}

pub async fn seed_manifest(store: &Arc<dyn Store>, external_id: &str, plate: &str) -> Manifest {
    let m = manifest(external_id, plate);
    store.save_manifest(&m).await.expect("save manifest");
    m
}

/// Arrival at control point 1 at `arrived`, with the report linked to the point.
pub async fn seed_report(
    store: &Arc<dyn Store>,
    external_id: &str,
    arrived: DateTime<Utc>,
) -> (Manifest, Report) {
    let mut m = manifest(external_id, PLATE);
    let fix = Fix::new(arrived, POINT_1);
    let report = Report::for_arrival(&m, &m.control_points[0], fix);
    m.control_points[0].record_arrival(fix).expect("arrival");
    m.control_points[0].report_id = Some(report.id);
    store.save_manifest(&m).await.expect("save manifest");
    store.insert_report(&report).await.expect("insert report");
    (m, report)
}

/// Exception report for control point `idx` in `state`.
pub async fn seed_exception(
    store: &Arc<dyn Store>,
    manifest: &Manifest,
    idx: usize,
    state: SubmissionState,
) -> ExceptionReport {
    let mut exception = ExceptionReport::for_missed_point(
        manifest,
        &manifest.control_points[idx],
        ExceptionCode::VehicleNotSeen,
        None,
        at(25, 0),
    )
    .expect("exception report");
    exception.state = state;
    if state == SubmissionState::Reported {
        exception.confirmation_id = Some("900001".to_string());
    }
    store
        .insert_exception(&exception)
        .await
        .expect("insert exception");
    exception
}

pub async fn reload(store: &Arc<dyn Store>, external_id: &str) -> Manifest {
    store
        .get_manifest_by_external_id(external_id)
        .await
        .expect("load manifest")
        .expect("manifest exists")
}

pub async fn reload_report(store: &Arc<dyn Store>, report: &Report) -> Report {
    store
        .get_report(report.id)
        .await
        .expect("load report")
        .expect("report exists")
}
