// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for geocontrol-core integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use geocontrol_core::{ControlPoint, GeoPoint, Manifest, PostgresStore};

/// Connect to TEST_DATABASE_URL, or `None` when it is unset or unreachable.
pub async fn pg_store() -> Option<PostgresStore> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    PostgresStore::connect(&database_url).await.ok()
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

/// Monitorable manifest with two points and a regulator id unique per call,
/// so tests can share one database.
pub fn manifest(plate: &str) -> Manifest {
    let external_id = format!("T-{}", Uuid::new_v4().simple());
    let mut m = Manifest::new(external_id, "M-1", "900111222", plate, t0());
    let mut p1 = ControlPoint::new(1, GeoPoint::new(4.60, -74.08), 300.0);
    p1.appointment = Some(t0());
    p1.pact_minutes = 45;
    let mut p2 = ControlPoint::new(2, GeoPoint::new(6.24, -75.58), 300.0);
    p2.appointment = Some(t0() + chrono::Duration::hours(8));
    m.control_points = vec![p1, p2];
    m.classify(true, true, None);
    m
}

#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
