// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row types shared by both backends and their mapping to the domain model.

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::audit::RegulatorInteraction;
use crate::error::{Result, StoreError};
use crate::geo::GeoPoint;
use crate::model::{
    ControlPoint, ExceptionCode, ExceptionReport, Fix, Manifest, NotMonitorableReason, Report,
};

pub(crate) const MANIFEST_COLUMNS: &str = "id, external_id, number, carrier_tax_id, plate, \
     issued_on, state, vehicle_authorized, monitorable, reason_kind, reason_detail, \
     created_at, updated_at";

pub(crate) const CONTROL_POINT_COLUMNS: &str = "id, code, municipality_code, \
     address, latitude, longitude, radius_m, appointment, pact_minutes, adjusted, state, \
     arrival_at, arrival_latitude, arrival_longitude, departure_at, departure_latitude, \
     departure_longitude, no_departure, report_id, confirmation_id";

pub(crate) const REPORT_COLUMNS: &str = "id, manifest_id, control_point_id, \
     manifest_external_id, plate, point_code, arrival_at, arrival_latitude, arrival_longitude, \
     departure_at, departure_latitude, departure_longitude, departure_estimated, no_departure, \
     pact_minutes, state, deadline, attempts, last_attempt_at, confirmation_id, last_error, \
     created_at, updated_at";

pub(crate) const EXCEPTION_COLUMNS: &str = "id, manifest_id, control_point_id, \
     manifest_external_id, plate, point_code, code, detail, state, appointment, deadline, \
     attempts, last_attempt_at, confirmation_id, last_error, created_at, updated_at";

pub(crate) const INTERACTION_COLUMNS: &str = "id, occurred_at, kind, endpoint, outcome, \
     duration_ms, request_payload, response_payload, metadata";

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ManifestRow {
    pub id: String,
    pub external_id: String,
    pub number: String,
    pub carrier_tax_id: String,
    pub plate: String,
    pub issued_on: Option<NaiveDate>,
    pub state: String,
    pub vehicle_authorized: bool,
    pub monitorable: bool,
    pub reason_kind: Option<String>,
    pub reason_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ControlPointRow {
    pub id: String,
    pub code: i32,
    pub municipality_code: Option<String>,
    pub address: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    pub appointment: Option<DateTime<Utc>>,
    pub pact_minutes: i32,
    pub adjusted: bool,
    pub state: String,
    pub arrival_at: Option<DateTime<Utc>>,
    pub arrival_latitude: Option<f64>,
    pub arrival_longitude: Option<f64>,
    pub departure_at: Option<DateTime<Utc>>,
    pub departure_latitude: Option<f64>,
    pub departure_longitude: Option<f64>,
    pub no_departure: bool,
    pub report_id: Option<String>,
    pub confirmation_id: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ReportRow {
    pub id: String,
    pub manifest_id: String,
    pub control_point_id: String,
    pub manifest_external_id: String,
    pub plate: String,
    pub point_code: i32,
    pub arrival_at: DateTime<Utc>,
    pub arrival_latitude: f64,
    pub arrival_longitude: f64,
    pub departure_at: Option<DateTime<Utc>>,
    pub departure_latitude: Option<f64>,
    pub departure_longitude: Option<f64>,
    pub departure_estimated: bool,
    pub no_departure: bool,
    pub pact_minutes: i32,
    pub state: String,
    pub deadline: DateTime<Utc>,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub confirmation_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ExceptionRow {
    pub id: String,
    pub manifest_id: String,
    pub control_point_id: String,
    pub manifest_external_id: String,
    pub plate: String,
    pub point_code: i32,
    pub code: i32,
    pub detail: Option<String>,
    pub state: String,
    pub appointment: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub confirmation_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct InteractionRow {
    pub id: String,
    pub occurred_at: DateTime<Utc>,
    pub kind: String,
    pub endpoint: String,
    pub outcome: String,
    pub duration_ms: i64,
    pub request_payload: String,
    pub response_payload: Option<String>,
    pub metadata: String,
}

fn parse_id(entity: &'static str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::corrupt(entity, format!("id {raw}: {e}")))
}

fn parse_tag<T>(entity: &'static str, raw: &str) -> Result<T>
where
    T: std::str::FromStr<Err = crate::error::ModelError>,
{
    raw.parse().map_err(|e| StoreError::corrupt(entity, format!("{e}")))
}

fn fix(at: Option<DateTime<Utc>>, lat: Option<f64>, lon: Option<f64>) -> Option<Fix> {
    match (at, lat, lon) {
        (Some(at), Some(lat), Some(lon)) => Some(Fix::new(at, GeoPoint::new(lat, lon))),
        _ => None,
    }
}

/// Split an optional fix into bindable columns.
pub(crate) fn fix_columns(fix: Option<Fix>) -> (Option<DateTime<Utc>>, Option<f64>, Option<f64>) {
    match fix {
        Some(f) => (Some(f.at), Some(f.point.latitude), Some(f.point.longitude)),
        None => (None, None, None),
    }
}

impl ManifestRow {
    pub(crate) fn into_manifest(self, control_points: Vec<ControlPoint>) -> Result<Manifest> {
        let not_monitorable = match self.reason_kind {
            Some(kind) => Some(NotMonitorableReason::new(
                parse_tag("manifest", &kind)?,
                self.reason_detail.unwrap_or_default(),
            )),
            None => None,
        };

        Ok(Manifest {
            id: parse_id("manifest", &self.id)?,
            external_id: self.external_id,
            number: self.number,
            carrier_tax_id: self.carrier_tax_id,
            plate: self.plate,
            issued_on: self.issued_on,
            state: parse_tag("manifest", &self.state)?,
            vehicle_authorized: self.vehicle_authorized,
            monitorable: self.monitorable,
            not_monitorable,
            control_points,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl TryFrom<ControlPointRow> for ControlPoint {
    type Error = StoreError;

    fn try_from(row: ControlPointRow) -> Result<Self> {
        Ok(ControlPoint {
            id: parse_id("control point", &row.id)?,
            code: row.code,
            municipality_code: row.municipality_code,
            address: row.address,
            location: GeoPoint::new(row.latitude, row.longitude),
            radius_m: row.radius_m,
            appointment: row.appointment,
            pact_minutes: row.pact_minutes,
            adjusted: row.adjusted,
            state: parse_tag("control point", &row.state)?,
            arrival: fix(row.arrival_at, row.arrival_latitude, row.arrival_longitude),
            departure: fix(
                row.departure_at,
                row.departure_latitude,
                row.departure_longitude,
            ),
            no_departure: row.no_departure,
            report_id: row
                .report_id
                .as_deref()
                .map(|id| parse_id("control point", id))
                .transpose()?,
            confirmation_id: row.confirmation_id,
        })
    }
}

impl TryFrom<ReportRow> for Report {
    type Error = StoreError;

    fn try_from(row: ReportRow) -> Result<Self> {
        Ok(Report {
            id: parse_id("report", &row.id)?,
            manifest_id: parse_id("report", &row.manifest_id)?,
            control_point_id: parse_id("report", &row.control_point_id)?,
            manifest_external_id: row.manifest_external_id,
            plate: row.plate,
            point_code: row.point_code,
            arrival: Fix::new(
                row.arrival_at,
                GeoPoint::new(row.arrival_latitude, row.arrival_longitude),
            ),
            departure: fix(
                row.departure_at,
                row.departure_latitude,
                row.departure_longitude,
            ),
            departure_estimated: row.departure_estimated,
            no_departure: row.no_departure,
            pact_minutes: row.pact_minutes,
            state: parse_tag("report", &row.state)?,
            deadline: row.deadline,
            attempts: row.attempts,
            last_attempt_at: row.last_attempt_at,
            confirmation_id: row.confirmation_id,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<ExceptionRow> for ExceptionReport {
    type Error = StoreError;

    fn try_from(row: ExceptionRow) -> Result<Self> {
        Ok(ExceptionReport {
            id: parse_id("exception report", &row.id)?,
            manifest_id: parse_id("exception report", &row.manifest_id)?,
            control_point_id: parse_id("exception report", &row.control_point_id)?,
            manifest_external_id: row.manifest_external_id,
            plate: row.plate,
            point_code: row.point_code,
            code: ExceptionCode::try_from(row.code)
                .map_err(|e| StoreError::corrupt("exception report", format!("{e}")))?,
            detail: row.detail,
            state: parse_tag("exception report", &row.state)?,
            appointment: row.appointment,
            deadline: row.deadline,
            attempts: row.attempts,
            last_attempt_at: row.last_attempt_at,
            confirmation_id: row.confirmation_id,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<InteractionRow> for RegulatorInteraction {
    type Error = StoreError;

    fn try_from(row: InteractionRow) -> Result<Self> {
        Ok(RegulatorInteraction {
            id: parse_id("regulator interaction", &row.id)?,
            occurred_at: row.occurred_at,
            kind: parse_tag("regulator interaction", &row.kind)?,
            endpoint: row.endpoint,
            outcome: parse_tag("regulator interaction", &row.outcome)?,
            duration_ms: row.duration_ms,
            request_payload: row.request_payload,
            response_payload: row.response_payload,
            metadata: serde_json::from_str(&row.metadata).map_err(|e| {
                StoreError::corrupt("regulator interaction", format!("metadata: {e}"))
            })?,
        })
    }
}

/// Collect rows into domain values, failing on the first corrupt row.
pub(crate) fn map_rows<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}
