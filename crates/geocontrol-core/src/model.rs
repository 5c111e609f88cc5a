// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Manifests, control points, reports and exception reports.
//!
//! A [`Manifest`] owns its [`ControlPoint`]s. [`Report`] and
//! [`ExceptionReport`] are independent records that reference a manifest
//! and a control point by id.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;
use crate::geo::{GeoPoint, Geofence};
use crate::schedule;
use crate::state::{ControlPointState, ManifestState, SubmissionState};

/// A timestamped position: a detected arrival or departure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    /// When the event was detected.
    pub at: DateTime<Utc>,
    /// Where the vehicle was.
    pub point: GeoPoint,
}

impl Fix {
    /// Build a fix.
    pub fn new(at: DateTime<Utc>, point: GeoPoint) -> Self {
        Self { at, point }
    }
}

/// Why a manifest cannot be monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonKind {
    /// Plate unknown to the telemetry platform.
    NotRegistered,
    /// Plate exists but could not be added to the monitoring account.
    EnrollmentFailed,
    /// Authorized, but the platform does not actively track the vehicle.
    NotTracked,
    /// The telemetry platform could not be queried.
    LookupFailed,
}

impl ReasonKind {
    /// Database tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotRegistered => "not_registered",
            Self::EnrollmentFailed => "enrollment_failed",
            Self::NotTracked => "not_tracked",
            Self::LookupFailed => "lookup_failed",
        }
    }
}

impl fmt::Display for ReasonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasonKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_registered" => Ok(Self::NotRegistered),
            "enrollment_failed" => Ok(Self::EnrollmentFailed),
            "not_tracked" => Ok(Self::NotTracked),
            "lookup_failed" => Ok(Self::LookupFailed),
            other => Err(ModelError::UnknownTag {
                kind: "not-monitorable reason",
                value: other.to_string(),
            }),
        }
    }
}

/// Kind plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotMonitorableReason {
    /// Machine-readable kind.
    pub kind: ReasonKind,
    /// Free text shown to operators.
    pub detail: String,
}

impl NotMonitorableReason {
    /// Build a reason.
    pub fn new(kind: ReasonKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Plate unknown to the telemetry platform.
    pub fn not_registered() -> Self {
        Self::new(
            ReasonKind::NotRegistered,
            "vehicle not registered on telemetry platform",
        )
    }
}

/// Exception report codes accepted by the regulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionCode {
    /// 1: vehicle did not appear within the tolerance window.
    VehicleNotSeen,
    /// 2: plate not registered with the monitoring company.
    PlateNotRegistered,
    /// 3: vehicle suspended or deactivated.
    VehicleSuspended,
    /// 4: telemetry unit failing.
    TelemetryUnitFailing,
    /// 5: no relationship with the carrier.
    NoCarrierRelationship,
}

impl ExceptionCode {
    /// Numeric code sent to the regulator.
    pub fn code(self) -> i32 {
        match self {
            Self::VehicleNotSeen => 1,
            Self::PlateNotRegistered => 2,
            Self::VehicleSuspended => 3,
            Self::TelemetryUnitFailing => 4,
            Self::NoCarrierRelationship => 5,
        }
    }

    /// Canonical description.
    pub fn description(self) -> &'static str {
        match self {
            Self::VehicleNotSeen => "vehicle did not appear within tolerance window",
            Self::PlateNotRegistered => "plate not registered",
            Self::VehicleSuspended => "vehicle suspended or deactivated",
            Self::TelemetryUnitFailing => "telemetry unit failing",
            Self::NoCarrierRelationship => "no relationship with carrier",
        }
    }
}

impl TryFrom<i32> for ExceptionCode {
    type Error = ModelError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::VehicleNotSeen),
            2 => Ok(Self::PlateNotRegistered),
            3 => Ok(Self::VehicleSuspended),
            4 => Ok(Self::TelemetryUnitFailing),
            5 => Ok(Self::NoCarrierRelationship),
            other => Err(ModelError::UnknownTag {
                kind: "exception code",
                value: other.to_string(),
            }),
        }
    }
}

/// One scheduled stop of a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPoint {
    /// Stable identity, referenced by reports.
    pub id: Uuid,
    /// Sequence code: 1 is the load point, 2 and above unload points.
    pub code: i32,
    /// Municipality code from the feed.
    pub municipality_code: Option<String>,
    /// Street address from the feed.
    pub address: Option<String>,
    /// Geofence centre.
    pub location: GeoPoint,
    /// Geofence radius in metres.
    pub radius_m: f64,
    /// Scheduled appointment. Immutable once set.
    pub appointment: Option<DateTime<Utc>>,
    /// Agreed dwell in minutes.
    pub pact_minutes: i32,
    /// The regulator flagged this point as adjusted.
    pub adjusted: bool,
    /// Visit state.
    pub state: ControlPointState,
    /// Detected arrival.
    pub arrival: Option<Fix>,
    /// Detected departure.
    pub departure: Option<Fix>,
    /// Dwell exceeded the report window without a departure.
    pub no_departure: bool,
    /// Report created for this visit.
    pub report_id: Option<Uuid>,
    /// Regulator confirmation of the accepted report.
    pub confirmation_id: Option<String>,
}

impl ControlPoint {
    /// A fresh pending point.
    pub fn new(code: i32, location: GeoPoint, radius_m: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            municipality_code: None,
            address: None,
            location,
            radius_m,
            appointment: None,
            pact_minutes: 0,
            adjusted: false,
            state: ControlPointState::Pending,
            arrival: None,
            departure: None,
            no_departure: false,
            report_id: None,
            confirmation_id: None,
        }
    }

    /// Circle used for arrival/departure detection.
    pub fn geofence(&self) -> Geofence {
        Geofence::new(self.location, self.radius_m)
    }

    /// Whether the monitor should fetch a position for this point at `now`.
    ///
    /// Completed points never need polling; points at the stop are always
    /// tracked until departure; points without an appointment are tracked
    /// indefinitely.
    pub fn needs_polling(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            ControlPointState::Completed => false,
            ControlPointState::AtPoint => true,
            ControlPointState::Pending => match self.appointment {
                None => true,
                Some(appt) => schedule::monitoring_window_open(appt, now),
            },
        }
    }

    /// pending -> at_point.
    pub fn record_arrival(&mut self, fix: Fix) -> Result<(), ModelError> {
        self.state = self.state.advance(ControlPointState::AtPoint)?;
        self.arrival = Some(fix);
        Ok(())
    }

    /// at_point -> completed.
    pub fn record_departure(&mut self, fix: Fix) -> Result<(), ModelError> {
        self.state = self.state.advance(ControlPointState::Completed)?;
        self.departure = Some(fix);
        Ok(())
    }

    /// Dwell since arrival reached the no-departure threshold at `now`.
    pub fn dwell_exceeded(&self, now: DateTime<Utc>) -> bool {
        self.state == ControlPointState::AtPoint
            && self
                .arrival
                .is_some_and(|a| now - a.at >= schedule::NO_DEPARTURE_AFTER)
    }

    /// Refresh feed-owned attributes from `incoming`, keeping local progress.
    fn refresh_from(&mut self, incoming: ControlPoint) {
        self.location = incoming.location;
        self.municipality_code = incoming.municipality_code;
        self.address = incoming.address;
        self.pact_minutes = incoming.pact_minutes;
        self.adjusted = incoming.adjusted;
        if self.appointment.is_none() {
            self.appointment = incoming.appointment;
        }
    }

    fn has_progress(&self) -> bool {
        self.state != ControlPointState::Pending || self.report_id.is_some()
    }
}

/// A regulator-issued trip document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Local identity.
    pub id: Uuid,
    /// Regulator identifier, unique.
    pub external_id: String,
    /// Human-readable manifest number.
    pub number: String,
    /// Carrier tax id.
    pub carrier_tax_id: String,
    /// Vehicle plate, upper case.
    pub plate: String,
    /// Issue date.
    pub issued_on: Option<NaiveDate>,
    /// Lifecycle state.
    pub state: ManifestState,
    /// Plate is on the monitoring account.
    pub vehicle_authorized: bool,
    /// Manifest is polled by the geofence monitor.
    pub monitorable: bool,
    /// Set whenever `monitorable` is false.
    pub not_monitorable: Option<NotMonitorableReason>,
    /// Control points ordered by code.
    pub control_points: Vec<ControlPoint>,
    /// First seen.
    pub created_at: DateTime<Utc>,
    /// Last written.
    pub updated_at: DateTime<Utc>,
}

/// How a resync treats a manifest that already finished locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResyncStatePolicy {
    /// Keep `completed`/`annulled`.
    #[default]
    Preserve,
    /// Reset to `active` on every resync.
    ForceActive,
}

impl FromStr for ResyncStatePolicy {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preserve" => Ok(Self::Preserve),
            "force-active" => Ok(Self::ForceActive),
            other => Err(ModelError::UnknownTag {
                kind: "resync state policy",
                value: other.to_string(),
            }),
        }
    }
}

impl Manifest {
    /// A new active manifest with no control points.
    pub fn new(
        external_id: impl Into<String>,
        number: impl Into<String>,
        carrier_tax_id: impl Into<String>,
        plate: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: external_id.into(),
            number: number.into(),
            carrier_tax_id: carrier_tax_id.into(),
            plate: plate.trim().to_uppercase(),
            issued_on: None,
            state: ManifestState::Active,
            vehicle_authorized: false,
            monitorable: false,
            not_monitorable: None,
            control_points: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set authorization and monitorability; a missing reason is filled in.
    pub fn classify(
        &mut self,
        authorized: bool,
        monitorable: bool,
        reason: Option<NotMonitorableReason>,
    ) {
        self.vehicle_authorized = authorized;
        self.monitorable = monitorable;
        self.not_monitorable = if monitorable {
            None
        } else {
            Some(reason.unwrap_or_else(|| {
                NotMonitorableReason::new(ReasonKind::NotTracked, "vehicle not monitorable")
            }))
        };
    }

    /// Apply the resync policy to a manifest listed again by the regulator.
    pub fn reactivate(&mut self, policy: ResyncStatePolicy) {
        if policy == ResyncStatePolicy::ForceActive {
            self.state = ManifestState::Active;
        }
    }

    /// Merge freshly decoded points into this manifest.
    ///
    /// Points are matched by code. A matched point keeps its identity,
    /// progress and appointment; feed attributes are refreshed. Points
    /// absent from the feed survive only if they progressed or carry a
    /// report. The result is ordered by code.
    pub fn merge_control_points(&mut self, incoming: Vec<ControlPoint>) {
        let mut existing = std::mem::take(&mut self.control_points);
        let mut merged = Vec::with_capacity(incoming.len().max(existing.len()));

        for point in incoming {
            match existing.iter().position(|p| p.code == point.code) {
                Some(idx) => {
                    let mut kept = existing.swap_remove(idx);
                    kept.refresh_from(point);
                    merged.push(kept);
                }
                None => merged.push(point),
            }
        }

        merged.extend(existing.into_iter().filter(ControlPoint::has_progress));
        merged.sort_by_key(|p| p.code);
        self.control_points = merged;
    }

    /// Mark the manifest completed once every point is completed.
    ///
    /// Returns `true` when the state changed.
    pub fn complete_if_done(&mut self) -> bool {
        let done = !self.control_points.is_empty()
            && self
                .control_points
                .iter()
                .all(|p| p.state == ControlPointState::Completed);
        if done && self.state == ManifestState::Active {
            self.state = ManifestState::Completed;
            true
        } else {
            false
        }
    }

    /// Whether any point needs a position at `now`.
    pub fn needs_polling(&self, now: DateTime<Utc>) -> bool {
        self.control_points.iter().any(|p| p.needs_polling(now))
    }

    /// Find a point by id.
    pub fn control_point(&self, id: Uuid) -> Option<&ControlPoint> {
        self.control_points.iter().find(|p| p.id == id)
    }
}

/// Keep the last point seen per code, ordered by code.
///
/// Returns the deduplicated points and how many entries were dropped.
pub fn dedup_control_points(points: Vec<ControlPoint>) -> (Vec<ControlPoint>, usize) {
    let total = points.len();
    let mut by_code: Vec<ControlPoint> = Vec::with_capacity(total);
    for point in points {
        match by_code.iter_mut().find(|p| p.code == point.code) {
            Some(slot) => *slot = point,
            None => by_code.push(point),
        }
    }
    by_code.sort_by_key(|p| p.code);
    let removed = total - by_code.len();
    (by_code, removed)
}

/// Departure data sent with a report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Departure {
    /// Detected leaving the geofence.
    Observed(Fix),
    /// Synthesized from arrival and agreed dwell.
    Estimated(Fix),
    /// Explicit "no departure" marker.
    NotObserved,
}

/// Arrival/departure report for one control point visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Local identity.
    pub id: Uuid,
    /// Owning manifest.
    pub manifest_id: Uuid,
    /// Visited control point.
    pub control_point_id: Uuid,
    /// Regulator manifest id, copied for submission.
    pub manifest_external_id: String,
    /// Vehicle plate.
    pub plate: String,
    /// Control point code.
    pub point_code: i32,
    /// Detected arrival.
    pub arrival: Fix,
    /// Detected or estimated departure.
    pub departure: Option<Fix>,
    /// `departure` was synthesized, not detected.
    pub departure_estimated: bool,
    /// Dwell exceeded the window without a departure.
    pub no_departure: bool,
    /// Agreed dwell used for departure synthesis.
    pub pact_minutes: i32,
    /// Submission state.
    pub state: SubmissionState,
    /// Arrival plus 72 hours.
    pub deadline: DateTime<Utc>,
    /// Submission attempts since the last reset.
    pub attempts: i32,
    /// Last claim time.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Regulator confirmation on success.
    pub confirmation_id: Option<String>,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

/// What a detected departure did to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartureOutcome {
    /// Report reopened for resubmission.
    Requeued,
    /// Report is terminal; departure stored only.
    Recorded,
}

impl Report {
    /// Report for an arrival at `point` of `manifest`.
    pub fn for_arrival(manifest: &Manifest, point: &ControlPoint, arrival: Fix) -> Self {
        Self {
            id: Uuid::new_v4(),
            manifest_id: manifest.id,
            control_point_id: point.id,
            manifest_external_id: manifest.external_id.clone(),
            plate: manifest.plate.clone(),
            point_code: point.code,
            arrival,
            departure: None,
            departure_estimated: false,
            no_departure: false,
            pact_minutes: point.pact_minutes,
            state: SubmissionState::Pending,
            deadline: schedule::report_deadline(arrival.at),
            attempts: 0,
            last_attempt_at: None,
            confirmation_id: None,
            last_error: None,
            created_at: arrival.at,
            updated_at: arrival.at,
        }
    }

    /// Store a detected departure and reopen the report for resubmission.
    pub fn record_departure(&mut self, fix: Fix, now: DateTime<Utc>) -> DepartureOutcome {
        self.departure = Some(fix);
        self.departure_estimated = false;
        self.no_departure = false;
        self.updated_at = now;

        if self.state.allows(SubmissionState::Pending) {
            self.state = SubmissionState::Pending;
            self.attempts = 0;
            self.last_error = None;
            DepartureOutcome::Requeued
        } else {
            DepartureOutcome::Recorded
        }
    }

    /// Departure to send on the next submission.
    pub fn departure_for_submission(&self) -> Departure {
        match self.departure {
            Some(fix) if !self.departure_estimated => Departure::Observed(fix),
            _ if self.no_departure => Departure::NotObserved,
            _ => {
                let dwell = if self.pact_minutes > 0 {
                    self.pact_minutes
                } else {
                    1
                };
                Departure::Estimated(Fix::new(
                    self.arrival.at + Duration::minutes(i64::from(dwell)),
                    self.arrival.point,
                ))
            }
        }
    }

    /// Operator retry: back to pending with a fresh attempt budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<(), ModelError> {
        reset_submission(&mut self.state, "report", self.deadline, now)?;
        self.attempts = 0;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    /// Move to `superseded` after the exception report for the point was accepted.
    pub fn supersede(&mut self, now: DateTime<Utc>) -> Result<(), ModelError> {
        self.state = self
            .state
            .transition("report", SubmissionState::Superseded)?;
        self.updated_at = now;
        Ok(())
    }

    /// Move to `annulled` after the regulator accepted an annulment.
    pub fn annul(&mut self, now: DateTime<Utc>) -> Result<(), ModelError> {
        self.state = self.state.transition("report", SubmissionState::Annulled)?;
        self.updated_at = now;
        Ok(())
    }
}

/// Exception report for a control point the vehicle never reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionReport {
    /// Local identity.
    pub id: Uuid,
    /// Owning manifest.
    pub manifest_id: Uuid,
    /// Missed control point.
    pub control_point_id: Uuid,
    /// Regulator manifest id.
    pub manifest_external_id: String,
    /// Vehicle plate.
    pub plate: String,
    /// Control point code.
    pub point_code: i32,
    /// Reason code.
    pub code: ExceptionCode,
    /// Free-text detail.
    pub detail: Option<String>,
    /// Submission state.
    pub state: SubmissionState,
    /// Missed appointment.
    pub appointment: DateTime<Utc>,
    /// Appointment plus 36 hours.
    pub deadline: DateTime<Utc>,
    /// Submission attempts since the last reset.
    pub attempts: i32,
    /// Last claim time.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Regulator confirmation on success.
    pub confirmation_id: Option<String>,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

impl ExceptionReport {
    /// Exception report for `point`, which must carry an appointment.
    pub fn for_missed_point(
        manifest: &Manifest,
        point: &ControlPoint,
        code: ExceptionCode,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        let appointment = point.appointment.ok_or(ModelError::Missing("appointment"))?;
        Ok(Self {
            id: Uuid::new_v4(),
            manifest_id: manifest.id,
            control_point_id: point.id,
            manifest_external_id: manifest.external_id.clone(),
            plate: manifest.plate.clone(),
            point_code: point.code,
            code,
            detail,
            state: SubmissionState::Pending,
            appointment,
            deadline: schedule::exception_deadline(appointment),
            attempts: 0,
            last_attempt_at: None,
            confirmation_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether the regulator accepts this report at `now`.
    pub fn window_open(&self, now: DateTime<Utc>) -> bool {
        schedule::exception_window_open(self.appointment, now)
    }

    /// Operator retry: back to pending with a fresh attempt budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<(), ModelError> {
        reset_submission(&mut self.state, "exception report", self.deadline, now)?;
        self.attempts = 0;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    /// Move to `superseded` after the report for the point was accepted.
    pub fn supersede(&mut self, now: DateTime<Utc>) -> Result<(), ModelError> {
        self.state = self
            .state
            .transition("exception report", SubmissionState::Superseded)?;
        self.updated_at = now;
        Ok(())
    }
}

fn reset_submission(
    state: &mut SubmissionState,
    entity: &'static str,
    deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), ModelError> {
    if !state.is_dispatchable() {
        return Err(ModelError::InvalidTransition {
            entity,
            from: state.as_str(),
            to: SubmissionState::Pending.as_str(),
        });
    }
    if now > deadline {
        return Err(ModelError::DeadlinePassed(deadline));
    }
    *state = SubmissionState::Pending;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 2, 14, 0, 0).unwrap()
    }

    fn point(code: i32) -> ControlPoint {
        ControlPoint::new(code, GeoPoint::new(4.6, -74.1), 300.0)
    }

    fn manifest_with(points: Vec<ControlPoint>) -> Manifest {
        let mut m = Manifest::new("9001", "M-1", "900123", "abc123", t0());
        m.control_points = points;
        m
    }

    #[test]
    fn test_plate_is_normalized() {
        let m = Manifest::new("1", "1", "1", " xyz987 ", t0());
        assert_eq!(m.plate, "XYZ987");
    }

    #[test]
    fn test_dedup_keeps_last_entry_per_code() {
        let mut first = point(2);
        first.address = Some("first".into());
        let mut last = point(2);
        last.address = Some("last".into());

        let (points, removed) = dedup_control_points(vec![point(3), first, point(1), last]);

        assert_eq!(removed, 1);
        assert_eq!(points.iter().map(|p| p.code).collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(points[1].address.as_deref(), Some("last"));
    }

    #[test]
    fn test_merge_preserves_progress_and_appointment() {
        let mut visited = point(1);
        visited.appointment = Some(t0());
        visited.record_arrival(Fix::new(t0(), visited.location)).unwrap();
        let visited_id = visited.id;
        let mut m = manifest_with(vec![visited, point(2)]);

        let mut incoming = point(1);
        incoming.appointment = Some(t0() + Duration::hours(5));
        incoming.address = Some("new address".into());
        incoming.location = GeoPoint::new(4.7, -74.2);

        m.merge_control_points(vec![incoming]);

        assert_eq!(m.control_points.len(), 1, "untouched pending point 2 is dropped");
        let p = &m.control_points[0];
        assert_eq!(p.id, visited_id);
        assert_eq!(p.state, ControlPointState::AtPoint);
        assert_eq!(p.appointment, Some(t0()));
        assert_eq!(p.address.as_deref(), Some("new address"));
        assert_eq!(p.location, GeoPoint::new(4.7, -74.2));
    }

    #[test]
    fn test_merge_keeps_missing_point_with_report() {
        let mut linked = point(3);
        linked.report_id = Some(Uuid::new_v4());
        let mut m = manifest_with(vec![linked]);

        m.merge_control_points(vec![point(1)]);

        assert_eq!(m.control_points.iter().map(|p| p.code).collect::<Vec<_>>(), [1, 3]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut m = manifest_with(vec![]);
        let feed = vec![point(1), point(2)];
        m.merge_control_points(feed.clone());
        let once = m.clone();
        m.merge_control_points(feed);

        let ids = |m: &Manifest| m.control_points.iter().map(|p| p.id).collect::<Vec<_>>();
        assert_eq!(ids(&once), ids(&m));
        assert_eq!(once.control_points, m.control_points);
    }

    #[test]
    fn test_classify_always_records_reason() {
        let mut m = manifest_with(vec![]);
        m.classify(true, false, None);
        assert_eq!(
            m.not_monitorable.as_ref().map(|r| r.kind),
            Some(ReasonKind::NotTracked)
        );

        m.classify(true, true, None);
        assert!(m.not_monitorable.is_none());
    }

    #[test]
    fn test_complete_if_done() {
        let mut p = point(1);
        p.record_arrival(Fix::new(t0(), p.location)).unwrap();
        let mut m = manifest_with(vec![p]);
        assert!(!m.complete_if_done());

        let loc = m.control_points[0].location;
        m.control_points[0]
            .record_departure(Fix::new(t0(), loc))
            .unwrap();
        assert!(m.complete_if_done());
        assert_eq!(m.state, ManifestState::Completed);
    }

    #[test]
    fn test_needs_polling_rules() {
        let now = t0();
        let mut p = point(1);
        assert!(p.needs_polling(now), "no appointment polls indefinitely");

        p.appointment = Some(now + Duration::hours(3));
        assert!(!p.needs_polling(now));
        p.appointment = Some(now + Duration::hours(1));
        assert!(p.needs_polling(now));
        p.appointment = Some(now - Duration::hours(30));
        assert!(!p.needs_polling(now));

        p.record_arrival(Fix::new(now, p.location)).unwrap();
        assert!(p.needs_polling(now), "at_point always polls");
        p.record_departure(Fix::new(now, p.location)).unwrap();
        assert!(!p.needs_polling(now));
    }

    #[test]
    fn test_report_deadline_and_estimated_departure() {
        let mut p = point(2);
        p.pact_minutes = 45;
        let m = manifest_with(vec![p.clone()]);
        let report = Report::for_arrival(&m, &p, Fix::new(t0(), p.location));

        assert_eq!(report.deadline, t0() + Duration::hours(72));
        assert_eq!(
            report.departure_for_submission(),
            Departure::Estimated(Fix::new(t0() + Duration::minutes(45), p.location))
        );
    }

    #[test]
    fn test_estimated_departure_defaults_to_one_minute() {
        let p = point(1);
        let m = manifest_with(vec![p.clone()]);
        let report = Report::for_arrival(&m, &p, Fix::new(t0(), p.location));

        match report.departure_for_submission() {
            Departure::Estimated(fix) => assert_eq!(fix.at, t0() + Duration::minutes(1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_no_departure_flag_sends_marker() {
        let p = point(1);
        let m = manifest_with(vec![p.clone()]);
        let mut report = Report::for_arrival(&m, &p, Fix::new(t0(), p.location));
        report.no_departure = true;
        assert_eq!(report.departure_for_submission(), Departure::NotObserved);
    }

    #[test]
    fn test_departure_requeues_reported_but_not_terminal() {
        let p = point(1);
        let m = manifest_with(vec![p.clone()]);
        let mut report = Report::for_arrival(&m, &p, Fix::new(t0(), p.location));
        report.state = SubmissionState::Reported;
        report.attempts = 2;

        let leave = Fix::new(t0() + Duration::hours(1), GeoPoint::new(4.61, -74.1));
        assert_eq!(report.record_departure(leave, leave.at), DepartureOutcome::Requeued);
        assert_eq!(report.state, SubmissionState::Pending);
        assert_eq!(report.attempts, 0);
        assert_eq!(report.departure_for_submission(), Departure::Observed(leave));

        report.state = SubmissionState::Overdue;
        assert_eq!(report.record_departure(leave, leave.at), DepartureOutcome::Recorded);
        assert_eq!(report.state, SubmissionState::Overdue);
    }

    #[test]
    fn test_reset_for_retry_respects_state_and_deadline() {
        let p = point(1);
        let m = manifest_with(vec![p.clone()]);
        let mut report = Report::for_arrival(&m, &p, Fix::new(t0(), p.location));
        report.state = SubmissionState::Error;
        report.attempts = 3;
        report.last_error = Some("boom".into());

        report.reset_for_retry(t0() + Duration::hours(1)).unwrap();
        assert_eq!(report.state, SubmissionState::Pending);
        assert_eq!(report.attempts, 0);
        assert!(report.last_error.is_none());

        report.state = SubmissionState::Error;
        assert_eq!(
            report.reset_for_retry(t0() + Duration::hours(73)),
            Err(ModelError::DeadlinePassed(report.deadline))
        );

        report.state = SubmissionState::Reported;
        assert!(report.reset_for_retry(t0()).is_err());
    }

    #[test]
    fn test_exception_requires_appointment() {
        let p = point(1);
        let m = manifest_with(vec![p.clone()]);
        let err = ExceptionReport::for_missed_point(&m, &p, ExceptionCode::VehicleNotSeen, None, t0());
        assert_eq!(err, Err(ModelError::Missing("appointment")));
    }

    #[test]
    fn test_exception_deadline() {
        let mut p = point(1);
        p.appointment = Some(t0());
        let m = manifest_with(vec![p.clone()]);
        let ex = ExceptionReport::for_missed_point(
            &m,
            &p,
            ExceptionCode::VehicleNotSeen,
            None,
            t0() + Duration::hours(30),
        )
        .unwrap();

        assert_eq!(ex.deadline, t0() + Duration::hours(36));
        assert!(ex.window_open(t0() + Duration::hours(30)));
        assert!(!ex.window_open(t0() + Duration::hours(12)));
    }

    #[test]
    fn test_exception_codes() {
        for n in 1..=5 {
            assert_eq!(ExceptionCode::try_from(n).unwrap().code(), n);
        }
        assert!(ExceptionCode::try_from(6).is_err());
    }
}
