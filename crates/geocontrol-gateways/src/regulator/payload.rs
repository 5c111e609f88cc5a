// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed requests to and documents from the regulator.

use chrono::{DateTime, NaiveDate, Utc};
use geocontrol_core::geo::DEFAULT_RADIUS_M;
use geocontrol_core::{
    ControlPoint, Departure, ExceptionCode, ExceptionReport, Fix, GeoPoint, Report,
};
use serde::{Deserialize, Serialize};

/// Which manifests a bulk query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryMode {
    /// Only manifests not delivered before.
    New,
    /// Every manifest assigned to the carrier's GPS provider.
    All,
}

impl QueryMode {
    /// Wire value.
    pub fn as_str(self) -> &'static str {
        match self {
            QueryMode::New => "NUEVOS",
            QueryMode::All => "TODOS",
        }
    }
}

/// One scheduled stop as listed by the regulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPointDocument {
    /// Sequence code.
    pub code: i32,
    /// Municipality code.
    pub municipality_code: Option<String>,
    /// Street address.
    pub address: Option<String>,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Appointment, converted from regulator local time.
    pub appointment: Option<DateTime<Utc>>,
    /// Agreed dwell in minutes.
    pub pact_minutes: i32,
    /// Regulator "adjusted" flag.
    pub adjusted: bool,
}

impl ControlPointDocument {
    /// A pending control point with the default geofence radius.
    pub fn into_control_point(self) -> ControlPoint {
        let mut point = ControlPoint::new(
            self.code,
            GeoPoint::new(self.latitude, self.longitude),
            DEFAULT_RADIUS_M,
        );
        point.municipality_code = self.municipality_code;
        point.address = self.address;
        point.appointment = self.appointment;
        point.pact_minutes = self.pact_minutes;
        point.adjusted = self.adjusted;
        point
    }
}

/// A manifest as listed by the regulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    /// Regulator manifest id.
    pub external_id: String,
    /// Manifest number.
    pub number: String,
    /// Carrier tax id.
    pub carrier_tax_id: String,
    /// Vehicle plate, upper-cased.
    pub plate: String,
    /// Issue date.
    pub issued_on: Option<NaiveDate>,
    /// Stops in feed order; may repeat codes.
    pub control_points: Vec<ControlPointDocument>,
}

/// Arrival/departure report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSubmission {
    /// Regulator manifest id.
    pub manifest_external_id: String,
    /// Vehicle plate.
    pub plate: String,
    /// Control point code.
    pub point_code: i32,
    /// Detected arrival.
    pub arrival: Fix,
    /// Departure to report.
    pub departure: Departure,
}

impl ReportSubmission {
    /// Payload for the next submission of `report`.
    pub fn from_report(report: &Report) -> Self {
        Self {
            manifest_external_id: report.manifest_external_id.clone(),
            plate: report.plate.clone(),
            point_code: report.point_code,
            arrival: report.arrival,
            departure: report.departure_for_submission(),
        }
    }

    /// Coordinates sent with the report: the departure's when one is
    /// reported, the arrival's otherwise.
    pub fn reported_location(&self) -> GeoPoint {
        match self.departure {
            Departure::Observed(fix) | Departure::Estimated(fix) => fix.point,
            Departure::NotObserved => self.arrival.point,
        }
    }
}

/// Exception report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionSubmission {
    /// Regulator manifest id.
    pub manifest_external_id: String,
    /// Vehicle plate.
    pub plate: String,
    /// Control point code.
    pub point_code: i32,
    /// Reason code.
    pub code: ExceptionCode,
}

impl ExceptionSubmission {
    /// Payload for `exception`.
    pub fn from_exception(exception: &ExceptionReport) -> Self {
        Self {
            manifest_external_id: exception.manifest_external_id.clone(),
            plate: exception.plate.clone(),
            point_code: exception.point_code,
            code: exception.code,
        }
    }
}

/// Annulment of an accepted report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnulSubmission {
    /// Confirmation id of the report being annulled.
    pub confirmation_id: String,
    /// Regulator manifest id.
    pub manifest_external_id: String,
    /// Vehicle plate.
    pub plate: String,
    /// Control point code.
    pub point_code: i32,
    /// Operator remarks.
    pub observations: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use geocontrol_core::Manifest;

    fn report(pact_minutes: i32) -> Report {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut manifest = Manifest::new("555", "M-1", "900", "abc123", at);
        let mut point = ControlPoint::new(2, GeoPoint::new(4.6, -74.1), 300.0);
        point.pact_minutes = pact_minutes;
        manifest.control_points.push(point.clone());
        Report::for_arrival(&manifest, &point, Fix::new(at, GeoPoint::new(4.6001, -74.1)))
    }

    #[test]
    fn test_missing_departure_is_estimated_at_arrival_location() {
        let submission = ReportSubmission::from_report(&report(45));

        let Departure::Estimated(fix) = submission.departure else {
            panic!("expected estimated departure");
        };
        assert_eq!(fix.at - submission.arrival.at, chrono::Duration::minutes(45));
        assert_eq!(submission.reported_location(), submission.arrival.point);
        assert_eq!(submission.plate, "ABC123");
    }

    #[test]
    fn test_observed_departure_location_is_reported() {
        let mut r = report(0);
        let left = Fix::new(r.arrival.at + chrono::Duration::hours(2), GeoPoint::new(4.7, -74.2));
        r.record_departure(left, left.at);

        let submission = ReportSubmission::from_report(&r);
        assert_eq!(submission.departure, Departure::Observed(left));
        assert_eq!(submission.reported_location(), left.point);
    }

    #[test]
    fn test_no_departure_reports_arrival_location() {
        let mut r = report(30);
        r.no_departure = true;

        let submission = ReportSubmission::from_report(&r);
        assert_eq!(submission.departure, Departure::NotObserved);
        assert_eq!(submission.reported_location(), r.arrival.point);
    }

    #[test]
    fn test_control_point_document_conversion() {
        let point = ControlPointDocument {
            code: 1,
            municipality_code: Some("11001000".into()),
            address: Some("CL 13 # 65-10".into()),
            latitude: 4.65,
            longitude: -74.1,
            appointment: None,
            pact_minutes: 60,
            adjusted: true,
        }
        .into_control_point();

        assert_eq!(point.radius_m, DEFAULT_RADIUS_M);
        assert_eq!(point.pact_minutes, 60);
        assert!(point.adjusted);
        assert_eq!(point.address.as_deref(), Some("CL 13 # 65-10"));
    }
}
