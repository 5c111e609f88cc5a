// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process gateways for testing.
//!
//! Both mocks are scripted up front and record the calls they receive, so
//! tests can drive the jobs without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{DecodeError, PositionError, RegulatorError};
use crate::position::{AuthorizedVehicle, Enrollment, Position, PositionGateway, VehicleDetail};
use crate::regulator::{
    AnnulSubmission, ExceptionSubmission, ManifestDocument, QueryMode, RegulatorGateway,
    ReportSubmission,
};

#[derive(Debug, Default)]
struct PositionState {
    authorized: Vec<AuthorizedVehicle>,
    details: HashMap<String, VehicleDetail>,
    positions: HashMap<i64, VecDeque<Position>>,
    fail_list: bool,
    fail_detail: bool,
    fail_positions: bool,
    refuse_enrollment: HashSet<i64>,
    enrolled: Vec<i64>,
    position_calls: Vec<i64>,
}

/// Scripted telemetry platform.
#[derive(Debug, Clone, Default)]
pub struct MockPositionGateway {
    state: Arc<Mutex<PositionState>>,
}

impl MockPositionGateway {
    /// Empty platform: no vehicles, no positions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a vehicle on the monitoring account. Also registers it platform-wide.
    pub async fn authorize(&self, id: i64, plate: &str) {
        let mut state = self.state.lock().await;
        let plate = plate.to_uppercase();
        state.authorized.push(AuthorizedVehicle {
            id,
            plate: plate.clone(),
        });
        state.details.entry(plate.clone()).or_insert(VehicleDetail {
            id,
            plate,
            monitored: true,
        });
    }

    /// Register a vehicle platform-wide without authorizing it.
    pub async fn register(&self, id: i64, plate: &str, monitored: bool) {
        let plate = plate.to_uppercase();
        self.state.lock().await.details.insert(
            plate.clone(),
            VehicleDetail {
                id,
                plate,
                monitored,
            },
        );
    }

    /// Queue a position for `vehicle_id`.
    ///
    /// Positions are returned in order; the last one repeats.
    pub async fn push_position(&self, vehicle_id: i64, position: Position) {
        self.state
            .lock()
            .await
            .positions
            .entry(vehicle_id)
            .or_default()
            .push_back(position);
    }

    /// Make the authorized-vehicle listing fail.
    pub async fn fail_listing(&self, fail: bool) {
        self.state.lock().await.fail_list = fail;
    }

    /// Make plate lookups fail.
    pub async fn fail_detail(&self, fail: bool) {
        self.state.lock().await.fail_detail = fail;
    }

    /// Make position lookups fail.
    pub async fn fail_positions(&self, fail: bool) {
        self.state.lock().await.fail_positions = fail;
    }

    /// Make enrollment of `vehicle_id` fail.
    pub async fn refuse_enrollment(&self, vehicle_id: i64) {
        self.state.lock().await.refuse_enrollment.insert(vehicle_id);
    }

    /// Vehicles enrolled through [`PositionGateway::authorize_vehicle`].
    pub async fn enrolled(&self) -> Vec<i64> {
        self.state.lock().await.enrolled.clone()
    }

    /// Vehicle ids passed to [`PositionGateway::last_position`], in call order.
    pub async fn position_calls(&self) -> Vec<i64> {
        self.state.lock().await.position_calls.clone()
    }
}

fn unavailable() -> PositionError {
    PositionError::Status {
        status: 503,
        body: "mock telemetry unavailable".to_string(),
    }
}

#[async_trait]
impl PositionGateway for MockPositionGateway {
    async fn list_authorized_vehicles(&self) -> Result<Vec<AuthorizedVehicle>, PositionError> {
        let state = self.state.lock().await;
        if state.fail_list {
            return Err(unavailable());
        }
        Ok(state.authorized.clone())
    }

    async fn vehicle_detail_by_plate(
        &self,
        plate: &str,
    ) -> Result<Option<VehicleDetail>, PositionError> {
        let state = self.state.lock().await;
        if state.fail_detail {
            return Err(unavailable());
        }
        Ok(state.details.get(&plate.to_uppercase()).cloned())
    }

    async fn last_position(&self, vehicle_id: i64) -> Result<Option<Position>, PositionError> {
        let mut state = self.state.lock().await;
        state.position_calls.push(vehicle_id);
        if state.fail_positions {
            return Err(unavailable());
        }
        let Some(queue) = state.positions.get_mut(&vehicle_id) else {
            return Ok(None);
        };
        if queue.len() > 1 {
            Ok(queue.pop_front())
        } else {
            Ok(queue.front().cloned())
        }
    }

    async fn authorize_vehicle(&self, vehicle_id: i64) -> Result<Enrollment, PositionError> {
        let mut state = self.state.lock().await;
        if state.authorized.iter().any(|v| v.id == vehicle_id) {
            return Ok(Enrollment::AlreadyEnrolled);
        }
        if state.refuse_enrollment.contains(&vehicle_id) {
            return Err(PositionError::Status {
                status: 403,
                body: "enrollment refused".to_string(),
            });
        }
        let plate = state
            .details
            .values()
            .find(|d| d.id == vehicle_id)
            .map(|d| d.plate.clone())
            .unwrap_or_default();
        state.authorized.push(AuthorizedVehicle {
            id: vehicle_id,
            plate,
        });
        state.enrolled.push(vehicle_id);
        Ok(Enrollment::Enrolled)
    }
}

#[derive(Debug, Default)]
struct RegulatorState {
    manifests: Vec<ManifestDocument>,
    query_error: Option<String>,
    report_script: VecDeque<Result<String, RegulatorError>>,
    exception_script: VecDeque<Result<String, RegulatorError>>,
    annul_script: VecDeque<Result<String, RegulatorError>>,
    queries: Vec<QueryMode>,
    single_queries: Vec<String>,
    reports: Vec<ReportSubmission>,
    exceptions: Vec<ExceptionSubmission>,
    annulments: Vec<AnnulSubmission>,
    issued: u64,
}

impl RegulatorState {
    fn next(&mut self, which: Script) -> Result<String, RegulatorError> {
        let script = match which {
            Script::Report => &mut self.report_script,
            Script::Exception => &mut self.exception_script,
            Script::Annul => &mut self.annul_script,
        };
        if let Some(scripted) = script.pop_front() {
            return scripted;
        }
        self.issued += 1;
        Ok(format!("{}", 100_000 + self.issued))
    }
}

#[derive(Clone, Copy)]
enum Script {
    Report,
    Exception,
    Annul,
}

/// Scripted regulator.
///
/// Unscripted submissions are accepted with sequential confirmation ids.
#[derive(Debug, Clone, Default)]
pub struct MockRegulatorGateway {
    state: Arc<Mutex<RegulatorState>>,
}

impl MockRegulatorGateway {
    /// Regulator with no manifests that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Manifests returned by queries.
    pub async fn set_manifests(&self, manifests: Vec<ManifestDocument>) {
        self.state.lock().await.manifests = manifests;
    }

    /// Make manifest queries fail with a rejection, or succeed again with `None`.
    pub async fn fail_queries(&self, message: Option<&str>) {
        self.state.lock().await.query_error = message.map(str::to_string);
    }

    /// Queue the outcome of the next report submission.
    pub async fn script_report(&self, outcome: Result<String, RegulatorError>) {
        self.state.lock().await.report_script.push_back(outcome);
    }

    /// Queue the outcome of the next exception submission.
    pub async fn script_exception(&self, outcome: Result<String, RegulatorError>) {
        self.state.lock().await.exception_script.push_back(outcome);
    }

    /// Queue the outcome of the next annulment.
    pub async fn script_annul(&self, outcome: Result<String, RegulatorError>) {
        self.state.lock().await.annul_script.push_back(outcome);
    }

    /// Shorthand for a business rejection.
    pub fn rejection(message: &str) -> RegulatorError {
        RegulatorError::Decode(DecodeError::Rejected(message.to_string()))
    }

    /// Modes of bulk queries received.
    pub async fn queries(&self) -> Vec<QueryMode> {
        self.state.lock().await.queries.clone()
    }

    /// Ids of single-manifest queries received.
    pub async fn single_queries(&self) -> Vec<String> {
        self.state.lock().await.single_queries.clone()
    }

    /// Report submissions received.
    pub async fn reports(&self) -> Vec<ReportSubmission> {
        self.state.lock().await.reports.clone()
    }

    /// Exception submissions received.
    pub async fn exceptions(&self) -> Vec<ExceptionSubmission> {
        self.state.lock().await.exceptions.clone()
    }

    /// Annulments received.
    pub async fn annulments(&self) -> Vec<AnnulSubmission> {
        self.state.lock().await.annulments.clone()
    }
}

#[async_trait]
impl RegulatorGateway for MockRegulatorGateway {
    async fn query_manifests(
        &self,
        mode: QueryMode,
    ) -> Result<Vec<ManifestDocument>, RegulatorError> {
        let mut state = self.state.lock().await;
        state.queries.push(mode);
        if let Some(message) = &state.query_error {
            return Err(Self::rejection(message));
        }
        Ok(state.manifests.clone())
    }

    async fn query_manifest(
        &self,
        external_id: &str,
    ) -> Result<Option<ManifestDocument>, RegulatorError> {
        let mut state = self.state.lock().await;
        state.single_queries.push(external_id.to_string());
        if let Some(message) = &state.query_error {
            return Err(Self::rejection(message));
        }
        Ok(state
            .manifests
            .iter()
            .find(|m| m.external_id == external_id)
            .cloned())
    }

    async fn submit_report(&self, submission: &ReportSubmission) -> Result<String, RegulatorError> {
        let mut state = self.state.lock().await;
        state.reports.push(submission.clone());
        state.next(Script::Report)
    }

    async fn submit_exception(
        &self,
        submission: &ExceptionSubmission,
    ) -> Result<String, RegulatorError> {
        let mut state = self.state.lock().await;
        state.exceptions.push(submission.clone());
        state.next(Script::Exception)
    }

    async fn annul_report(&self, submission: &AnnulSubmission) -> Result<String, RegulatorError> {
        let mut state = self.state.lock().await;
        state.annulments.push(submission.clone());
        state.next(Script::Annul)
    }
}
