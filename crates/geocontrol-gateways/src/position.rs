// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Telemetry platform gateway.
//!
//! | Operation | Endpoint | Session |
//! |-----------|----------|---------|
//! | [`PositionGateway::list_authorized_vehicles`] | `GET /cellvi/movil/v3/vehiculos/usuario` | monitoring |
//! | [`PositionGateway::vehicle_detail_by_plate`] | `GET /cellvi/vehiculo/filter/{plate}/list` | admin, else monitoring |
//! | [`PositionGateway::last_position`] | `GET /cellvi/vehiculo/v2/{id}/get_last_position` | monitoring |
//! | [`PositionGateway::authorize_vehicle`] | `POST /seguridad/usuario/update_vehiculos` | admin |
//!
//! A 401 drops the cached token and the request is sent once more with a
//! fresh one.

use std::time::Duration;

use async_trait::async_trait;
use geocontrol_core::GeoPoint;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::PositionError;
use crate::retry::RetryPolicy;
use crate::session::{Credentials, TokenSession};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45);

/// A vehicle on the monitoring account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedVehicle {
    /// Platform vehicle id.
    pub id: i64,
    /// Upper-cased plate.
    pub plate: String,
}

/// Platform-wide vehicle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleDetail {
    /// Platform vehicle id.
    pub id: i64,
    /// Upper-cased plate.
    pub plate: String,
    /// Whether the platform actively tracks the vehicle.
    pub monitored: bool,
}

/// Last known position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Device timestamp as reported by the platform.
    pub reported_at: Option<String>,
    /// Speed in km/h.
    pub speed: Option<f64>,
}

impl Position {
    /// Coordinates as a [`GeoPoint`].
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Result of an enrollment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enrollment {
    /// The vehicle was added to the monitoring account.
    Enrolled,
    /// The vehicle was already on the monitoring account.
    AlreadyEnrolled,
}

/// Operations the pipeline needs from the telemetry platform.
#[async_trait]
pub trait PositionGateway: Send + Sync {
    /// Vehicles the monitoring account may track.
    async fn list_authorized_vehicles(&self) -> Result<Vec<AuthorizedVehicle>, PositionError>;

    /// Look a plate up across the whole platform.
    async fn vehicle_detail_by_plate(
        &self,
        plate: &str,
    ) -> Result<Option<VehicleDetail>, PositionError>;

    /// Last known position of a vehicle, if the platform has one.
    async fn last_position(&self, vehicle_id: i64) -> Result<Option<Position>, PositionError>;

    /// Add a vehicle to the monitoring account.
    async fn authorize_vehicle(&self, vehicle_id: i64) -> Result<Enrollment, PositionError>;
}

/// Telemetry client settings.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// API base URL.
    pub base_url: String,
    /// Monitoring-account credentials.
    pub credentials: Credentials,
    /// Admin credentials, used for global lookups and enrollment.
    pub admin_credentials: Option<Credentials>,
    /// Platform user id of the monitoring account; required for enrollment.
    pub monitoring_user_id: Option<i64>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Transport retry policy.
    pub retry: RetryPolicy,
}

impl TelemetryConfig {
    /// Settings with default timeout and retry policy and no admin account.
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            base_url: base_url.into(),
            credentials,
            admin_credentials: None,
            monitoring_user_id: None,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// REST client for the telemetry platform.
pub struct TelemetryClient {
    http: Client,
    base_url: String,
    session: TokenSession,
    admin_session: Option<TokenSession>,
    monitoring_user_id: Option<i64>,
    retry: RetryPolicy,
}

impl TelemetryClient {
    /// Build a client. No request is made until the first call.
    pub fn new(config: TelemetryConfig) -> Result<Self, PositionError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let session = TokenSession::new(http.clone(), &base_url, config.credentials, "monitoring");
        let admin_session = config
            .admin_credentials
            .map(|c| TokenSession::new(http.clone(), &base_url, c, "admin"));

        Ok(Self {
            http,
            base_url,
            session,
            admin_session,
            monitoring_user_id: config.monitoring_user_id,
            retry: config.retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// URL below the base with each segment percent-encoded.
    fn segments_url(&self, segments: &[&str]) -> Result<Url, PositionError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| PositionError::Unexpected(format!("invalid telemetry base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| PositionError::Unexpected("telemetry base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn admin(&self) -> &TokenSession {
        self.admin_session.as_ref().unwrap_or(&self.session)
    }

    async fn send<F>(&self, session: &TokenSession, build: F) -> Result<Response, PositionError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = session.token().await?;
        let response = self.retry.send("telemetry", || build(&token)).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("Telemetry token rejected, re-authenticating");
        session.invalidate(&token).await;
        let token = session.token().await?;
        Ok(self.retry.send("telemetry", || build(&token)).await?)
    }

    async fn get(&self, session: &TokenSession, path: &str) -> Result<Response, PositionError> {
        self.fetch(session, self.url(path)).await
    }

    async fn fetch(&self, session: &TokenSession, url: String) -> Result<Response, PositionError> {
        self.send(session, |token| self.http.get(&url).bearer_auth(token))
            .await
    }
}

async fn ensure_success(response: Response) -> Result<Response, PositionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PositionError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Number carried either as a JSON number or a numeric string.
fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn integer(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "s" | "si"
        ),
        _ => false,
    }
}

/// The vehicle list comes either bare or wrapped in `{"data": [...]}`.
fn vehicle_list(body: Value) -> Result<Vec<AuthorizedVehicle>, PositionError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(PositionError::Unexpected(
                    "vehicle list is neither an array nor {data: [...]}".into(),
                ));
            }
        },
        other => {
            return Err(PositionError::Unexpected(format!(
                "vehicle list has type {}",
                json_type(&other)
            )));
        }
    };

    Ok(items
        .iter()
        .filter_map(|item| {
            let id = integer(item.get("id").or_else(|| item.get("vehiculo_id")))?;
            let plate = item
                .get("placa")
                .or_else(|| item.get("vehiculo_placa"))?
                .as_str()?;
            Some(AuthorizedVehicle {
                id,
                plate: plate.trim().to_uppercase(),
            })
        })
        .collect())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl PositionGateway for TelemetryClient {
    async fn list_authorized_vehicles(&self) -> Result<Vec<AuthorizedVehicle>, PositionError> {
        let response = self
            .get(&self.session, "/cellvi/movil/v3/vehiculos/usuario")
            .await?;
        let body: Value = ensure_success(response).await?.json().await?;
        let vehicles = vehicle_list(body)?;
        debug!(count = vehicles.len(), "Fetched authorized vehicles");
        Ok(vehicles)
    }

    async fn vehicle_detail_by_plate(
        &self,
        plate: &str,
    ) -> Result<Option<VehicleDetail>, PositionError> {
        let plate = plate.trim().to_uppercase();
        let url = self.segments_url(&["cellvi", "vehiculo", "filter", &plate, "list"])?;
        let response = self.fetch(self.admin(), url.into()).await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(plate = %plate, "Vehicle not found on telemetry platform");
            return Ok(None);
        }

        let body: Value = ensure_success(response).await?.json().await?;
        let Some(first) = body.as_array().and_then(|items| items.first()) else {
            debug!(plate = %plate, "Vehicle not found on telemetry platform");
            return Ok(None);
        };

        let id = integer(first.get("vehiculo_id"))
            .ok_or_else(|| PositionError::Unexpected("vehicle detail without vehiculo_id".into()))?;

        Ok(Some(VehicleDetail {
            id,
            plate: first
                .get("vehiculo_placa")
                .and_then(Value::as_str)
                .map(|p| p.trim().to_uppercase())
                .unwrap_or(plate),
            monitored: truthy(first.get("vehiculo_monitoreado")),
        }))
    }

    async fn last_position(&self, vehicle_id: i64) -> Result<Option<Position>, PositionError> {
        let response = self
            .get(
                &self.session,
                &format!("/cellvi/vehiculo/v2/{vehicle_id}/get_last_position"),
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: Value = ensure_success(response).await?.json().await?;
        let (Some(latitude), Some(longitude)) =
            (number(body.get("latitud")), number(body.get("longitud")))
        else {
            debug!(vehicle_id, "No position reported for vehicle");
            return Ok(None);
        };

        Ok(Some(Position {
            latitude,
            longitude,
            reported_at: body
                .get("momento")
                .and_then(Value::as_str)
                .map(str::to_string),
            speed: number(body.get("velocidad")),
        }))
    }

    async fn authorize_vehicle(&self, vehicle_id: i64) -> Result<Enrollment, PositionError> {
        let admin = self
            .admin_session
            .as_ref()
            .ok_or(PositionError::NotConfigured("vehicle enrollment (admin credentials)"))?;
        let user_id = self
            .monitoring_user_id
            .ok_or(PositionError::NotConfigured("vehicle enrollment (monitoring user id)"))?;

        let mut ids: Vec<i64> = self
            .list_authorized_vehicles()
            .await?
            .into_iter()
            .map(|v| v.id)
            .collect();

        if ids.contains(&vehicle_id) {
            info!(vehicle_id, "Vehicle already enrolled on monitoring account");
            return Ok(Enrollment::AlreadyEnrolled);
        }
        ids.push(vehicle_id);

        let url = self.url("/seguridad/usuario/update_vehiculos");
        let body = serde_json::json!({ "id": user_id, "vehiculos": ids });
        let response = self
            .send(admin, |token| {
                self.http.post(&url).bearer_auth(token).json(&body)
            })
            .await?;
        ensure_success(response).await?;

        info!(vehicle_id, "Vehicle enrolled on monitoring account");
        Ok(Enrollment::Enrolled)
    }
}
