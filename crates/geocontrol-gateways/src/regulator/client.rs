// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP client for the regulator's SOAP endpoint.
//!
//! Every call is written to the interaction log, whatever its outcome. A
//! failure to write the log entry is reported and otherwise ignored.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use geocontrol_core::{InteractionKind, InteractionOutcome, InteractionSink, RegulatorInteraction};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE as CONTENT_TYPE_HEADER;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::RegulatorGateway;
use super::datetime::RegulatorClock;
use super::decode::{Reply, decode};
use super::envelope::{CONTENT_TYPE, MessageBuilder, SOAP_ACTION, soap_envelope};
use super::payload::{
    AnnulSubmission, ExceptionSubmission, ManifestDocument, QueryMode, ReportSubmission,
};
use crate::error::RegulatorError;
use crate::retry::RetryPolicy;
use crate::session::Credentials;

/// Public production endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://rndcws.mintransporte.gov.co:8080/soap/IBPMServices";

/// Shortest timeout the client accepts; the regulator is slow.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Regulator client configuration.
#[derive(Debug, Clone)]
pub struct RegulatorConfig {
    /// SOAP endpoint URL.
    pub endpoint: String,
    /// Account credentials.
    pub credentials: Credentials,
    /// GPS provider id sent with every request.
    pub gps_id: String,
    /// Per-request timeout; raised to [`MIN_TIMEOUT`] if lower.
    pub timeout: Duration,
    /// Local time conventions.
    pub clock: RegulatorClock,
    /// Transport retries.
    pub retry: RetryPolicy,
}

impl RegulatorConfig {
    /// Configuration for the production endpoint with default settings.
    pub fn new(credentials: Credentials, gps_id: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            credentials,
            gps_id: gps_id.into(),
            timeout: MIN_TIMEOUT,
            clock: RegulatorClock::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Effective timeout.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.max(MIN_TIMEOUT)
    }
}

/// Regulator client over HTTP.
pub struct RegulatorClient {
    http: Client,
    endpoint: String,
    messages: MessageBuilder,
    clock: RegulatorClock,
    retry: RetryPolicy,
    sink: Arc<dyn InteractionSink>,
}

impl std::fmt::Debug for RegulatorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegulatorClient")
            .field("endpoint", &self.endpoint)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

struct Exchange {
    outcome: InteractionOutcome,
    status: Option<u16>,
    response: Option<String>,
    result: Result<Reply, RegulatorError>,
}

impl Exchange {
    fn failed(err: RegulatorError, status: Option<u16>) -> Self {
        let outcome = if err.is_timeout() {
            InteractionOutcome::Timeout
        } else {
            InteractionOutcome::Error
        };
        Self {
            outcome,
            status,
            response: None,
            result: Err(err),
        }
    }
}

impl RegulatorClient {
    /// Build a client recording interactions into `sink`.
    pub fn new(
        config: RegulatorConfig,
        sink: Arc<dyn InteractionSink>,
    ) -> Result<Self, RegulatorError> {
        let http = Client::builder()
            .timeout(config.effective_timeout())
            .build()
            .map_err(RegulatorError::Client)?;

        Ok(Self {
            http,
            endpoint: config.endpoint,
            messages: MessageBuilder::new(config.credentials, config.gps_id, config.clock),
            clock: config.clock,
            retry: config.retry,
            sink,
        })
    }

    /// Send one message and record the interaction.
    async fn call(
        &self,
        kind: InteractionKind,
        message: String,
        mut metadata: Value,
    ) -> Result<Reply, RegulatorError> {
        let envelope = soap_envelope(&message);
        let started = Instant::now();
        let occurred_at = Utc::now();

        debug!(kind = kind.as_str(), endpoint = %self.endpoint, "Calling regulator");
        let exchange = self.exchange(&envelope).await;
        let duration = started.elapsed();

        if let (Some(status), Some(map)) = (exchange.status, metadata.as_object_mut()) {
            map.insert("http_status".to_string(), json!(status));
        }

        let interaction = RegulatorInteraction {
            id: Uuid::new_v4(),
            occurred_at,
            kind,
            endpoint: self.endpoint.clone(),
            outcome: exchange.outcome,
            duration_ms: i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
            request_payload: envelope,
            response_payload: exchange.response,
            metadata,
        };
        if let Err(e) = self.sink.record(&interaction).await {
            error!(kind = kind.as_str(), error = %e, "Failed to record regulator interaction");
        }

        match &exchange.result {
            Ok(_) => info!(
                kind = kind.as_str(),
                duration_ms = interaction.duration_ms,
                "Regulator call succeeded"
            ),
            Err(e) => warn!(
                kind = kind.as_str(),
                duration_ms = interaction.duration_ms,
                error = %e,
                "Regulator call failed"
            ),
        }

        exchange.result
    }

    async fn exchange(&self, envelope: &str) -> Exchange {
        let sent = self
            .retry
            .send("regulator", || {
                self.http
                    .post(&self.endpoint)
                    .header(CONTENT_TYPE_HEADER, CONTENT_TYPE)
                    .header("SOAPAction", SOAP_ACTION)
                    .body(envelope.to_string())
            })
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) => return Exchange::failed(e.into(), None),
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Exchange::failed(e.into(), Some(status)),
        };

        // Faults arrive with 500; the body is decoded regardless of status.
        let result = decode(&body, &self.clock).map_err(RegulatorError::from);
        Exchange {
            outcome: if result.is_ok() {
                InteractionOutcome::Success
            } else {
                InteractionOutcome::Error
            },
            status: Some(status),
            response: Some(body),
            result,
        }
    }
}

fn confirmation(reply: Reply) -> Result<String, RegulatorError> {
    match reply {
        Reply::Confirmation(id) => Ok(id),
        other => Err(RegulatorError::UnexpectedReply(format!(
            "expected a confirmation id, got {other:?}"
        ))),
    }
}

fn manifests(reply: Reply) -> Result<Vec<ManifestDocument>, RegulatorError> {
    match reply {
        Reply::Manifests(manifests) => Ok(manifests),
        Reply::Data => Ok(Vec::new()),
        Reply::Confirmation(id) => Err(RegulatorError::UnexpectedReply(format!(
            "expected manifests, got confirmation {id}"
        ))),
    }
}

#[async_trait]
impl RegulatorGateway for RegulatorClient {
    async fn query_manifests(
        &self,
        mode: QueryMode,
    ) -> Result<Vec<ManifestDocument>, RegulatorError> {
        let reply = self
            .call(
                InteractionKind::QueryManifests,
                self.messages.query_manifests(mode),
                json!({ "mode": mode.as_str() }),
            )
            .await?;
        manifests(reply)
    }

    async fn query_manifest(
        &self,
        external_id: &str,
    ) -> Result<Option<ManifestDocument>, RegulatorError> {
        let reply = self
            .call(
                InteractionKind::QueryManifest,
                self.messages.query_manifest(external_id),
                json!({ "manifest": external_id }),
            )
            .await?;
        Ok(manifests(reply)?
            .into_iter()
            .find(|m| m.external_id == external_id))
    }

    async fn submit_report(&self, submission: &ReportSubmission) -> Result<String, RegulatorError> {
        let reply = self
            .call(
                InteractionKind::SubmitReport,
                self.messages.report(submission),
                json!({
                    "manifest": submission.manifest_external_id,
                    "plate": submission.plate,
                    "point_code": submission.point_code,
                }),
            )
            .await?;
        confirmation(reply)
    }

    async fn submit_exception(
        &self,
        submission: &ExceptionSubmission,
    ) -> Result<String, RegulatorError> {
        let reply = self
            .call(
                InteractionKind::SubmitException,
                self.messages.exception(submission),
                json!({
                    "manifest": submission.manifest_external_id,
                    "plate": submission.plate,
                    "point_code": submission.point_code,
                    "exception_code": submission.code.code(),
                }),
            )
            .await?;
        confirmation(reply)
    }

    async fn annul_report(&self, submission: &AnnulSubmission) -> Result<String, RegulatorError> {
        let reply = self
            .call(
                InteractionKind::AnnulReport,
                self.messages.annul(submission),
                json!({
                    "manifest": submission.manifest_external_id,
                    "plate": submission.plate,
                    "point_code": submission.point_code,
                    "confirmation_id": submission.confirmation_id,
                }),
            )
            .await?;
        confirmation(reply)
    }
}
