// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Regulator interaction audit records.
//!
//! Every call to the regulator is recorded with its raw request and response,
//! latency and outcome. Records are kept for a bounded retention window and
//! are never replayed.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ModelError, Result};
use crate::store::Store;

/// Regulator operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// Bulk manifest query (new or all).
    QueryManifests,
    /// Single manifest query by id.
    QueryManifest,
    /// Arrival/departure report.
    SubmitReport,
    /// Report annulment.
    AnnulReport,
    /// Exception report.
    SubmitException,
}

impl InteractionKind {
    /// Database tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueryManifests => "query_manifests",
            Self::QueryManifest => "query_manifest",
            Self::SubmitReport => "submit_report",
            Self::AnnulReport => "annul_report",
            Self::SubmitException => "submit_exception",
        }
    }
}

/// Outcome of a regulator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionOutcome {
    /// The regulator answered with a success reply.
    Success,
    /// Transport, HTTP or business error.
    Error,
    /// The request timed out.
    Timeout,
}

impl InteractionOutcome {
    /// Database tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for InteractionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionKind {
    type Err = ModelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        [
            Self::QueryManifests,
            Self::QueryManifest,
            Self::SubmitReport,
            Self::AnnulReport,
            Self::SubmitException,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
        .ok_or_else(|| ModelError::UnknownTag {
            kind: "interaction kind",
            value: s.to_string(),
        })
    }
}

impl FromStr for InteractionOutcome {
    type Err = ModelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            other => Err(ModelError::UnknownTag {
                kind: "interaction outcome",
                value: other.to_string(),
            }),
        }
    }
}

/// One logged regulator call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulatorInteraction {
    /// Record id.
    pub id: Uuid,
    /// When the call started.
    pub occurred_at: DateTime<Utc>,
    /// Operation.
    pub kind: InteractionKind,
    /// Target endpoint.
    pub endpoint: String,
    /// Outcome.
    pub outcome: InteractionOutcome,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
    /// Raw request body.
    pub request_payload: String,
    /// Raw response body, or the error text when no body was received.
    pub response_payload: Option<String>,
    /// Free-form context (plate, manifest id, point code).
    pub metadata: serde_json::Value,
}

/// Filter for listing interactions.
#[derive(Debug, Clone, Default)]
pub struct InteractionFilter {
    /// Only this outcome.
    pub outcome: Option<InteractionOutcome>,
    /// Only this operation.
    pub kind: Option<InteractionKind>,
    /// Page size.
    pub limit: i64,
    /// Rows to skip.
    pub offset: i64,
}

impl InteractionFilter {
    /// First page of `limit` rows, no filters.
    pub fn page(limit: i64) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

/// Destination for interaction records.
#[async_trait]
pub trait InteractionSink: Send + Sync {
    /// Persist one record.
    async fn record(&self, interaction: &RegulatorInteraction) -> Result<()>;
}

/// [`InteractionSink`] backed by a [`Store`].
#[derive(Clone)]
pub struct StoreInteractionSink {
    store: Arc<dyn Store>,
}

impl StoreInteractionSink {
    /// Wrap a store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl InteractionSink for StoreInteractionSink {
    async fn record(&self, interaction: &RegulatorInteraction) -> Result<()> {
        self.store.record_interaction(interaction).await
    }
}
