// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Geocontrol Gateways - external system clients
//!
//! Two collaborators sit behind traits so the jobs can run against real
//! services or the in-process [`mock`] implementations:
//!
//! - [`PositionGateway`]: the telemetry platform's REST API. Bearer tokens
//!   are held by a [`TokenSession`] that refreshes on demand and lets
//!   concurrent callers share one login.
//! - [`RegulatorGateway`]: the freight-manifest regulator's SOAP endpoint.
//!   Requests are XML messages inside a SOAP envelope; responses go through
//!   a structured decoder with a pattern-matching fallback for replies the
//!   regulator sends malformed. Every call is recorded through an
//!   [`InteractionSink`](geocontrol_core::InteractionSink).
//!
//! Both clients retry transport failures and 5xx responses with
//! exponential backoff ([`RetryPolicy`]). That retry is independent of the
//! per-record attempt budget enforced by the dispatchers.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use geocontrol_core::{StoreInteractionSink, store};
//! use geocontrol_gateways::{Credentials, RegulatorClient, RegulatorConfig, RegulatorGateway, QueryMode};
//!
//! let store = store::connect("sqlite::memory:").await?;
//! let config = RegulatorConfig::new(Credentials::new("user", "secret"), "8600123");
//! let regulator = RegulatorClient::new(config, Arc::new(StoreInteractionSink::new(store)))?;
//! let manifests = regulator.query_manifests(QueryMode::New).await?;
//! ```

#![deny(missing_docs)]

/// Error types.
pub mod error;
/// In-process gateways for tests.
pub mod mock;
/// Telemetry platform client.
pub mod position;
/// Regulator client, message building and response decoding.
pub mod regulator;
/// Transport retry policy.
pub mod retry;
/// Bearer-token session.
pub mod session;

pub use error::{DecodeError, PositionError, RegulatorError, SessionError};
pub use mock::{MockPositionGateway, MockRegulatorGateway};
pub use position::{
    AuthorizedVehicle, Enrollment, Position, PositionGateway, TelemetryClient, TelemetryConfig,
    VehicleDetail,
};
pub use regulator::{
    AnnulSubmission, ControlPointDocument, ExceptionSubmission, ManifestDocument, QueryMode,
    RegulatorClient, RegulatorClock, RegulatorConfig, RegulatorGateway, ReportSubmission,
};
pub use retry::RetryPolicy;
pub use session::{Credentials, TokenSession};
