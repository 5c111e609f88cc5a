// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Geocontrol Core - domain model and persistence
//!
//! This crate holds everything the geocontrol pipeline shares: manifests and
//! their control points, arrival/departure reports, exception reports, the
//! regulator interaction log and the store that persists them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │  Telemetry platform  │        │      Regulator       │
//! │  (positions, plates) │        │  (manifests, RMM)    │
//! └──────────────────────┘        └──────────────────────┘
//!            ▲                               ▲
//!            │   geocontrol-gateways         │
//!            └───────────────┬───────────────┘
//!                            │
//!                 ┌──────────────────────┐
//!                 │  geocontrol-worker   │
//!                 │  sync, monitor,      │
//!                 │  dispatch, exceptions│
//!                 └──────────────────────┘
//!                            │
//!                            ▼
//!                 ┌──────────────────────┐
//!                 │   geocontrol-core    │
//!                 │  (this crate) Store  │
//!                 └──────────────────────┘
//! ```
//!
//! # Lifecycles
//!
//! | Entity | States |
//! |--------|--------|
//! | Control point | `pending` → `at_point` → `completed` |
//! | Manifest | `active`, `completed`, `annulled` |
//! | Report / exception report | `pending` → `sending` → `reported`, with `error`, `overdue`, `annulled`, `superseded` |
//!
//! # Time windows
//!
//! | Window | Value |
//! |--------|-------|
//! | Monitoring | appointment - 2h .. appointment + 24h |
//! | Report deadline | arrival + 72h |
//! | No-departure flag | 72h dwell inside the geofence |
//! | Exception window | appointment + 24h ..= appointment + 36h |
//! | Attempts per record | 3 |
//!
//! # Backends
//!
//! [`store::connect`] picks a backend from the URL scheme: `sqlite:` or
//! `postgres://`. Migrations are embedded and applied on connect.

#![deny(missing_docs)]

/// Regulator interaction audit records.
pub mod audit;
/// Error types.
pub mod error;
/// Distances and geofences.
pub mod geo;
/// Embedded migrations.
pub mod migrations;
/// Manifests, control points, reports and exception reports.
pub mod model;
/// Deadlines and windows.
pub mod schedule;
/// Lifecycle state machines.
pub mod state;
/// Dashboard counters.
pub mod stats;
/// Persistence interface and backends.
pub mod store;

pub use audit::{
    InteractionFilter, InteractionKind, InteractionOutcome, InteractionSink, RegulatorInteraction,
    StoreInteractionSink,
};
pub use error::{ModelError, Result, StoreError};
pub use geo::{GeoPoint, Geofence};
pub use model::{
    ControlPoint, Departure, DepartureOutcome, ExceptionCode, ExceptionReport, Fix, Manifest,
    NotMonitorableReason, ReasonKind, Report, ResyncStatePolicy,
};
pub use state::{ControlPointState, ManifestState, SubmissionState};
pub use stats::{ManifestCounts, Page, PlateCounts, StateCounts};
pub use store::{PostgresStore, SqliteStore, Store, SubmissionOutcome, UpsertOutcome};
