// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Geocontrol Worker - manifest monitoring and regulator reporting
//!
//! This crate runs the background jobs that keep the regulator informed of
//! every vehicle visit to a manifest's control points.
//!
//! # Jobs
//!
//! ```text
//!   Regulator ──manifests──▶ ManifestSynchronizer ──▶ ┌─────────┐
//!                                                      │         │
//!   Telemetry ──positions──▶ GeofenceMonitor ────────▶ │  Store  │
//!                                                      │         │
//!   Regulator ◀──reports─── ReportDispatcher ◀──────── │         │
//!                                                      │         │
//!                           ExceptionDetector ───────▶ │         │
//!   Regulator ◀─exceptions─ ExceptionDispatcher ◀───── │         │
//!                                                      │         │
//!                           AuditRetention ──purge───▶ └─────────┘
//! ```
//!
//! | Job | Default period | Work |
//! |-----|----------------|------|
//! | [`sync::ManifestSynchronizer`] | 15 min | Pull manifests, classify vehicles, merge control points |
//! | [`monitor::GeofenceMonitor`] | 1 min | Detect arrivals/departures, queue reports |
//! | [`dispatcher::ReportDispatcher`] | 30 s | Submit reports within 72h of arrival |
//! | [`exception_detector::ExceptionDetector`] | 1 h | Queue exception reports for missed points |
//! | [`exception_dispatcher::ExceptionDispatcher`] | 15 min | Submit exception reports 24-36h after the appointment |
//! | [`audit_retention::AuditRetention`] | 1 h | Purge old regulator interactions |
//!
//! Each job skips a tick while its previous cycle is still running, logs a
//! failed cycle and carries on with the next one.
//!
//! # Embedding
//!
//! [`runtime::GeocontrolRuntime`] spawns all jobs on the caller's tokio
//! runtime and hands out [`operations::Operations`] for operator actions.
//! The `geocontrol-worker` binary does the same from environment
//! configuration (see [`config`]).

#![deny(missing_docs)]

/// Background job that purges the regulator interaction log.
pub mod audit_retention;

/// Configuration loaded from environment variables.
pub mod config;

/// Arrival/departure report submission.
pub mod dispatcher;

/// Error types for worker operations.
pub mod error;

/// Exception report creation for missed control points.
pub mod exception_detector;

/// Exception report submission.
pub mod exception_dispatcher;

/// Non-reentrant job guard.
pub mod guard;

/// Position polling and geofence evaluation.
pub mod monitor;

/// Operator actions and read access.
pub mod operations;

/// Embeddable runtime spawning every job.
pub mod runtime;

/// Manifest synchronization from the regulator.
pub mod sync;

pub use config::{Config, ConfigError, LogFormat};
pub use error::{Result, WorkerError};
pub use operations::Operations;
pub use runtime::GeocontrolRuntime;
