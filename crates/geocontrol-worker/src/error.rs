// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for geocontrol-worker.

use geocontrol_core::{ModelError, StoreError};
use geocontrol_gateways::{PositionError, RegulatorError};
use thiserror::Error;

/// Worker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A domain rule rejected the change.
    #[error("{0}")]
    Model(#[from] ModelError),

    /// Telemetry platform call failed.
    #[error("Position gateway error: {0}")]
    Position(#[from] PositionError),

    /// Regulator call failed.
    #[error("Regulator error: {0}")]
    Regulator(#[from] RegulatorError),

    /// The addressed record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Record kind.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The operation does not apply to the record in its current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl WorkerError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        WorkerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Result type using [`WorkerError`].
pub type Result<T> = std::result::Result<T, WorkerError>;
