// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for geocontrol-core.

use thiserror::Error;

/// Result type using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying embedded migrations failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A uniqueness constraint rejected the write.
    #[error("Conflict on {entity}: {details}")]
    Conflict {
        /// Table or entity that rejected the write.
        entity: &'static str,
        /// Database message.
        details: String,
    },

    /// A stored row could not be mapped back to the domain model.
    #[error("Corrupt {entity} row: {details}")]
    Corrupt {
        /// Table or entity the row belongs to.
        entity: &'static str,
        /// What failed to map.
        details: String,
    },

    /// The database URL scheme is not supported.
    #[error("Unsupported database url: {0}")]
    UnsupportedUrl(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Map an insert error, turning unique violations into [`StoreError::Conflict`].
    pub(crate) fn on_insert(entity: &'static str, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict {
                entity,
                details: db.message().to_string(),
            },
            other => StoreError::Database(other),
        }
    }

    pub(crate) fn corrupt(entity: &'static str, details: impl Into<String>) -> Self {
        StoreError::Corrupt {
            entity,
            details: details.into(),
        }
    }

    /// Whether this error is a uniqueness conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Domain rule violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// A state change that the entity's state machine does not allow.
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        /// Entity kind (control point, report, exception report, manifest).
        entity: &'static str,
        /// Current state.
        from: &'static str,
        /// Requested state.
        to: &'static str,
    },

    /// A stored tag does not name a known variant.
    #[error("Unknown {kind}: {value}")]
    UnknownTag {
        /// Enum being parsed.
        kind: &'static str,
        /// Offending value.
        value: String,
    },

    /// The record's submission deadline has already passed.
    #[error("Deadline passed at {0}")]
    DeadlinePassed(chrono::DateTime<chrono::Utc>),

    /// The operation requires data the record does not carry.
    #[error("Missing {0}")]
    Missing(&'static str),
}
