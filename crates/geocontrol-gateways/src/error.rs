// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for geocontrol-gateways.

use thiserror::Error;

/// Token acquisition errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The login request could not be sent or its body not read.
    #[error("Login request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The platform refused the credentials.
    #[error("Login rejected with status {status}: {body}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The login response carried none of the known token fields.
    #[error("Login response did not contain a token")]
    MissingToken,
}

/// Telemetry platform errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PositionError {
    /// Could not obtain a token.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Transport failure after retries.
    #[error("Telemetry request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status.
    #[error("Telemetry API returned {status}: {body}")]
    Status {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The response body did not have the expected shape.
    #[error("Unexpected telemetry response: {0}")]
    Unexpected(String),

    /// The operation needs configuration that was not provided.
    #[error("Telemetry client not configured for {0}")]
    NotConfigured(&'static str),
}

/// Regulator response decoding outcomes that are not a success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// SOAP fault; carries the fault string.
    #[error("SOAP fault: {0}")]
    Fault(String),

    /// Business rejection; carries the regulator's error message.
    #[error("{0}")]
    Rejected(String),

    /// The response had no return value.
    #[error("Empty Response")]
    EmptyResponse,

    /// The response could not be parsed and no error message could be salvaged.
    #[error("Parsing error: {0}")]
    Malformed(String),
}

/// Regulator gateway errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegulatorError {
    /// The request timed out after retries.
    #[error("Regulator request timed out")]
    Timeout,

    /// Transport failure after retries.
    #[error("Regulator request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// The response decoded to a fault, rejection or parse failure.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The response decoded, but not to the shape this operation expects.
    #[error("Unexpected regulator reply: {0}")]
    UnexpectedReply(String),

    /// The HTTP client could not be built.
    #[error("Failed to build regulator client: {0}")]
    Client(#[source] reqwest::Error),
}

impl From<reqwest::Error> for RegulatorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RegulatorError::Timeout
        } else {
            RegulatorError::Transport(err)
        }
    }
}

impl RegulatorError {
    /// Whether the failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RegulatorError::Timeout)
    }
}
