// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport-level retry with exponential backoff.
//!
//! Nested inside, and independent of, the per-record attempt budget kept by
//! the dispatchers.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::warn;

/// Retry policy for one HTTP exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }

    /// 408, 429 and 5xx.
    pub fn is_transient_status(status: StatusCode) -> bool {
        status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
    }

    /// Timeouts, connection failures and dropped connections.
    pub fn is_transient_error(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect() || err.is_request()
    }

    /// Send the request produced by `build`, retrying transient failures.
    ///
    /// The last response is returned even when its status is transient, so
    /// callers can still read the body.
    pub async fn send<F>(&self, target: &str, build: F) -> Result<Response, reqwest::Error>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retry = 0;
        loop {
            match build().send().await {
                Ok(response)
                    if retry < self.max_retries
                        && Self::is_transient_status(response.status()) =>
                {
                    retry += 1;
                    warn!(
                        target_service = target,
                        status = %response.status(),
                        retry,
                        max_retries = self.max_retries,
                        "Retrying request after transient status"
                    );
                }
                Err(e) if retry < self.max_retries && Self::is_transient_error(&e) => {
                    retry += 1;
                    warn!(
                        target_service = target,
                        error = %e,
                        retry,
                        max_retries = self.max_retries,
                        "Retrying request after transport error"
                    );
                }
                other => return other,
            }
            tokio::time::sleep(self.delay(retry)).await;
        }
    }
}
