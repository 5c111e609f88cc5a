// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bearer-token session for the telemetry platform.
//!
//! The token lives behind an async mutex that is held across the login
//! request, so concurrent callers wait for one in-flight refresh instead of
//! each logging in.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SessionError;

/// Lifetime assumed when the login response carries no `expires_in`.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Tokens are refreshed this long before they expire.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Username and password.
#[derive(Clone, Serialize)]
pub struct Credentials {
    /// Login name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Build from parts.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: Option<String>,
    access_token: Option<String>,
    jwt: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// A cached bearer token for one account.
#[derive(Debug)]
pub struct TokenSession {
    http: Client,
    login_url: String,
    credentials: Credentials,
    label: &'static str,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSession {
    /// Session logging in at `{base_url}/api/login_check`.
    pub fn new(
        http: Client,
        base_url: &str,
        credentials: Credentials,
        label: &'static str,
    ) -> Self {
        Self {
            http,
            login_url: format!("{}/api/login_check", base_url.trim_end_matches('/')),
            credentials,
            label,
            cached: Mutex::new(None),
        }
    }

    /// A valid token, logging in if none is cached or it is about to expire.
    pub async fn token(&self) -> Result<String, SessionError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref()
            && Instant::now() + REFRESH_MARGIN < token.expires_at
        {
            return Ok(token.value.clone());
        }

        let fresh = self.login().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    /// Drop the cached token if it is still `stale`.
    ///
    /// A token refreshed by another caller in the meantime is kept.
    pub async fn invalidate(&self, stale: &str) {
        let mut cached = self.cached.lock().await;
        if cached.as_ref().is_some_and(|t| t.value == stale) {
            debug!(session = self.label, "Invalidating rejected token");
            *cached = None;
        }
    }

    async fn login(&self) -> Result<CachedToken, SessionError> {
        info!(session = self.label, "Authenticating with telemetry platform");

        let response = self
            .http
            .post(&self.login_url)
            .json(&self.credentials)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(session = self.label, status = %status, "Telemetry login rejected");
            return Err(SessionError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: LoginResponse = response.json().await?;
        let value = body
            .token
            .or(body.access_token)
            .or(body.jwt)
            .filter(|t| !t.is_empty())
            .ok_or(SessionError::MissingToken)?;
        let ttl = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_TTL);

        debug!(session = self.label, ttl_secs = ttl.as_secs(), "Token acquired");

        Ok(CachedToken {
            value,
            expires_at: Instant::now() + ttl,
        })
    }
}
