//! Token types: the cached token state and the copies handed to callers.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Error;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

/// Upper bound on any advertised lifetime.
const MAX_LIFETIME: Duration = Duration::from_secs(365 * 24 * 3600);

/// Bearer token copied out of the authenticator's cache.
///
/// The secret is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    token_type: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Raw token string.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Token type as issued (usually `Bearer`).
    #[must_use]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Wall-clock expiry.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Value for an `Authorization` header.
    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.secret)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token held by the authenticator between calls.
#[derive(Clone)]
pub(crate) struct TokenState {
    access_token: String,
    token_type: String,
    expires_at: Instant,
    expires_at_utc: DateTime<Utc>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

impl TokenState {
    /// Builds state from a token endpoint response received just now.
    pub(crate) fn from_response(response: TokenResponse) -> Self {
        let lifetime = response
            .expires_in
            .map_or(DEFAULT_LIFETIME, Duration::from_secs)
            .min(MAX_LIFETIME);
        let expires_at_utc = chrono::Duration::from_std(lifetime)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at: Instant::now() + lifetime,
            expires_at_utc,
            refresh_token: response.refresh_token,
            scope: response.scope,
        }
    }

    /// Keeps the previous refresh token when a refresh response omits one.
    #[must_use]
    pub(crate) fn inherit_refresh_token(mut self, previous: &Self) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token.clone_from(&previous.refresh_token);
        }
        self
    }

    /// Returns true if the token stays valid for at least `margin`.
    pub(crate) fn is_valid_for(&self, margin: Duration) -> bool {
        self.expires_at
            .checked_duration_since(Instant::now())
            .is_some_and(|left| left >= margin)
    }

    pub(crate) fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub(crate) fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub(crate) fn to_access_token(&self) -> AccessToken {
        AccessToken {
            secret: self.access_token.clone(),
            token_type: self.token_type.clone(),
            expires_at: self.expires_at_utc,
        }
    }
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenState")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at_utc)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Successful token endpoint response.
#[derive(Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Token type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Expires in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Granted scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Error response from the token or device-code endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    /// Error code.
    pub error: String,
    /// Error description.
    #[serde(default)]
    pub error_description: String,
}

impl ErrorResponse {
    /// Converts to a protocol error.
    #[must_use]
    pub fn into_error(self) -> Error {
        Error::protocol(self.error, self.error_description)
    }
}
