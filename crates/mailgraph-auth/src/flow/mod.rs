//! Token endpoint calls: device authorization, device-code polling and
//! refresh, all behind a bounded transport retry.

mod device;

pub use device::{DeviceCodeSession, PollOutcome};
pub(crate) use device::DeviceCodeExchange;

use std::sync::Arc;

use tokio::time::Instant;
use url::Url;

use crate::config::{AuthSettings, ClientConfig};
use crate::error::{Error, Result};
use crate::token::{ErrorResponse, TokenResponse, TokenState};
use crate::transport::{HttpReply, Transport, TransportError};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Longest slice of an unparseable body kept in error messages.
const BODY_EXCERPT: usize = 200;

/// A token endpoint answer after JSON decoding.
#[derive(Debug)]
pub(crate) enum TokenReply {
    Issued(TokenResponse),
    Rejected(ErrorResponse),
}

/// Endpoint client for one configuration.
#[derive(Debug, Clone)]
pub(crate) struct Endpoints {
    config: Arc<ClientConfig>,
    settings: Arc<AuthSettings>,
    transport: Arc<dyn Transport>,
}

impl Endpoints {
    pub(crate) const fn new(
        config: Arc<ClientConfig>,
        settings: Arc<AuthSettings>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            settings,
            transport,
        }
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    /// Requests a device code and user code.
    pub(crate) async fn request_device_code(&self) -> Result<DeviceCodeSession> {
        let scope = self.config.scope_param();
        let form = [
            ("client_id", self.config.client_id()),
            ("scope", scope.as_str()),
        ];
        let reply = self.post(self.config.device_code_url(), &form, None).await?;

        if !reply.is_success() {
            return Err(rejection(&reply));
        }
        let body = serde_json::from_str(&reply.body)
            .map_err(|e| Error::InvalidResponse(format!("device code response: {e}")))?;
        Ok(DeviceCodeSession::from_response(body, &self.settings))
    }

    /// Polls the token endpoint once for `device_code`. Retries stop at
    /// `deadline`.
    pub(crate) async fn poll_device_code(
        &self,
        device_code: &str,
        deadline: Instant,
    ) -> Result<PollOutcome> {
        let form = [
            ("grant_type", DEVICE_CODE_GRANT),
            ("client_id", self.config.client_id()),
            ("device_code", device_code),
        ];
        let reply = self.post(self.config.token_url(), &form, Some(deadline)).await?;
        PollOutcome::from_reply(decode_token_reply(&reply)?)
    }

    /// Redeems a refresh token.
    pub(crate) async fn refresh(&self, refresh_token: &str) -> Result<TokenState> {
        let scope = self.config.scope_param();
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id()),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];
        let reply = self.post(self.config.token_url(), &form, None).await?;
        match decode_token_reply(&reply)? {
            TokenReply::Issued(response) => Ok(TokenState::from_response(response)),
            TokenReply::Rejected(error) => Err(error.into_error()),
        }
    }

    /// POSTs `form`, retrying transient transport failures with linear
    /// backoff up to the configured bound. No retry starts at or past
    /// `deadline`.
    async fn post(
        &self,
        url: &Url,
        form: &[(&str, &str)],
        deadline: Option<Instant>,
    ) -> Result<HttpReply> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let failure = match self.transport.post_form(url, form).await {
                Ok(reply) if is_transient_status(&reply) => TransportError::transient(format!(
                    "HTTP {} from {}",
                    reply.status,
                    url.path()
                )),
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };

            if !failure.transient || attempt >= max_attempts {
                return Err(Error::Network {
                    attempts: attempt,
                    message: failure.message,
                });
            }

            let backoff = self.settings.retry_backoff * attempt;
            tracing::warn!(
                attempt,
                max_attempts,
                path = url.path(),
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "Transport failure, retrying: {}",
                failure.message
            );
            let wake = Instant::now().checked_add(backoff);
            match (wake, deadline) {
                (Some(wake), Some(deadline)) => tokio::time::sleep_until(wake.min(deadline)).await,
                (Some(wake), None) => tokio::time::sleep_until(wake).await,
                (None, Some(deadline)) => tokio::time::sleep_until(deadline).await,
                (None, None) => tokio::time::sleep(backoff).await,
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(Error::Network {
                    attempts: attempt,
                    message: failure.message,
                });
            }
        }
    }
}

/// 5xx replies without an `OAuth2` error body are gateway noise worth retrying.
fn is_transient_status(reply: &HttpReply) -> bool {
    reply.status >= 500 && serde_json::from_str::<ErrorResponse>(&reply.body).is_err()
}

/// Decodes a token endpoint reply. Error bodies are honored on any status,
/// since some servers answer `200` with an `error` field.
pub(crate) fn decode_token_reply(reply: &HttpReply) -> Result<TokenReply> {
    if reply.is_success() {
        if let Ok(response) = serde_json::from_str::<TokenResponse>(&reply.body) {
            return Ok(TokenReply::Issued(response));
        }
    }
    if let Ok(error) = serde_json::from_str::<ErrorResponse>(&reply.body) {
        return Ok(TokenReply::Rejected(error));
    }
    if reply.is_success() {
        return Err(Error::InvalidResponse(format!(
            "unrecognized token response: {}",
            excerpt(&reply.body)
        )));
    }
    Err(rejection(reply))
}

fn rejection(reply: &HttpReply) -> Error {
    serde_json::from_str::<ErrorResponse>(&reply.body).map_or_else(
        |_| Error::protocol(format!("http_{}", reply.status), excerpt(&reply.body)),
        ErrorResponse::into_error,
    )
}

fn excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT).collect()
}
