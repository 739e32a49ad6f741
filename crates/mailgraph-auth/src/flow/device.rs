//! Device Authorization Grant (RFC 8628): one exchange from device-code
//! request to issued token.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Endpoints, TokenReply};
use crate::config::AuthSettings;
use crate::error::{AuthFailure, Error, Result};
use crate::prompt::{self, DeviceCodePrompt, DevicePrompt};
use crate::token::{TokenResponse, TokenState};

/// Device codes are short-lived; anything longer is clamped.
const MAX_CODE_LIFETIME: Duration = Duration::from_secs(24 * 3600);

/// Device authorization response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DeviceAuthorization {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_url")]
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default)]
    message: Option<String>,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
}

/// One device-code attempt, from issued code to token or failure.
#[derive(Debug, Clone)]
pub struct DeviceCodeSession {
    /// Code the client polls with.
    pub device_code: String,
    /// Code the user types in.
    pub user_code: String,
    /// Verification page.
    pub verification_uri: String,
    /// Verification page with the code pre-filled.
    pub verification_uri_complete: Option<String>,
    /// Server-provided instruction text.
    pub message: Option<String>,
    /// Deadline on the runtime clock.
    pub expires_at: Instant,
    /// Wall-clock deadline, for display.
    pub expires_at_utc: DateTime<Utc>,
    /// Current polling interval.
    pub interval: Duration,
}

impl DeviceCodeSession {
    pub(crate) fn from_response(auth: DeviceAuthorization, settings: &AuthSettings) -> Self {
        let lifetime = Duration::from_secs(auth.expires_in).min(MAX_CODE_LIFETIME);
        let expires_at_utc = chrono::Duration::from_std(lifetime)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            device_code: auth.device_code,
            user_code: auth.user_code,
            verification_uri: auth.verification_uri,
            verification_uri_complete: auth.verification_uri_complete,
            message: auth.message,
            expires_at: Instant::now() + lifetime,
            expires_at_utc,
            interval: auth
                .interval
                .map_or(settings.default_interval, Duration::from_secs)
                .max(settings.min_interval),
        }
    }

    /// What the user needs to see for this session.
    #[must_use]
    pub fn prompt(&self) -> DeviceCodePrompt {
        DeviceCodePrompt {
            user_code: self.user_code.clone(),
            verification_uri: self.verification_uri.clone(),
            verification_uri_complete: self.verification_uri_complete.clone(),
            message: self.message.clone(),
            expires_at: self.expires_at_utc,
        }
    }

    /// Returns true once the device code is past its deadline.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Result of a single poll of the token endpoint.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// User has not finished signing in.
    Pending,
    /// Poll less often.
    SlowDown,
    /// Token issued.
    Issued(TokenResponse),
    /// Device code expired.
    Expired,
    /// User declined.
    Denied,
}

impl PollOutcome {
    /// Maps a decoded token reply to a poll outcome. Unknown error codes end
    /// the exchange as protocol errors.
    pub(crate) fn from_reply(reply: TokenReply) -> Result<Self> {
        match reply {
            TokenReply::Issued(response) => Ok(Self::Issued(response)),
            TokenReply::Rejected(error) => match error.error.as_str() {
                "authorization_pending" => Ok(Self::Pending),
                "slow_down" => Ok(Self::SlowDown),
                "expired_token" | "code_expired" => Ok(Self::Expired),
                "access_denied" | "authorization_declined" => Ok(Self::Denied),
                _ => Err(error.into_error()),
            },
        }
    }

    /// Interval to use after this outcome. Only `slow_down` changes it, and
    /// only upward.
    #[must_use]
    pub fn next_interval(&self, current: Duration, step: Duration) -> Duration {
        match self {
            Self::SlowDown => current.saturating_add(step),
            _ => current,
        }
    }
}

/// States of one exchange.
#[derive(Debug)]
enum ExchangeState {
    Requesting,
    Polling(DeviceCodeSession),
    Succeeded(TokenState),
    Failed(Error),
}

/// Drives one exchange through its states.
pub(crate) struct DeviceCodeExchange<'a> {
    endpoints: &'a Endpoints,
    prompt: &'a Arc<dyn DevicePrompt>,
}

impl<'a> DeviceCodeExchange<'a> {
    pub(crate) const fn new(endpoints: &'a Endpoints, prompt: &'a Arc<dyn DevicePrompt>) -> Self {
        Self { endpoints, prompt }
    }

    /// Runs from `Requesting` until a terminal state.
    pub(crate) async fn run(self) -> Result<TokenState> {
        let mut state = ExchangeState::Requesting;
        loop {
            state = match state {
                ExchangeState::Requesting => self.request().await,
                ExchangeState::Polling(session) => self.poll(session).await,
                ExchangeState::Succeeded(token) => {
                    info!(token = ?token, "Device-code sign-in completed");
                    return Ok(token);
                }
                ExchangeState::Failed(error) => {
                    warn!(%error, "Device-code exchange failed");
                    return Err(error);
                }
            };
        }
    }

    async fn request(&self) -> ExchangeState {
        match self.endpoints.request_device_code().await {
            Ok(session) => {
                info!(
                    user_code = %session.user_code,
                    verification_uri = %session.verification_uri,
                    expires_at = %session.expires_at_utc,
                    interval_secs = session.interval.as_secs(),
                    "Device code issued, waiting for user"
                );
                prompt::deliver(self.prompt, session.prompt());
                ExchangeState::Polling(session)
            }
            Err(error) => ExchangeState::Failed(error),
        }
    }

    async fn poll(&self, mut session: DeviceCodeSession) -> ExchangeState {
        let wake = Instant::now()
            .checked_add(session.interval)
            .map_or(session.expires_at, |t| t.min(session.expires_at));
        tokio::time::sleep_until(wake).await;
        if session.is_expired() {
            return ExchangeState::Failed(AuthFailure::Expired.into());
        }

        let outcome = match self
            .endpoints
            .poll_device_code(&session.device_code, session.expires_at)
            .await
        {
            Ok(outcome) => outcome,
            Err(Error::Network { .. }) if session.is_expired() => {
                return ExchangeState::Failed(AuthFailure::Expired.into());
            }
            Err(error) => return ExchangeState::Failed(error),
        };
        debug!(?outcome, "Polled token endpoint");

        session.interval =
            outcome.next_interval(session.interval, self.endpoints.settings().slow_down_step);
        match outcome {
            PollOutcome::Pending => ExchangeState::Polling(session),
            PollOutcome::SlowDown => {
                debug!(interval_secs = session.interval.as_secs(), "Server asked to slow down");
                ExchangeState::Polling(session)
            }
            PollOutcome::Issued(response) => {
                ExchangeState::Succeeded(TokenState::from_response(response))
            }
            PollOutcome::Expired => ExchangeState::Failed(AuthFailure::Expired.into()),
            PollOutcome::Denied => ExchangeState::Failed(AuthFailure::Denied.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::token::ErrorResponse;

    fn rejected(code: &str) -> TokenReply {
        TokenReply::Rejected(ErrorResponse {
            error: code.to_string(),
            error_description: String::new(),
        })
    }

    #[test]
    fn test_device_auth_deserialization() {
        let json = r#"{
            "device_code": "dev123",
            "user_code": "USER-CODE",
            "verification_url": "https://example.com/device",
            "expires_in": 1800
        }"#;

        let auth: DeviceAuthorization = serde_json::from_str(json).unwrap();
        assert_eq!(auth.device_code, "dev123");
        assert_eq!(auth.verification_uri, "https://example.com/device");
        assert_eq!(auth.interval, None);
    }

    #[tokio::test]
    async fn test_session_uses_default_interval() {
        let auth: DeviceAuthorization = serde_json::from_str(
            r#"{"device_code":"d","user_code":"u","verification_uri":"v","expires_in":900}"#,
        )
        .unwrap();
        let session = DeviceCodeSession::from_response(auth, &AuthSettings::default());
        assert_eq!(session.interval, Duration::from_secs(5));
        assert!(!session.is_expired());
        assert_eq!(session.prompt().user_code, "u");
    }

    #[tokio::test]
    async fn test_zero_interval_is_floored() {
        let json = r#"{"device_code":"d","user_code":"u","verification_uri":"v","expires_in":900,"interval":0}"#;

        let session = DeviceCodeSession::from_response(
            serde_json::from_str(json).unwrap(),
            &AuthSettings::default(),
        );
        assert_eq!(session.interval, Duration::from_secs(1));

        let session = DeviceCodeSession::from_response(
            serde_json::from_str(json).unwrap(),
            &AuthSettings::default().with_min_interval(Duration::ZERO),
        );
        assert_eq!(session.interval, Duration::ZERO);
    }

    #[test]
    fn test_poll_outcome_mapping() {
        assert!(matches!(
            PollOutcome::from_reply(rejected("authorization_pending")),
            Ok(PollOutcome::Pending)
        ));
        assert!(matches!(
            PollOutcome::from_reply(rejected("slow_down")),
            Ok(PollOutcome::SlowDown)
        ));
        assert!(matches!(
            PollOutcome::from_reply(rejected("expired_token")),
            Ok(PollOutcome::Expired)
        ));
        assert!(matches!(
            PollOutcome::from_reply(rejected("authorization_declined")),
            Ok(PollOutcome::Denied)
        ));
        assert_eq!(
            PollOutcome::from_reply(rejected("bad_verification_code")).unwrap_err(),
            Error::protocol("bad_verification_code", "")
        );
    }

    fn outcome() -> impl Strategy<Value = PollOutcome> {
        prop_oneof![
            Just(PollOutcome::Pending),
            Just(PollOutcome::SlowDown),
            Just(PollOutcome::Expired),
            Just(PollOutcome::Denied),
        ]
    }

    proptest! {
        #[test]
        fn interval_never_decreases(
            start in 0u64..60,
            step in 0u64..30,
            outcomes in proptest::collection::vec(outcome(), 0..50),
        ) {
            let step = Duration::from_secs(step);
            let mut interval = Duration::from_secs(start);
            let mut slow_downs = 0u32;
            for outcome in &outcomes {
                let next = outcome.next_interval(interval, step);
                prop_assert!(next >= interval);
                if matches!(outcome, PollOutcome::SlowDown) {
                    slow_downs += 1;
                    prop_assert_eq!(next, interval + step);
                } else {
                    prop_assert_eq!(next, interval);
                }
                interval = next;
            }
            prop_assert_eq!(interval, Duration::from_secs(start) + step * slow_downs);
        }
    }
}
