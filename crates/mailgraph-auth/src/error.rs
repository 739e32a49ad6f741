//! Error types for token acquisition.

use std::fmt;

/// Result type alias for token acquisition.
pub type Result<T> = std::result::Result<T, Error>;

/// Token acquisition errors.
///
/// Cloneable so a single outcome can be handed to every caller waiting on the
/// same in-flight acquisition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Transport failure that persisted through every retry.
    #[error("Network error after {attempts} attempt(s): {message}")]
    Network {
        /// Number of attempts made.
        attempts: u32,
        /// Last transport error message.
        message: String,
    },

    /// The exchange ended without a token.
    #[error("Authorization failed: {0}")]
    Auth(AuthFailure),

    /// `get_token` was called before `initialize`.
    #[error("Authenticator has not been initialized")]
    TokenUnavailable,

    /// A successful response carried a body we could not understand.
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// Creates a protocol error from an `OAuth2` error code and description.
    #[must_use]
    pub fn protocol(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Auth(AuthFailure::Protocol {
            error: error.into(),
            description: description.into(),
        })
    }

    /// Returns the authorization failure, if this is one.
    #[must_use]
    pub const fn auth_failure(&self) -> Option<&AuthFailure> {
        match self {
            Self::Auth(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<AuthFailure> for Error {
    fn from(failure: AuthFailure) -> Self {
        Self::Auth(failure)
    }
}

/// Reason a device-code or refresh exchange terminated without a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// The device code expired before the user signed in.
    Expired,
    /// The user declined the sign-in request.
    Denied,
    /// The server answered with an error the flow cannot continue from.
    Protocol {
        /// Error code (e.g., `invalid_grant`).
        error: String,
        /// Human-readable description.
        description: String,
    },
    /// The refresh token was rejected and re-prompting is disabled. The
    /// rejected token is dropped, so the next `get_token` call starts a
    /// device-code exchange.
    ReauthRequired,
    /// The exchange was cancelled before it finished.
    Cancelled,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => f.write_str("device code expired"),
            Self::Denied => f.write_str("user denied authorization"),
            Self::Protocol { error, description } if description.is_empty() => {
                write!(f, "{error}")
            }
            Self::Protocol { error, description } => write!(f, "{error} - {description}"),
            Self::ReauthRequired => f.write_str("refresh token rejected, sign in again"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_display() {
        let err = Error::protocol("invalid_grant", "AADSTS70000: bad grant");
        assert_eq!(
            err.to_string(),
            "Authorization failed: invalid_grant - AADSTS70000: bad grant"
        );
        assert_eq!(
            Error::protocol("server_error", "").to_string(),
            "Authorization failed: server_error"
        );
    }

    #[test]
    fn test_auth_failure_accessor() {
        assert_eq!(
            Error::from(AuthFailure::Expired).auth_failure(),
            Some(&AuthFailure::Expired)
        );
        assert!(Error::TokenUnavailable.auth_failure().is_none());
    }
}
