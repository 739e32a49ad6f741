//! Client configuration and authenticator tunables.

use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

/// Default identity authority.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Immutable client registration used for every exchange.
///
/// Endpoint URLs are derived from the authority and the tenant:
/// `{authority}/{tenant}/oauth2/v2.0/devicecode` and `.../token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    client_id: String,
    tenant_id: String,
    scopes: Vec<String>,
    authority: Url,
    device_code_url: Url,
    token_url: Url,
}

impl ClientConfig {
    /// Creates a configuration against the default authority.
    ///
    /// Scopes keep their first-seen order; duplicates and blank entries are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the client id or tenant id is blank, or if
    /// no scope remains after normalization.
    pub fn new<I, S>(
        client_id: impl Into<String>,
        tenant_id: impl Into<String>,
        scopes: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let authority = Url::parse(DEFAULT_AUTHORITY)
            .map_err(|e| Error::Config(format!("authority: {e}")))?;
        Self::with_authority(client_id, tenant_id, scopes, authority)
    }

    /// Creates a configuration against a custom authority (sovereign clouds,
    /// local test servers).
    ///
    /// # Errors
    ///
    /// Same as [`ClientConfig::new`], plus an error if the authority cannot
    /// serve as a base URL.
    pub fn with_authority<I, S>(
        client_id: impl Into<String>,
        tenant_id: impl Into<String>,
        scopes: I,
        authority: Url,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let client_id = client_id.into().trim().to_string();
        if client_id.is_empty() {
            return Err(Error::Config("client id is empty".into()));
        }

        let tenant_id = tenant_id.into().trim().to_string();
        if tenant_id.is_empty() {
            return Err(Error::Config("tenant id is empty".into()));
        }
        if tenant_id.contains(['/', '?', '#']) || tenant_id.contains(char::is_whitespace) {
            return Err(Error::Config(format!("tenant id {tenant_id:?} is not a path segment")));
        }

        let scopes = normalize_scopes(scopes);
        if scopes.is_empty() {
            return Err(Error::Config("at least one scope is required".into()));
        }

        if authority.cannot_be_a_base() {
            return Err(Error::Config(format!("authority {authority} is not a base URL")));
        }
        let authority = with_trailing_slash(authority);
        let endpoint = |leaf: &str| {
            authority
                .join(&format!("{tenant_id}/oauth2/v2.0/{leaf}"))
                .map_err(|e| Error::Config(format!("{leaf} endpoint: {e}")))
        };
        let device_code_url = endpoint("devicecode")?;
        let token_url = endpoint("token")?;

        Ok(Self {
            client_id,
            tenant_id,
            scopes,
            authority,
            device_code_url,
            token_url,
        })
    }

    /// Application (client) id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Directory (tenant) id, or one of `common`, `organizations`, `consumers`.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Requested scopes in request order.
    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Scopes joined for the `scope` form parameter.
    #[must_use]
    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }

    /// Authority base URL.
    #[must_use]
    pub const fn authority(&self) -> &Url {
        &self.authority
    }

    /// Device authorization endpoint.
    #[must_use]
    pub const fn device_code_url(&self) -> &Url {
        &self.device_code_url
    }

    /// Token endpoint.
    #[must_use]
    pub const fn token_url(&self) -> &Url {
        &self.token_url
    }
}

fn normalize_scopes<I, S>(scopes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for scope in scopes {
        for part in scope.as_ref().split_whitespace() {
            if !out.iter().any(|s| s == part) {
                out.push(part.to_string());
            }
        }
    }
    out
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Tunables for the authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    /// A cached token must stay valid at least this long to be handed out.
    pub safety_margin: Duration,
    /// Added to the polling interval on every `slow_down` response.
    pub slow_down_step: Duration,
    /// Polling interval used when the server does not send one.
    pub default_interval: Duration,
    /// Lower bound on the polling interval, applied to server values too.
    pub min_interval: Duration,
    /// Attempts per request before a transient transport failure surfaces.
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * retry_backoff` before retrying.
    pub retry_backoff: Duration,
    /// Whether a rejected refresh token falls through to a new device-code
    /// prompt instead of failing with `ReauthRequired`.
    pub reprompt_on_refresh_failure: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(120),
            slow_down_step: Duration::from_secs(5),
            default_interval: Duration::from_secs(5),
            min_interval: Duration::from_secs(1),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            reprompt_on_refresh_failure: true,
        }
    }
}

impl AuthSettings {
    /// Sets the safety margin.
    #[must_use]
    pub const fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    /// Sets the slow-down step.
    #[must_use]
    pub const fn with_slow_down_step(mut self, step: Duration) -> Self {
        self.slow_down_step = step;
        self
    }

    /// Sets the polling interval floor.
    #[must_use]
    pub const fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Sets the transport retry bound (clamped to at least one attempt).
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the retry backoff unit.
    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the refresh-failure policy.
    #[must_use]
    pub const fn with_reprompt_on_refresh_failure(mut self, reprompt: bool) -> Self {
        self.reprompt_on_refresh_failure = reprompt;
        self
    }
}
