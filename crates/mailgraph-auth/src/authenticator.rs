//! Cached, single-flight token acquisition.
//!
//! `DeviceCodeAuthenticator` is a cheap clonable handle. Every clone shares
//! the same token cache and the same in-flight acquisition, so the
//! composition root creates one and passes it to whatever needs a token.
//!
//! ## Acquisition order
//!
//! 1. A cached token that stays valid for the safety margin is returned
//!    without touching the network.
//! 2. Otherwise, if a refresh token is cached, it is redeemed.
//! 3. Otherwise (or if the refresh token is rejected) a device-code exchange
//!    runs and the user is prompted.
//!
//! Steps 2 and 3 run in their own task. Callers arriving while that task is
//! running await the same result instead of starting another exchange.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AuthSettings, ClientConfig};
use crate::error::{AuthFailure, Error, Result};
use crate::flow::{DeviceCodeExchange, Endpoints};
use crate::prompt::DevicePrompt;
use crate::token::{AccessToken, TokenState};
use crate::transport::{ReqwestTransport, Transport};

type SharedAcquisition = Shared<BoxFuture<'static, Result<TokenState>>>;

/// Handle to a device-code authenticator.
#[derive(Clone)]
pub struct DeviceCodeAuthenticator {
    inner: Arc<Inner>,
}

struct Inner {
    configured: OnceLock<Configured>,
    settings: Arc<AuthSettings>,
    transport: Arc<dyn Transport>,
    cache: Mutex<Cache>,
    shutdown: CancellationToken,
}

struct Configured {
    endpoints: Endpoints,
    prompt: Arc<dyn DevicePrompt>,
}

#[derive(Default)]
struct Cache {
    token: Option<TokenState>,
    inflight: Option<Inflight>,
    next_id: u64,
    /// Bumped by `sign_out` so a stale acquisition cannot repopulate the cache.
    generation: u64,
}

struct Inflight {
    id: u64,
    future: SharedAcquisition,
}

impl DeviceCodeAuthenticator {
    /// Creates an uninitialized authenticator over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, settings: AuthSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                configured: OnceLock::new(),
                settings: Arc::new(settings),
                transport,
                cache: Mutex::new(Cache::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Creates an uninitialized authenticator over a `reqwest` transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn with_reqwest(settings: AuthSettings) -> Result<Self> {
        let transport =
            ReqwestTransport::new().map_err(|e| Error::Config(format!("HTTP client: {e}")))?;
        Ok(Self::new(Arc::new(transport), settings))
    }

    /// Creates and initializes an authenticator with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn connect(config: ClientConfig, prompt: impl DevicePrompt + 'static) -> Result<Self> {
        let authenticator = Self::with_reqwest(AuthSettings::default())?;
        authenticator.initialize(config, prompt)?;
        Ok(authenticator)
    }

    /// Stores the client configuration and the prompt sink.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if already initialized.
    pub fn initialize(&self, config: ClientConfig, prompt: impl DevicePrompt + 'static) -> Result<()> {
        let configured = Configured {
            endpoints: Endpoints::new(
                Arc::new(config),
                Arc::clone(&self.inner.settings),
                Arc::clone(&self.inner.transport),
            ),
            prompt: Arc::new(prompt),
        };
        self.inner
            .configured
            .set(configured)
            .map_err(|_| Error::Config("authenticator is already initialized".into()))?;
        if let Some(config) = self.config() {
            info!(
                client_id = config.client_id(),
                tenant_id = config.tenant_id(),
                scopes = %config.scope_param(),
                "Authenticator initialized"
            );
        }
        Ok(())
    }

    /// Returns the configuration, once initialized.
    #[must_use]
    pub fn config(&self) -> Option<&ClientConfig> {
        self.inner.configured.get().map(|c| c.endpoints.config())
    }

    /// Returns the tunables in effect.
    #[must_use]
    pub fn settings(&self) -> &AuthSettings {
        &self.inner.settings
    }

    /// Returns a bearer token valid for at least the safety margin.
    ///
    /// Resolves immediately when the cache holds such a token. Otherwise
    /// refreshes or runs a device-code exchange, sharing one in-flight
    /// acquisition among all concurrent callers.
    ///
    /// # Errors
    ///
    /// - [`Error::TokenUnavailable`] before [`initialize`](Self::initialize)
    /// - [`Error::Auth`] if the exchange expires, is denied, fails at the
    ///   protocol level or is cancelled
    /// - [`Error::Network`] if the endpoints stay unreachable
    pub async fn get_token(&self) -> Result<AccessToken> {
        if self.inner.configured.get().is_none() {
            return Err(Error::TokenUnavailable);
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(AuthFailure::Cancelled.into());
        }

        let acquisition = {
            let mut cache = self.inner.lock_cache();
            if let Some(token) = cache
                .token
                .as_ref()
                .filter(|t| t.is_valid_for(self.inner.settings.safety_margin))
            {
                return Ok(token.to_access_token());
            }

            if let Some(inflight) = &cache.inflight {
                debug!(acquisition = inflight.id, "Joining in-flight token acquisition");
                inflight.future.clone()
            } else {
                let id = cache.next_id;
                cache.next_id += 1;
                let future = self.spawn_acquisition(id, cache.token.clone(), cache.generation);
                cache.inflight = Some(Inflight {
                    id,
                    future: future.clone(),
                });
                future
            }
        };

        acquisition.await.map(|token| token.to_access_token())
    }

    /// Returns the cached token if it stays valid for the safety margin.
    /// Never touches the network.
    #[must_use]
    pub fn cached_token(&self) -> Option<AccessToken> {
        self.inner
            .lock_cache()
            .token
            .as_ref()
            .filter(|t| t.is_valid_for(self.inner.settings.safety_margin))
            .map(TokenState::to_access_token)
    }

    /// Forgets the cached token. The next `get_token` prompts again.
    pub fn sign_out(&self) {
        let mut cache = self.inner.lock_cache();
        cache.token = None;
        cache.generation += 1;
        info!("Signed out, token cache cleared");
    }

    /// Cancels any in-flight acquisition. Waiting callers and every later
    /// `get_token` call fail with [`AuthFailure::Cancelled`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn spawn_acquisition(
        &self,
        id: u64,
        previous: Option<TokenState>,
        generation: u64,
    ) -> SharedAcquisition {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = match inner.configured.get() {
                Some(configured) => tokio::select! {
                    biased;
                    () = inner.shutdown.cancelled() => Err(AuthFailure::Cancelled.into()),
                    result = acquire(&inner, configured, previous, generation) => result,
                },
                None => Err(Error::TokenUnavailable),
            };

            let mut cache = inner.lock_cache();
            cache.clear_inflight(id);
            if let Ok(token) = &result {
                if cache.generation == generation {
                    cache.token = Some(token.clone());
                } else {
                    debug!(acquisition = id, "Discarding token acquired before sign-out");
                }
            }
            result
        });

        let inner = Arc::clone(&self.inner);
        async move {
            task.await.unwrap_or_else(|e| {
                warn!(acquisition = id, "Token acquisition task ended abnormally: {e}");
                inner.lock_cache().clear_inflight(id);
                Err(AuthFailure::Cancelled.into())
            })
        }
        .boxed()
        .shared()
    }
}

impl std::fmt::Debug for DeviceCodeAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCodeAuthenticator")
            .field("config", &self.config())
            .field("settings", &self.inner.settings)
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Cache {
    fn clear_inflight(&mut self, id: u64) {
        if self.inflight.as_ref().is_some_and(|i| i.id == id) {
            self.inflight = None;
        }
    }

    /// Drops a token whose refresh token the server rejected, unless a
    /// sign-out already replaced it.
    fn evict_rejected(&mut self, generation: u64) {
        if self.generation == generation {
            self.token = None;
        }
    }
}

/// Refresh if possible, otherwise run a device-code exchange.
async fn acquire(
    inner: &Inner,
    configured: &Configured,
    previous: Option<TokenState>,
    generation: u64,
) -> Result<TokenState> {
    if let Some(previous) = previous {
        if let Some(refresh_token) = previous.refresh_token() {
            info!(scope = ?previous.scope(), "Access token expiring, redeeming refresh token");
            match configured.endpoints.refresh(refresh_token).await {
                Ok(token) => return Ok(token.inherit_refresh_token(&previous)),
                Err(Error::Auth(failure)) => {
                    inner.lock_cache().evict_rejected(generation);
                    if !inner.settings.reprompt_on_refresh_failure {
                        warn!(%failure, "Refresh token rejected, re-authentication required");
                        return Err(AuthFailure::ReauthRequired.into());
                    }
                    warn!(%failure, "Refresh token rejected, falling back to device-code sign-in");
                }
                Err(error) => return Err(error),
            }
        }
    }

    info!("Starting device-code sign-in");
    DeviceCodeExchange::new(&configured.endpoints, &configured.prompt)
        .run()
        .await
}
