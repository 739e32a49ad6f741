//! Outbound HTTP seam for the device-code and token endpoints.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

/// Raw reply from an endpoint: status code and body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl HttpReply {
    /// Creates a reply.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns true for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Failure to get any reply at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    /// Description of the failure.
    pub message: String,
    /// Whether retrying the same request may succeed.
    pub transient: bool,
}

impl TransportError {
    /// A failure worth retrying (connection refused, timeout, reset).
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// A failure that will not go away on retry.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let message = err.to_string();
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            Self::transient(message)
        } else {
            Self::permanent(message)
        }
    }
}

/// Form-encoded POST transport.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Posts `form` to `url` and returns whatever the server answered.
    async fn post_form(
        &self,
        url: &Url,
        form: &[(&str, &str)],
    ) -> Result<HttpReply, TransportError>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with a 30 second request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TransportError::permanent(e.to_string()))?;
        Ok(Self { http_client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_form(
        &self,
        url: &Url,
        form: &[(&str, &str)],
    ) -> Result<HttpReply, TransportError> {
        let response = self
            .http_client
            .post(url.clone())
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpReply { status, body })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod scripted {
    //! Transport that replays canned replies per endpoint path.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use super::{HttpReply, Transport, TransportError, Url, async_trait};

    /// Posted request, as seen by the transport.
    #[derive(Debug, Clone)]
    pub struct Request {
        pub path: String,
        pub form: Vec<(String, String)>,
    }

    impl Request {
        pub fn param(&self, name: &str) -> Option<&str> {
            self.form
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        }
    }

    #[derive(Debug, Default)]
    pub struct ScriptedTransport {
        replies: Mutex<HashMap<String, VecDeque<Result<HttpReply, TransportError>>>>,
        requests: Mutex<Vec<Request>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues a reply for the next POST whose path ends with `suffix`.
        pub fn push(&self, suffix: &str, reply: Result<HttpReply, TransportError>) {
            self.replies
                .lock()
                .unwrap()
                .entry(suffix.to_string())
                .or_default()
                .push_back(reply);
        }

        pub fn push_json(&self, suffix: &str, status: u16, body: serde_json::Value) {
            self.push(suffix, Ok(HttpReply::new(status, body.to_string())));
        }

        pub fn requests(&self) -> Vec<Request> {
            self.requests.lock().unwrap().clone()
        }

        pub fn count(&self, suffix: &str) -> usize {
            self.requests()
                .iter()
                .filter(|r| r.path.ends_with(suffix))
                .count()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post_form(
            &self,
            url: &Url,
            form: &[(&str, &str)],
        ) -> Result<HttpReply, TransportError> {
            let path = url.path().to_string();
            self.requests.lock().unwrap().push(Request {
                path: path.clone(),
                form: form
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            });
            // Yield so concurrent callers interleave like they would on a socket.
            tokio::task::yield_now().await;

            let mut replies = self.replies.lock().unwrap();
            let queue = replies
                .iter_mut()
                .find(|(suffix, _)| path.ends_with(suffix.as_str()))
                .map(|(_, queue)| queue);
            queue.and_then(VecDeque::pop_front).unwrap_or_else(|| {
                Err(TransportError::permanent(format!("no scripted reply for {path}")))
            })
        }
    }
}
