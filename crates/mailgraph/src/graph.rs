//! Microsoft Graph client for the signed-in user.
//!
//! Every request asks the authenticator for a token first, so sign-in,
//! caching and refresh all happen behind [`GraphClient`].

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use mailgraph_auth::DeviceCodeAuthenticator;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

/// Graph v1.0 endpoint.
pub const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0/";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Graph errors.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Could not obtain a token.
    #[error("authentication failed: {0}")]
    Auth(#[from] mailgraph_auth::Error),

    /// Request never got a response, or the body could not be decoded.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Base URL could not be parsed.
    #[error("invalid Graph URL: {0}")]
    Url(#[from] url::ParseError),

    /// Graph answered with a non-success status.
    #[error("Graph API error {status} ({code}): {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Graph error code, e.g. `ErrorAccessDenied`.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

/// Result type for Graph calls.
pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    #[serde(default)]
    message: String,
}

/// Profile of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Primary mail address, absent for some personal accounts.
    #[serde(default)]
    pub mail: Option<String>,
    /// Sign-in name.
    #[serde(default)]
    pub user_principal_name: Option<String>,
}

impl User {
    /// Best address to show: `mail`, else the principal name.
    #[must_use]
    pub fn email(&self) -> &str {
        self.mail
            .as_deref()
            .or(self.user_principal_name.as_deref())
            .unwrap_or("")
    }
}

/// Mail address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EmailAddress {
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// SMTP address.
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: EmailAddress,
}

/// Inbox listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    /// Subject line.
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    from: Option<Recipient>,
    /// Whether the message has been read.
    #[serde(default)]
    pub is_read: bool,
    /// Delivery time.
    pub received_date_time: DateTime<Utc>,
}

impl MessageSummary {
    /// Sender, by name if known.
    #[must_use]
    pub fn sender(&self) -> &str {
        self.from
            .as_ref()
            .and_then(|r| r.email_address.name.as_deref().or(r.email_address.address.as_deref()))
            .unwrap_or("NONE")
    }
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    value: Vec<T>,
}

/// Event to create on the default calendar.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Title.
    pub subject: String,
    /// Local start time.
    pub start: NaiveDateTime,
    /// Local end time.
    pub end: NaiveDateTime,
    /// IANA or Windows time zone name for `start` and `end`.
    pub time_zone: String,
}

impl NewEvent {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "subject": self.subject,
            "start": {
                "dateTime": self.start.format("%Y-%m-%dT%H:%M:%S").to_string(),
                "timeZone": self.time_zone,
            },
            "end": {
                "dateTime": self.end.format("%Y-%m-%dT%H:%M:%S").to_string(),
                "timeZone": self.time_zone,
            },
        })
    }
}

/// Created calendar event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event id.
    pub id: String,
    /// Title as stored.
    #[serde(default)]
    pub subject: Option<String>,
    /// Outlook link to the event.
    #[serde(default)]
    pub web_link: Option<String>,
}

/// Graph client bound to one authenticator.
#[derive(Debug, Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    base: Url,
    auth: DeviceCodeAuthenticator,
}

impl GraphClient {
    /// Creates a client against the public Graph endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(auth: DeviceCodeAuthenticator) -> Result<Self> {
        Self::with_base(auth, Url::parse(GRAPH_BASE)?)
    }

    /// Creates a client against a custom base URL (national clouds, tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_base(auth: DeviceCodeAuthenticator, mut base: Url) -> Result<Self> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, base, auth })
    }

    /// Fetches the signed-in user's profile.
    ///
    /// # Errors
    ///
    /// Returns an error if sign-in or the request fails.
    pub async fn me(&self) -> Result<User> {
        let request = self
            .http
            .get(self.url("me")?)
            .query(&[("$select", "displayName,mail,userPrincipalName")]);
        Ok(self.send(request).await?.json().await?)
    }

    /// Lists the newest `top` messages in the inbox.
    ///
    /// # Errors
    ///
    /// Returns an error if sign-in or the request fails.
    pub async fn inbox(&self, top: u32) -> Result<Vec<MessageSummary>> {
        let top = top.to_string();
        let request = self
            .http
            .get(self.url("me/mailFolders/inbox/messages")?)
            .query(&[
                ("$select", "from,isRead,receivedDateTime,subject"),
                ("$top", top.as_str()),
                ("$orderby", "receivedDateTime DESC"),
            ]);
        let page: Collection<MessageSummary> = self.send(request).await?.json().await?;
        Ok(page.value)
    }

    /// Sends a plain-text message and saves it to Sent Items.
    ///
    /// # Errors
    ///
    /// Returns an error if sign-in or the request fails.
    pub async fn send_mail(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let payload = json!({
            "message": {
                "subject": subject,
                "body": { "contentType": "Text", "content": body },
                "toRecipients": [ { "emailAddress": { "address": to } } ],
            },
            "saveToSentItems": true,
        });
        let request = self.http.post(self.url("me/sendMail")?).json(&payload);
        self.send(request).await?;
        Ok(())
    }

    /// Creates an event on the default calendar.
    ///
    /// # Errors
    ///
    /// Returns an error if sign-in or the request fails.
    pub async fn create_event(&self, event: &NewEvent) -> Result<Event> {
        let request = self.http.post(self.url("me/events")?).json(&event.to_json());
        Ok(self.send(request).await?.json().await?)
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let token = self.auth.get_token().await?;
        let response = request
            .header(AUTHORIZATION, token.authorization_header())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "Graph response");
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(api_error(status.as_u16(), &body))
    }
}

fn api_error(status: u16, body: &str) -> GraphError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(ApiErrorBody { error }) => GraphError::Api {
            status,
            code: error.code,
            message: error.message,
        },
        Err(_) => GraphError::Api {
            status,
            code: "Unknown".into(),
            message: body.chars().take(200).collect(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mailgraph_auth::{AuthSettings, ClientConfig, DeviceCodePrompt};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    /// Mock identity server that issues `graph-token` straight away.
    async fn signed_in(server: &MockServer) -> DeviceCodeAuthenticator {
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/devicecode"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "dev",
                "user_code": "CODE",
                "verification_uri": "https://microsoft.com/devicelogin",
                "expires_in": 900,
                "interval": 0
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "Bearer",
                "access_token": "graph-token",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(server)
            .await;

        let config = ClientConfig::with_authority(
            "client",
            "common",
            ["user.read"],
            Url::parse(&server.uri()).unwrap(),
        )
        .unwrap();
        let settings = AuthSettings::default().with_min_interval(Duration::ZERO);
        let auth = DeviceCodeAuthenticator::with_reqwest(settings).unwrap();
        auth.initialize(config, |_: &DeviceCodePrompt| {}).unwrap();
        auth
    }

    async fn client(server: &MockServer) -> GraphClient {
        let auth = signed_in(server).await;
        let base = Url::parse(&format!("{}/v1.0", server.uri())).unwrap();
        GraphClient::with_base(auth, base).unwrap()
    }

    #[tokio::test]
    async fn test_me_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me"))
            .and(query_param("$select", "displayName,mail,userPrincipalName"))
            .and(header("authorization", "Bearer graph-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "displayName": "Megan Bowen",
                "mail": null,
                "userPrincipalName": "megan@contoso.com"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let graph = client(&server).await;
        let user = graph.me().await.unwrap();
        assert_eq!(user.display_name.as_deref(), Some("Megan Bowen"));
        assert_eq!(user.email(), "megan@contoso.com");

        // Second call reuses the cached token.
        graph.me().await.unwrap();
    }

    #[tokio::test]
    async fn test_inbox_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/mailFolders/inbox/messages"))
            .and(query_param("$top", "5"))
            .and(query_param("$orderby", "receivedDateTime DESC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {
                        "subject": "Quarterly report",
                        "isRead": false,
                        "receivedDateTime": "2024-03-01T09:30:00Z",
                        "from": { "emailAddress": { "name": "Adele Vance", "address": "adele@contoso.com" } }
                    },
                    {
                        "subject": "No sender",
                        "isRead": true,
                        "receivedDateTime": "2024-02-28T18:00:00Z"
                    }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let messages = client(&server).await.inbox(5).await.unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender(), "Adele Vance");
        assert!(!messages[0].is_read);
        assert_eq!(messages[1].sender(), "NONE");
    }

    #[tokio::test]
    async fn test_send_mail_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/sendMail"))
            .and(body_partial_json(json!({
                "message": {
                    "subject": "Hello",
                    "toRecipients": [ { "emailAddress": { "address": "adele@contoso.com" } } ]
                },
                "saveToSentItems": true
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .send_mail("adele@contoso.com", "Hello", "Hi there")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/events"))
            .and(body_partial_json(json!({
                "subject": "Standup",
                "start": { "dateTime": "2024-03-04T09:00:00", "timeZone": "UTC" }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "AAMk-event",
                "subject": "Standup",
                "webLink": "https://outlook.office365.com/owa/?itemid=AAMk-event"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let event = NewEvent {
            subject: "Standup".into(),
            start: "2024-03-04T09:00:00".parse().unwrap(),
            end: "2024-03-04T09:15:00".parse().unwrap(),
            time_zone: "UTC".into(),
        };
        let created = client(&server).await.create_event(&event).await.unwrap();
        assert_eq!(created.id, "AAMk-event");
    }

    #[tokio::test]
    async fn test_api_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": { "code": "ErrorAccessDenied", "message": "Access is denied." }
            })))
            .mount(&server)
            .await;

        let err = client(&server).await.me().await.unwrap_err();
        assert!(matches!(
            err,
            GraphError::Api { status: 403, ref code, .. } if code == "ErrorAccessDenied"
        ));
    }

    #[test]
    fn test_api_error_without_json_body() {
        let err = api_error(502, "Bad Gateway");
        assert!(matches!(
            err,
            GraphError::Api { status: 502, ref code, ref message } if code == "Unknown" && message == "Bad Gateway"
        ));
    }
}
