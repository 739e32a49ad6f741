//! # mailgraph-auth
//!
//! `OAuth2` device-code sign-in for command-line clients of Microsoft Graph
//! (or any RFC 8628 identity provider).
//!
//! ## Features
//!
//! - **Device Authorization Grant**: requests a user code, hands it to a
//!   prompt sink, and polls until the user signs in, declines, or the code
//!   expires (`slow_down` honored)
//! - **Token cache**: tokens are reused until they come within a safety
//!   margin of expiry, then refreshed with the refresh token
//! - **Single-flight**: concurrent callers share one in-flight exchange
//! - **Bounded retry**: transient transport failures are retried with linear
//!   backoff; protocol errors are not
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailgraph_auth::{ClientConfig, DeviceCodeAuthenticator, DeviceCodePrompt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new(
//!         "your-client-id",
//!         "common",
//!         ["user.read", "mail.read", "offline_access"],
//!     )?;
//!
//!     let auth = DeviceCodeAuthenticator::connect(config, |prompt: &DeviceCodePrompt| {
//!         eprintln!("{}", prompt.instructions());
//!     })?;
//!
//!     // Prompts once, then served from cache or refreshed silently.
//!     let token = auth.get_token().await?;
//!     println!("Authorization: {}", token.authorization_header());
//!     Ok(())
//! }
//! ```
//!
//! ## Async prompt consumers
//!
//! ```ignore
//! use mailgraph_auth::{AuthSettings, ChannelPrompt, DeviceCodeAuthenticator};
//!
//! let (prompt, mut prompts) = ChannelPrompt::new(4);
//! let auth = DeviceCodeAuthenticator::with_reqwest(AuthSettings::default())?;
//! auth.initialize(config, prompt)?;
//!
//! tokio::spawn(async move {
//!     while let Some(p) = prompts.recv().await {
//!         show_in_status_bar(&p.user_code, &p.verification_uri);
//!     }
//! });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod authenticator;
pub mod config;
mod error;
pub mod flow;
pub mod prompt;
pub mod token;
pub mod transport;

pub use authenticator::DeviceCodeAuthenticator;
pub use config::{AuthSettings, ClientConfig};
pub use error::{AuthFailure, Error, Result};
pub use flow::{DeviceCodeSession, PollOutcome};
pub use prompt::{ChannelPrompt, DeviceCodePrompt, DevicePrompt};
pub use token::AccessToken;
pub use transport::{HttpReply, ReqwestTransport, Transport, TransportError};
