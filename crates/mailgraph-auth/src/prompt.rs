//! Delivery of the user code to whoever shows it to the user.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// What the user needs to finish signing in on another device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodePrompt {
    /// Code the user types at the verification page.
    pub user_code: String,
    /// Page where the code is entered.
    pub verification_uri: String,
    /// Verification page with the code pre-filled, if the server sent one.
    pub verification_uri_complete: Option<String>,
    /// Ready-made instruction text from the server, if any.
    pub message: Option<String>,
    /// When the code stops working.
    pub expires_at: DateTime<Utc>,
}

impl DeviceCodePrompt {
    /// Instruction text: the server's own message if present, otherwise a
    /// generated one.
    #[must_use]
    pub fn instructions(&self) -> String {
        self.message.clone().unwrap_or_else(|| {
            format!(
                "To sign in, open {} and enter the code {}",
                self.verification_uri, self.user_code
            )
        })
    }
}

/// Receives device-code prompts.
///
/// Implementations run on the blocking pool, detached from the polling task,
/// so they may print or block briefly without stalling the exchange. Closures
/// `Fn(&DeviceCodePrompt)` implement this trait.
pub trait DevicePrompt: Send + Sync {
    /// Shows the prompt to the user.
    fn show(&self, prompt: &DeviceCodePrompt);
}

impl<F> DevicePrompt for F
where
    F: Fn(&DeviceCodePrompt) + Send + Sync,
{
    fn show(&self, prompt: &DeviceCodePrompt) {
        self(prompt);
    }
}

/// Forwards prompts into a bounded channel for async consumers.
///
/// Never blocks: when the channel is full or closed the prompt is dropped and
/// a warning is logged.
#[derive(Debug, Clone)]
pub struct ChannelPrompt {
    tx: mpsc::Sender<DeviceCodePrompt>,
}

impl ChannelPrompt {
    /// Creates the prompt sink and the receiving end.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DeviceCodePrompt>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl DevicePrompt for ChannelPrompt {
    fn show(&self, prompt: &DeviceCodePrompt) {
        if let Err(e) = self.tx.try_send(prompt.clone()) {
            tracing::warn!(user_code = %prompt.user_code, "Dropped device-code prompt: {e}");
        }
    }
}

/// Hands `prompt` to `sink` without waiting for it.
pub(crate) fn deliver(sink: &Arc<dyn DevicePrompt>, prompt: DeviceCodePrompt) {
    let sink = Arc::clone(sink);
    drop(tokio::task::spawn_blocking(move || sink.show(&prompt)));
}
