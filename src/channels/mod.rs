//! Outbound messaging and the inbound webhook surface.

pub mod twilio;
pub mod webhook;

pub use twilio::TwilioNotifier;
pub use webhook::{WebhookServer, WebhookServerConfig};

use async_trait::async_trait;

use crate::error::ChannelError;

/// Outbound notification collaborator.
///
/// Fire-and-forget from the scheduler's perspective: errors are caught and
/// logged by callers, never retried within a tick.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a text message, optionally with a media attachment, to a phone
    /// number.
    async fn send(
        &self,
        phone_number: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<(), ChannelError>;

    /// Download inbound media and return it as a base64 data URL suitable
    /// for the vision model.
    async fn fetch_media_data_url(&self, media_url: &str) -> Result<String, ChannelError>;
}
