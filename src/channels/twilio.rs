//! Twilio WhatsApp notifier.

use async_trait::async_trait;
use base64::Engine;
use secrecy::ExposeSecret;

use crate::channels::Notifier;
use crate::config::TwilioConfig;
use crate::error::ChannelError;

/// Sends WhatsApp messages through the Twilio REST API and fetches inbound
/// media with the same credentials.
pub struct TwilioNotifier {
    client: reqwest::Client,
    config: TwilioConfig,
}

impl TwilioNotifier {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.config.account_sid
        )
    }
}

/// Prefix a number with the `whatsapp:` scheme if it lacks one.
fn whatsapp_address(phone_number: &str) -> String {
    if phone_number.starts_with("whatsapp:") {
        phone_number.to_string()
    } else {
        format!("whatsapp:{}", phone_number)
    }
}

#[async_trait]
impl Notifier for TwilioNotifier {
    async fn send(
        &self,
        phone_number: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<(), ChannelError> {
        let from = whatsapp_address(&self.config.whatsapp_number);
        let to = whatsapp_address(phone_number);

        let mut form = vec![("From", from), ("To", to), ("Body", body.to_string())];
        if let Some(url) = media_url {
            form.push(("MediaUrl", url.to_string()));
        }

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::SendFailed {
                reason: format!(
                    "twilio returned {}: {}",
                    status,
                    response.text().await.unwrap_or_default()
                ),
            });
        }
        Ok(())
    }

    async fn fetch_media_data_url(&self, media_url: &str) -> Result<String, ChannelError> {
        let response = self
            .client
            .get(media_url)
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::MediaFetchFailed {
                reason: format!("media fetch returned {}", status),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = response.bytes().await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok(format!("data:{};base64,{}", content_type, encoded))
    }
}
