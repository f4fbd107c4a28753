//! Inbound webhook server.
//!
//! A single axum server hosts the Twilio webhook and a health probe. The
//! route fragment carries its own state, so `WebhookServer` just binds,
//! merges, and serves with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Form, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::agent::Dispatcher;
use crate::error::ChannelError;

/// Configuration for the webhook server.
pub struct WebhookServerConfig {
    /// Address to bind the server to.
    pub addr: SocketAddr,
}

/// The webhook HTTP server.
pub struct WebhookServer {
    config: WebhookServerConfig,
    routes: Vec<Router>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl WebhookServer {
    /// Create a new webhook server with the given bind address.
    pub fn new(config: WebhookServerConfig) -> Self {
        Self {
            config,
            routes: Vec::new(),
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Accumulate a route fragment. Each fragment should already have its
    /// state applied via `.with_state()`.
    pub fn add_routes(&mut self, router: Router) {
        self.routes.push(router);
    }

    /// Bind the listener, merge all route fragments, and spawn the server.
    pub async fn start(&mut self) -> Result<(), ChannelError> {
        let mut app = Router::new();
        for fragment in self.routes.drain(..) {
            app = app.merge(fragment);
        }
        let app = app.layer(TraceLayer::new_for_http());

        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| ChannelError::StartupFailed {
                reason: format!("failed to bind {}: {}", self.config.addr, e),
            })?;

        tracing::info!("webhook server listening on {}", self.config.addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("webhook server shutting down");
                })
                .await
            {
                tracing::error!("webhook server error: {}", e);
            }
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// The Twilio webhook routes with the dispatcher applied as state.
pub fn twilio_routes(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhook", post(webhook_handler))
        .with_state(dispatcher)
}

/// Form fields Twilio posts for an inbound WhatsApp message.
#[derive(Debug, Deserialize)]
struct TwilioInbound {
    #[serde(rename = "From", default)]
    from: String,
    #[serde(rename = "Body", default)]
    body: String,
    #[serde(rename = "NumMedia", default)]
    num_media: Option<String>,
    #[serde(rename = "MediaUrl0", default)]
    media_url0: Option<String>,
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok"}))
}

async fn webhook_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Form(inbound): Form<TwilioInbound>,
) -> impl IntoResponse {
    let phone_number = inbound.from.trim_start_matches("whatsapp:").to_string();
    if phone_number.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing sender").into_response();
    }

    let num_media: usize = inbound
        .num_media
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let media_url = if num_media > 0 {
        inbound.media_url0.as_deref()
    } else {
        None
    };

    let reply = dispatcher
        .handle_message(&phone_number, &inbound.body, media_url)
        .await;

    (
        [(header::CONTENT_TYPE, "application/xml")],
        twiml_reply(&reply),
    )
        .into_response()
}

/// Wrap a reply in the TwiML envelope Twilio expects back from a webhook.
fn twiml_reply(text: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>{}</Message></Response>",
        escape_xml(text)
    )
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_twiml_wraps_message() {
        let xml = twiml_reply("Session stopped.");
        assert_eq!(
            xml,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>Session stopped.</Message></Response>"
        );
    }

    #[test]
    fn test_twiml_escapes_markup() {
        let xml = twiml_reply("5 < 10 & \"quotes\"");
        assert!(xml.contains("5 &lt; 10 &amp; &quot;quotes&quot;"));
        assert!(!xml.contains("< 10"));
    }
}
