//! Cross-cutting call instrumentation.
//!
//! Every dispatcher action and every scheduler sub-scan runs through
//! [`traced`], which gives each operation a span, a duration, and a log-safe
//! user reference without annotating individual handlers.

use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::Instrument;

/// Run an operation inside a named span, recording its wall time.
pub async fn traced<T, F>(op: &'static str, user: Option<&str>, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let user_hash = user.map(phone_hash);
    let span = tracing::info_span!(
        "op",
        name = op,
        user = user_hash.as_deref().unwrap_or("-")
    );
    let start = Instant::now();
    let result = fut.instrument(span).await;
    tracing::debug!(
        op,
        user = user_hash.as_deref().unwrap_or("-"),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "op finished"
    );
    result
}

/// Short stable hash of a phone number. Raw numbers never reach the logs.
pub fn phone_hash(phone_number: &str) -> String {
    let digest = Sha256::digest(phone_number.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..12].to_string()
}
