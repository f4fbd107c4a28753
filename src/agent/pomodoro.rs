//! Focus session actions: start, stop, backfill, summaries, stats.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::CycleDefaults;
use crate::db::{Database, User};
use crate::error::DatabaseError;
use crate::llm::Llm;
use crate::sessions::{NewSession, SessionStatus, parse_cycle};
use crate::state::ConversationState;
use crate::timeutil::{local_day_bounds, safe_tz, short_local_time};

/// Start a focus cycle, cancelling any session already running.
///
/// Availability beats strict ownership: a stray active row never blocks a
/// fresh start.
pub async fn start(
    db: &dyn Database,
    user: &User,
    message: &str,
    now: DateTime<Utc>,
    fallback: CycleDefaults,
) -> Result<String, DatabaseError> {
    // User preferences win; non-positive stored values fall back to the
    // process defaults.
    let default_work = if user.default_work_minutes > 0 {
        user.default_work_minutes
    } else {
        fallback.work_minutes
    };
    let default_break = if user.default_break_minutes > 0 {
        user.default_break_minutes
    } else {
        fallback.break_minutes
    };
    let (work, rest) = parse_cycle(message, default_work, default_break);

    for session in db.active_sessions_for_user(user.id).await? {
        db.close_session(session.id, SessionStatus::Cancelled, now)
            .await?;
    }

    db.insert_session(&NewSession::work_block(user.id, now, work, rest))
        .await?;
    Ok(format!(
        "⏱ Focus session started! {} minutes of work time. I'll let you know when it's time for a break.",
        work
    ))
}

/// Stop the running cycle.
///
/// Returns `None` for the next state when there was nothing to stop, so the
/// caller leaves the pending state untouched.
pub async fn stop(
    db: &dyn Database,
    user: &User,
    now: DateTime<Utc>,
) -> Result<(String, Option<ConversationState>), DatabaseError> {
    let active = db.active_sessions_for_user(user.id).await?;
    if active.is_empty() {
        return Ok(("No active session to stop.".to_string(), None));
    }

    for session in &active {
        db.close_session(session.id, SessionStatus::Cancelled, now)
            .await?;
    }

    // Invite a summary even though the cycle did not run to completion.
    let next = ConversationState::AwaitingPomodoroSummary {
        session_id: active[0].id,
        requested_at: now,
        nudged: false,
    };
    Ok((
        "Session stopped. What were you working on?".to_string(),
        Some(next),
    ))
}

/// Log historical work from a natural-language range.
pub async fn backfill(
    db: &dyn Database,
    llm: &Arc<dyn Llm>,
    user: &User,
    message: &str,
) -> Result<String, DatabaseError> {
    const CANT_PARSE: &str =
        "I couldn't parse the time range. Try: 'I worked on X from 2pm to 4pm'.";

    let tz = safe_tz(&user.timezone);
    let draft = match llm.parse_backfill(message, tz).await {
        Ok(draft) => draft,
        Err(e) => {
            tracing::warn!("backfill extraction failed: {}", e);
            return Ok(CANT_PARSE.to_string());
        }
    };
    let (Some(start), Some(end)) = (draft.start, draft.end) else {
        return Ok(CANT_PARSE.to_string());
    };
    if end <= start {
        return Ok(CANT_PARSE.to_string());
    }

    let description = draft
        .description
        .unwrap_or_else(|| "Backfilled work".to_string());
    let session = NewSession::backfilled(user.id, start, end, &description);
    let minutes = session.cycle_work_minutes;
    db.insert_session(&session).await?;

    Ok(format!(
        "Got it! Logged {} minutes of work on '{}' from {} to {}.",
        minutes,
        description,
        short_local_time(start, tz),
        short_local_time(end, tz)
    ))
}

/// Attach a summary to a session. Works on closed sessions; it is the only
/// mutation they accept.
pub async fn attach_summary(
    db: &dyn Database,
    session_id: Uuid,
    message: &str,
) -> Result<String, DatabaseError> {
    db.attach_summary(session_id, message.trim()).await?;
    Ok("Nice. Logged your session summary.".to_string())
}

/// Today's focus summary: total hours, session count, and what got done.
pub async fn stats(
    db: &dyn Database,
    user: &User,
    now: DateTime<Utc>,
) -> Result<String, DatabaseError> {
    let tz = safe_tz(&user.timezone);
    let (from, to) = local_day_bounds(tz, now);
    let sessions = db.work_sessions_between(user.id, from, to).await?;
    if sessions.is_empty() {
        return Ok("No focus sessions logged today.".to_string());
    }

    let mut total_minutes = 0i64;
    let mut items = Vec::new();
    for session in &sessions {
        let end = session.ended_at.unwrap_or(session.planned_end);
        total_minutes += ((end - session.started_at).num_seconds() / 60).max(0);
        if let Some(summary) = &session.summary {
            if !summary.is_empty() {
                items.push(format!("- {}", summary));
            }
        }
    }

    let mut reply = format!(
        "Today you've focused for {} hours across {} sessions.",
        format_hours(total_minutes),
        sessions.len()
    );
    if !items.is_empty() {
        reply.push_str("\nHere's what you did:\n");
        reply.push_str(&items.join("\n"));
    }
    Ok(reply)
}

fn format_hours(minutes: i64) -> String {
    let hours = minutes as f64 / 60.0;
    let formatted = format!("{:.2}", hours);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_hours() {
        assert_eq!(format_hours(90), "1.5");
        assert_eq!(format_hours(120), "2");
        assert_eq!(format_hours(25), "0.42");
        assert_eq!(format_hours(0), "0");
    }
}
