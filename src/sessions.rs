//! Focus/break session lifecycle.
//!
//! Pure state machine for timed work/break cycles. Nothing here touches the
//! database or the network: the functions compute the rows to insert and the
//! patches to apply, and the dispatcher and scheduler own persistence. Both
//! consume this module, so expiry rollover and message-driven starts share
//! one set of transition rules.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

/// Work or break block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Work,
    Break,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Work => "work",
            SessionKind::Break => "break",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "work" => Some(SessionKind::Work),
            "break" => Some(SessionKind::Break),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a session instance.
///
/// `Completed` and `Cancelled` are terminal; a new instance starts the next
/// cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub planned_end: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub backfill: bool,
    pub cycle_work_minutes: i32,
    pub cycle_break_minutes: i32,
}

impl Session {
    /// Whether the scheduler should roll this session over.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && self.planned_end <= now
    }
}

/// A session row to insert.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub planned_end: DateTime<Utc>,
    pub summary: Option<String>,
    pub backfill: bool,
    pub cycle_work_minutes: i32,
    pub cycle_break_minutes: i32,
}

impl NewSession {
    /// An active work block starting now, remembering the cycle lengths for
    /// rollover.
    pub fn work_block(
        user_id: Uuid,
        now: DateTime<Utc>,
        work_minutes: i32,
        break_minutes: i32,
    ) -> Self {
        Self {
            user_id,
            kind: SessionKind::Work,
            status: SessionStatus::Active,
            started_at: now,
            planned_end: now + Duration::minutes(work_minutes as i64),
            summary: None,
            backfill: false,
            cycle_work_minutes: work_minutes,
            cycle_break_minutes: break_minutes,
        }
    }

    /// An active break block starting now.
    pub fn break_block(
        user_id: Uuid,
        now: DateTime<Utc>,
        work_minutes: i32,
        break_minutes: i32,
    ) -> Self {
        Self {
            user_id,
            kind: SessionKind::Break,
            status: SessionStatus::Active,
            started_at: now,
            planned_end: now + Duration::minutes(break_minutes as i64),
            summary: None,
            backfill: false,
            cycle_work_minutes: work_minutes,
            cycle_break_minutes: break_minutes,
        }
    }

    /// A historical work block entered after the fact. Inserted directly as
    /// completed, bypassing the one-active-session rule: it was never live.
    pub fn backfilled(
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        description: &str,
    ) -> Self {
        let minutes = ((end - start).num_seconds() / 60).max(0) as i32;
        Self {
            user_id,
            kind: SessionKind::Work,
            status: SessionStatus::Completed,
            started_at: start,
            planned_end: end,
            summary: Some(description.to_string()),
            backfill: true,
            cycle_work_minutes: minutes,
            cycle_break_minutes: 0,
        }
    }
}

/// The next block after an expired session: work rolls into a break, a break
/// rolls into the next work block, carrying the cycle lengths forward.
pub fn rollover(expired: &Session, now: DateTime<Utc>) -> NewSession {
    match expired.kind {
        SessionKind::Work => NewSession::break_block(
            expired.user_id,
            now,
            expired.cycle_work_minutes,
            expired.cycle_break_minutes,
        ),
        SessionKind::Break => NewSession::work_block(
            expired.user_id,
            now,
            expired.cycle_work_minutes,
            expired.cycle_break_minutes,
        ),
    }
}

/// Parse cycle lengths from a start message.
///
/// "start 45 10" is 45 minutes of work and a 10-minute break; a single
/// number overrides only the work length; no numbers means the caller's
/// defaults.
pub fn parse_cycle(message: &str, default_work: i32, default_break: i32) -> (i32, i32) {
    let numbers: Vec<i32> = digits_re()
        .find_iter(message)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    match numbers.as_slice() {
        [] => (default_work, default_break),
        [work] => (*work, default_break),
        [work, rest, ..] => (*work, *rest),
    }
}

/// First integer in a message, for numbered-list replies like "done 2".
pub fn first_number(message: &str) -> Option<i64> {
    digits_re()
        .find(message)
        .and_then(|m| m.as_str().parse().ok())
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("static regex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn active(kind: SessionKind, work: i32, rest: i32) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind,
            status: SessionStatus::Active,
            started_at: now - Duration::minutes(30),
            planned_end: now - Duration::minutes(1),
            ended_at: None,
            summary: None,
            backfill: false,
            cycle_work_minutes: work,
            cycle_break_minutes: rest,
        }
    }

    #[test]
    fn test_parse_cycle_defaults() {
        assert_eq!(parse_cycle("start", 25, 5), (25, 5));
        assert_eq!(parse_cycle("let's focus", 45, 15), (45, 15));
    }

    #[test]
    fn test_parse_cycle_single_number() {
        assert_eq!(parse_cycle("start 50", 25, 5), (50, 5));
    }

    #[test]
    fn test_parse_cycle_both_numbers() {
        assert_eq!(parse_cycle("start 45 10", 25, 5), (45, 10));
    }

    #[test]
    fn test_work_block_planned_end() {
        let now = Utc::now();
        let block = NewSession::work_block(Uuid::new_v4(), now, 45, 10);
        assert_eq!(block.kind, SessionKind::Work);
        assert_eq!(block.status, SessionStatus::Active);
        assert_eq!(block.planned_end, now + Duration::minutes(45));
        assert_eq!(block.cycle_break_minutes, 10);
    }

    #[test]
    fn test_rollover_work_to_break() {
        let expired = active(SessionKind::Work, 45, 10);
        let now = Utc::now();
        let next = rollover(&expired, now);
        assert_eq!(next.kind, SessionKind::Break);
        assert_eq!(next.planned_end, now + Duration::minutes(10));
        assert_eq!(next.cycle_work_minutes, 45);
    }

    #[test]
    fn test_rollover_break_to_work() {
        let expired = active(SessionKind::Break, 45, 10);
        let now = Utc::now();
        let next = rollover(&expired, now);
        assert_eq!(next.kind, SessionKind::Work);
        assert_eq!(next.planned_end, now + Duration::minutes(45));
    }

    #[test]
    fn test_backfill_is_completed_and_flagged() {
        let end = Utc::now();
        let start = end - Duration::minutes(90);
        let block = NewSession::backfilled(Uuid::new_v4(), start, end, "deep work");
        assert_eq!(block.status, SessionStatus::Completed);
        assert!(block.backfill);
        assert_eq!(block.cycle_work_minutes, 90);
        assert_eq!(block.summary.as_deref(), Some("deep work"));
    }

    #[test]
    fn test_is_expired() {
        let session = active(SessionKind::Work, 25, 5);
        assert!(session.is_expired(Utc::now()));
        assert!(!session.is_expired(session.planned_end - Duration::minutes(5)));
    }

    #[test]
    fn test_first_number() {
        assert_eq!(first_number("done 3"), Some(3));
        assert_eq!(first_number("3"), Some(3));
        assert_eq!(first_number("the first one"), None);
    }
}
