//! Timer scheduler.
//!
//! One background loop ticking at a fixed interval. Each tick scans, in
//! order: active sessions past their planned end, due task reminders, and
//! unanswered summary requests past the nudge threshold. Ticks never
//! overlap; an overrunning tick just delays the next one. Errors inside a
//! tick are logged and never escape the loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::channels::Notifier;
use crate::config::SchedulerConfig;
use crate::db::{Database, Task};
use crate::error::DatabaseError;
use crate::sessions::{self, Session, SessionKind, SessionStatus};
use crate::state::ConversationState;
use crate::trace::traced;

/// Drives session rollover, task reminders, and summary nudges.
pub struct Scheduler {
    db: Arc<dyn Database>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(db: Arc<dyn Database>, notifier: Arc<dyn Notifier>, config: SchedulerConfig) -> Self {
        Self {
            db,
            notifier,
            config,
        }
    }

    /// Spawn the scheduler loop as a background task.
    ///
    /// Send `true` on the watch channel to stop; an in-flight tick always
    /// finishes first.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    /// Run the tick loop until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "timer scheduler started, polling every {:?}",
            self.config.poll_interval
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick resolves immediately; consume it so the first scan
        // happens one interval after startup.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Runs to completion before shutdown is observed again,
                    // so stopping never truncates a tick.
                    self.tick(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    // A closed channel means the handle owner is gone; stop
                    // rather than spinning on a dead receiver.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("timer scheduler stopped");
    }

    /// One full scan-and-act cycle. Each sub-scan catches its own errors; a
    /// scheduler fault must never take down the host process.
    pub async fn tick(&self, now: DateTime<Utc>) {
        if let Err(e) = traced("scan_sessions", None, self.expire_sessions(now)).await {
            tracing::error!("session expiry scan failed: {}", e);
        }
        if let Err(e) = traced("scan_reminders", None, self.send_reminders(now)).await {
            tracing::error!("reminder scan failed: {}", e);
        }
        if let Err(e) = traced("scan_nudges", None, self.nudge_summaries(now)).await {
            tracing::error!("nudge scan failed: {}", e);
        }
    }

    /// Roll over every active session whose planned end has passed.
    async fn expire_sessions(&self, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        let sessions = self.db.active_sessions().await?;
        for session in sessions.iter().filter(|s| s.is_expired(now)) {
            if let Err(e) = self.expire_one(session, now).await {
                tracing::warn!(session_id = %session.id, "session rollover failed: {:#}", e);
            }
        }
        Ok(())
    }

    async fn expire_one(&self, session: &Session, now: DateTime<Utc>) -> anyhow::Result<()> {
        let user = self
            .db
            .get_user(session.user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user {} missing for session", session.user_id))?;

        self.db
            .close_session(session.id, SessionStatus::Completed, now)
            .await?;
        let next = sessions::rollover(session, now);
        self.db.insert_session(&next).await?;

        match session.kind {
            SessionKind::Work => {
                self.notifier
                    .send(
                        &user.phone_number,
                        &format!(
                            "⏱ Work block complete! Take a {}-minute break.\nQuick check-in — what did you work on?",
                            next.cycle_break_minutes
                        ),
                        None,
                    )
                    .await?;
                self.db
                    .save_state(user.id, &ConversationState::AwaitingPomodoroSummary {
                        session_id: session.id,
                        requested_at: now,
                        nudged: false,
                    })
                    .await?;
            }
            SessionKind::Break => {
                // Next focus block rolls automatically; pending state is
                // whatever the conversation left there.
                self.notifier
                    .send(
                        &user.phone_number,
                        &format!(
                            "✅ Break over. Starting a {}-minute focus block now.\nSend 'stop' anytime to end.",
                            next.cycle_work_minutes
                        ),
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Send every due reminder, then mark it sent. A crash between the two
    /// duplicates a reminder; it never silently drops one.
    async fn send_reminders(&self, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        let due = self.db.due_reminders(now).await?;
        for task in &due {
            if let Err(e) = self.remind_one(task).await {
                tracing::warn!(task_id = %task.id, "reminder failed: {:#}", e);
            }
        }
        Ok(())
    }

    async fn remind_one(&self, task: &Task) -> anyhow::Result<()> {
        let user = self
            .db
            .get_user(task.user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user {} missing for task", task.user_id))?;
        self.notifier
            .send(
                &user.phone_number,
                &format!("⏰ Reminder: {}", task.title),
                None,
            )
            .await?;
        self.db.mark_reminder_sent(task.id).await?;
        Ok(())
    }

    /// Nudge users whose summary request went unanswered past the
    /// threshold. At most once per continuation episode: `nudged` flips to
    /// true in the same payload.
    async fn nudge_summaries(&self, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        let nudge_after = chrono::Duration::from_std(self.config.nudge_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));

        let states = self.db.states_awaiting_summary().await?;
        for (user_id, state) in states {
            let ConversationState::AwaitingPomodoroSummary {
                session_id,
                requested_at,
                nudged,
            } = state
            else {
                continue;
            };
            if nudged || now - requested_at < nudge_after {
                continue;
            }
            if let Err(e) = self.nudge_one(user_id, session_id, requested_at).await {
                tracing::warn!(user_id = %user_id, "nudge failed: {:#}", e);
            }
        }
        Ok(())
    }

    async fn nudge_one(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        requested_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let user = self
            .db
            .get_user(user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user {} missing for nudge", user_id))?;
        self.notifier
            .send(
                &user.phone_number,
                "Quick reminder — what did you work on in that last focus session?",
                None,
            )
            .await?;
        self.db
            .save_state(user_id, &ConversationState::AwaitingPomodoroSummary {
                session_id,
                requested_at,
                nudged: true,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::User;
    use crate::sessions::NewSession;
    use crate::testutil::{MemoryDb, RecordingNotifier};
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use std::time::Duration as StdDuration;

    struct Fixture {
        db: Arc<MemoryDb>,
        notifier: Arc<RecordingNotifier>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(MemoryDb::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let scheduler = Scheduler::new(
            db.clone(),
            notifier.clone(),
            SchedulerConfig {
                poll_interval: StdDuration::from_secs(30),
                nudge_after: StdDuration::from_secs(120),
            },
        );
        Fixture {
            db,
            notifier,
            scheduler,
        }
    }

    async fn seed_expired_session(
        db: &MemoryDb,
        user: &User,
        kind: SessionKind,
        now: DateTime<Utc>,
    ) -> Session {
        let new = match kind {
            SessionKind::Work => NewSession::work_block(user.id, now - Duration::minutes(46), 45, 10),
            SessionKind::Break => {
                NewSession::break_block(user.id, now - Duration::minutes(11), 45, 10)
            }
        };
        db.insert_session(&new).await.unwrap()
    }

    #[tokio::test]
    async fn test_work_expiry_starts_break_and_requests_summary() {
        let f = fixture();
        let user = f.db.add_user("+15550001111");
        let now = Utc::now();
        let work = seed_expired_session(&f.db, &user, SessionKind::Work, now).await;

        f.scheduler.tick(now).await;

        let sessions = f.db.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(
            sessions[0].status,
            SessionStatus::Completed,
            "expired work session is closed"
        );
        let next = &sessions[1];
        assert_eq!(next.kind, SessionKind::Break);
        assert_eq!(next.status, SessionStatus::Active);
        assert_eq!((next.planned_end - next.started_at).num_minutes(), 10);

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("10-minute break"));

        match f.db.stored_state(user.id) {
            ConversationState::AwaitingPomodoroSummary {
                session_id,
                requested_at,
                nudged,
            } => {
                assert_eq!(session_id, work.id);
                assert_eq!(requested_at, now);
                assert!(!nudged);
            }
            other => panic!("expected summary continuation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_break_expiry_starts_work_and_keeps_pending() {
        let f = fixture();
        let user = f.db.add_user("+15550001111");
        let pending = ConversationState::AwaitingCalorieConfirm {
            estimate: Default::default(),
        };
        f.db.save_state(user.id, &pending).await.unwrap();
        let now = Utc::now();
        seed_expired_session(&f.db, &user, SessionKind::Break, now).await;

        f.scheduler.tick(now).await;

        let sessions = f.db.sessions();
        assert_eq!(sessions.len(), 2);
        let next = &sessions[1];
        assert_eq!(next.kind, SessionKind::Work);
        assert_eq!((next.planned_end - next.started_at).num_minutes(), 45);

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("45-minute focus block"));

        assert_eq!(
            f.db.stored_state(user.id),
            pending,
            "break rollover leaves pending state untouched"
        );
    }

    #[tokio::test]
    async fn test_unexpired_session_is_left_alone() {
        let f = fixture();
        let user = f.db.add_user("+15550001111");
        let now = Utc::now();
        f.db.insert_session(&NewSession::work_block(user.id, now, 45, 10))
            .await
            .unwrap();

        f.scheduler.tick(now).await;

        assert_eq!(f.db.sessions().len(), 1);
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_reminder_sends_once() {
        let f = fixture();
        let user = f.db.add_user("+15550001111");
        let now = Utc::now();
        f.db.seed_task(user.id, "submit expenses", Some(now - Duration::minutes(1)));

        f.scheduler.tick(now).await;
        f.scheduler.tick(now + Duration::minutes(1)).await;

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1, "reminder fires exactly once");
        assert_eq!(sent[0].body, "⏰ Reminder: submit expenses");
        assert!(f.db.tasks()[0].reminder_sent);
    }

    #[tokio::test]
    async fn test_future_reminder_not_sent() {
        let f = fixture();
        let user = f.db.add_user("+15550001111");
        let now = Utc::now();
        f.db.seed_task(user.id, "submit expenses", Some(now + Duration::minutes(30)));

        f.scheduler.tick(now).await;

        assert!(f.notifier.sent().is_empty());
        assert!(!f.db.tasks()[0].reminder_sent);
    }

    #[tokio::test]
    async fn test_nudge_fires_once_per_episode() {
        let f = fixture();
        let user = f.db.add_user("+15550001111");
        let now = Utc::now();
        let requested_at = now - Duration::seconds(125);
        f.db.save_state(user.id, &ConversationState::AwaitingPomodoroSummary {
            session_id: Uuid::new_v4(),
            requested_at,
            nudged: false,
        })
        .await
        .unwrap();

        f.scheduler.tick(now).await;

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("what did you work on"));
        match f.db.stored_state(user.id) {
            ConversationState::AwaitingPomodoroSummary {
                nudged,
                requested_at: kept,
                ..
            } => {
                assert!(nudged);
                assert_eq!(kept, requested_at, "payload keeps its requested_at");
            }
            other => panic!("expected summary continuation, got {other:?}"),
        }

        // Another 125 seconds of silence: no second nudge.
        f.scheduler.tick(now + Duration::seconds(125)).await;
        assert_eq!(f.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_nudge_respects_threshold() {
        let f = fixture();
        let user = f.db.add_user("+15550001111");
        let now = Utc::now();
        f.db.save_state(user.id, &ConversationState::AwaitingPomodoroSummary {
            session_id: Uuid::new_v4(),
            requested_at: now - Duration::seconds(60),
            nudged: false,
        })
        .await
        .unwrap();

        f.scheduler.tick(now).await;

        assert!(f.notifier.sent().is_empty(), "60s is under the threshold");
    }

    #[tokio::test]
    async fn test_per_item_failure_does_not_abort_scan() {
        let f = fixture();
        let failing = f.db.add_user("+15550009999");
        let healthy = f.db.add_user("+15550001111");
        f.notifier.fail_for(&failing.phone_number);
        let now = Utc::now();
        f.db.seed_task(failing.id, "first", Some(now - Duration::minutes(2)));
        f.db.seed_task(healthy.id, "second", Some(now - Duration::minutes(1)));

        f.scheduler.tick(now).await;

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1, "healthy user still got their reminder");
        assert_eq!(sent[0].phone_number, healthy.phone_number);

        let tasks = f.db.tasks();
        let first = tasks.iter().find(|t| t.title == "first").unwrap();
        let second = tasks.iter().find(|t| t.title == "second").unwrap();
        assert!(!first.reminder_sent, "failed send leaves the flag unset");
        assert!(second.reminder_sent);
    }

    #[tokio::test]
    async fn test_storage_outage_is_contained() {
        let f = fixture();
        f.db.add_user("+15550001111");
        f.db.fail_storage();

        // Must not panic; errors are logged and the loop would retry.
        f.scheduler.tick(Utc::now()).await;
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let handle = f.scheduler.spawn(rx);

        tx.send(true).unwrap();
        tokio::time::timeout(StdDuration::from_secs(1), handle)
            .await
            .expect("scheduler loop exits on shutdown signal")
            .unwrap();
    }
}
