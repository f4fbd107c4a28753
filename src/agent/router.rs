//! Turn dispatcher.
//!
//! Resolves exactly one action per inbound message with strict precedence:
//! onboarding gate, then the pending continuation, then attached media, then
//! literal commands, then the intent classifier. Deterministic commands
//! never wait on the classifier.
//!
//! Every turn ends with exactly one conversation-state write. A turn that
//! cannot reach storage replies with an apology and performs no side effect.

use std::sync::Arc;

use chrono::Utc;

use crate::agent::{calories, onboarding, pomodoro, tasks};
use crate::channels::Notifier;
use crate::config::CycleDefaults;
use crate::db::{Database, User};
use crate::error::DatabaseError;
use crate::llm::{Intent, Llm};
use crate::sessions::first_number;
use crate::state::ConversationState;
use crate::trace::traced;

const STORAGE_APOLOGY: &str =
    "I'm having trouble reaching my memory right now. Please try again in a minute.";

const FALLBACK: &str =
    "I can help with focus, tasks, and calories. Try: start, tasks, calories, /help.";

/// The result of one dispatched action: the reply and the state the user is
/// left in.
#[derive(Debug)]
struct Turn {
    reply: String,
    next: ConversationState,
}

impl Turn {
    fn new(reply: impl Into<String>, next: ConversationState) -> Self {
        Self {
            reply: reply.into(),
            next,
        }
    }
}

/// Routes each inbound message to exactly one action.
pub struct Dispatcher {
    db: Arc<dyn Database>,
    llm: Arc<dyn Llm>,
    notifier: Arc<dyn Notifier>,
    cycles: CycleDefaults,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        llm: Arc<dyn Llm>,
        notifier: Arc<dyn Notifier>,
        cycles: CycleDefaults,
    ) -> Self {
        Self {
            db,
            llm,
            notifier,
            cycles,
        }
    }

    /// Handle one inbound message and produce the reply text.
    pub async fn handle_message(
        &self,
        phone_number: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> String {
        traced(
            "route_message",
            Some(phone_number),
            self.handle_inner(phone_number, body, media_url),
        )
        .await
    }

    async fn handle_inner(&self, phone_number: &str, body: &str, media_url: Option<&str>) -> String {
        let user = match self.db.get_or_create_user(phone_number).await {
            Ok(user) => user,
            Err(e) => {
                tracing::error!("could not load user: {}", e);
                return STORAGE_APOLOGY.to_string();
            }
        };
        let prior = match self.db.load_state(user.id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("could not load conversation state: {}", e);
                return STORAGE_APOLOGY.to_string();
            }
        };

        let message = body.trim();
        let turn = match self.dispatch(&user, &prior, message, media_url).await {
            Ok(turn) => turn,
            Err(e) => {
                tracing::error!("turn aborted: {}", e);
                return STORAGE_APOLOGY.to_string();
            }
        };

        if let Err(e) = self.db.save_state(user.id, &turn.next).await {
            tracing::error!("could not save conversation state: {}", e);
            return STORAGE_APOLOGY.to_string();
        }
        turn.reply
    }

    async fn dispatch(
        &self,
        user: &User,
        prior: &ConversationState,
        message: &str,
        media_url: Option<&str>,
    ) -> Result<Turn, DatabaseError> {
        let phone = user.phone_number.as_str();

        // Onboarding owns the conversation until it completes, and the
        // restart command re-enters it at any time.
        if !user.onboarding_complete || message.eq_ignore_ascii_case(onboarding::RESTART_COMMAND) {
            let (reply, next) = traced(
                "onboarding",
                Some(phone),
                onboarding::handle(self.db.as_ref(), user, message),
            )
            .await?;
            return Ok(Turn::new(reply, next));
        }

        // The pending continuation gets first claim on the message.
        if let Some(turn) = self.try_continuation(user, prior, message).await? {
            return Ok(turn);
        }

        // Media is always a meal photo, no classification involved.
        if let Some(url) = media_url {
            return self.media_meal(user, prior, url).await;
        }

        // Literal commands are resolved before (and without) the classifier.
        if let Some(turn) = self.try_command(user, prior, message).await? {
            return Ok(turn);
        }

        self.classified(user, prior, message).await
    }

    /// Offer the message to the matching continuation handler. `None` means
    /// not consumed and processing falls through to normal routing.
    async fn try_continuation(
        &self,
        user: &User,
        prior: &ConversationState,
        message: &str,
    ) -> Result<Option<Turn>, DatabaseError> {
        let phone = user.phone_number.as_str();
        match prior {
            ConversationState::AwaitingPomodoroSummary { session_id, .. } => {
                let reply = traced(
                    "pomodoro_summary",
                    Some(phone),
                    pomodoro::attach_summary(self.db.as_ref(), *session_id, message),
                )
                .await?;
                Ok(Some(Turn::new(reply, ConversationState::Idle)))
            }
            ConversationState::AwaitingCalorieConfirm { estimate } => {
                let (reply, next) = traced(
                    "calorie_confirm",
                    Some(phone),
                    calories::handle_confirmation(self.db.as_ref(), &self.llm, user, message, estimate),
                )
                .await?;
                Ok(Some(Turn::new(reply, next)))
            }
            ConversationState::AwaitingTaskCompletion { task_ids } => {
                let Some(number) = first_number(message) else {
                    return Ok(None);
                };
                let Some(task_id) = tasks::index_into(task_ids, number) else {
                    return Ok(None);
                };
                let reply = traced(
                    "task_complete",
                    Some(phone),
                    tasks::complete_task(self.db.as_ref(), task_id),
                )
                .await?;
                Ok(Some(Turn::new(reply, ConversationState::Idle)))
            }
            ConversationState::Idle | ConversationState::Onboarding => Ok(None),
        }
    }

    /// A message with media is a meal photo, unconditionally.
    async fn media_meal(
        &self,
        user: &User,
        prior: &ConversationState,
        media_url: &str,
    ) -> Result<Turn, DatabaseError> {
        let data_url = match self.notifier.fetch_media_data_url(media_url).await {
            Ok(data_url) => data_url,
            Err(e) => {
                tracing::warn!("media download failed: {}", e);
                return Ok(Turn::new(
                    "I couldn't download that photo. Mind sending it again?",
                    prior.clone(),
                ));
            }
        };

        let preferences = user.dietary_preferences.clone().unwrap_or_default();
        match traced(
            "calorie_photo",
            Some(&user.phone_number),
            self.llm.estimate_calories_image(&data_url, &preferences),
        )
        .await
        {
            Ok(estimate) => {
                let (reply, next) = calories::confirmation_turn(estimate);
                Ok(Turn::new(reply, next))
            }
            Err(e) => {
                tracing::warn!("photo estimation failed: {}", e);
                Ok(Turn::new(
                    "I couldn't read that photo as a meal. Try a text description?",
                    prior.clone(),
                ))
            }
        }
    }

    /// Literal command prefixes, checked before the classifier.
    async fn try_command(
        &self,
        user: &User,
        prior: &ConversationState,
        message: &str,
    ) -> Result<Option<Turn>, DatabaseError> {
        let phone = user.phone_number.as_str();
        let lowered = message.to_lowercase();

        if lowered == "/help" || lowered == "help" {
            return Ok(Some(Turn::new(help_text(), ConversationState::Idle)));
        }
        if lowered.starts_with("start") {
            let reply = traced(
                "pomodoro_start",
                Some(phone),
                pomodoro::start(self.db.as_ref(), user, message, Utc::now(), self.cycles),
            )
            .await?;
            return Ok(Some(Turn::new(reply, ConversationState::Idle)));
        }
        if lowered.starts_with("stop") {
            let (reply, next) = traced(
                "pomodoro_stop",
                Some(phone),
                pomodoro::stop(self.db.as_ref(), user, Utc::now()),
            )
            .await?;
            return Ok(Some(Turn::new(reply, next.unwrap_or_else(|| prior.clone()))));
        }
        if lowered.starts_with("stats") {
            let reply = traced(
                "pomodoro_stats",
                Some(phone),
                pomodoro::stats(self.db.as_ref(), user, Utc::now()),
            )
            .await?;
            return Ok(Some(Turn::new(reply, ConversationState::Idle)));
        }
        if lowered.starts_with("tasks") {
            let (reply, next) = traced(
                "task_list",
                Some(phone),
                tasks::list_tasks(self.db.as_ref(), user),
            )
            .await?;
            return Ok(Some(Turn::new(reply, next)));
        }
        if lowered.starts_with("done") {
            return Ok(Some(self.done_command(prior, message).await?));
        }
        if lowered.starts_with("calories") {
            let reply = traced(
                "calorie_summary",
                Some(phone),
                calories::daily_summary(self.db.as_ref(), user, Utc::now()),
            )
            .await?;
            return Ok(Some(Turn::new(reply, ConversationState::Idle)));
        }
        if lowered.starts_with("goal") {
            let reply = traced(
                "calorie_goal",
                Some(phone),
                calories::update_goal(self.db.as_ref(), user, message),
            )
            .await?;
            return Ok(Some(Turn::new(reply, ConversationState::Idle)));
        }
        Ok(None)
    }

    async fn done_command(
        &self,
        prior: &ConversationState,
        message: &str,
    ) -> Result<Turn, DatabaseError> {
        let Some(number) = first_number(message) else {
            return Ok(Turn::new(
                "Reply with a number to mark a task done (e.g. done 1).",
                prior.clone(),
            ));
        };
        match prior {
            ConversationState::AwaitingTaskCompletion { task_ids } => {
                match tasks::index_into(task_ids, number) {
                    Some(task_id) => {
                        let reply = tasks::complete_task(self.db.as_ref(), task_id).await?;
                        Ok(Turn::new(reply, ConversationState::Idle))
                    }
                    None => Ok(Turn::new(
                        "That number doesn't match your current task list.",
                        prior.clone(),
                    )),
                }
            }
            _ => Ok(Turn::new(
                "I don't have an active task list. Send 'tasks' first.",
                prior.clone(),
            )),
        }
    }

    /// Everything else goes through the intent classifier.
    async fn classified(
        &self,
        user: &User,
        prior: &ConversationState,
        message: &str,
    ) -> Result<Turn, DatabaseError> {
        let phone = user.phone_number.as_str();
        let intent = match traced(
            "classify_intent",
            Some(phone),
            self.llm.classify_intent(message, prior.tag()),
        )
        .await
        {
            Ok(intent) => intent,
            Err(e) => {
                tracing::warn!("intent classification failed: {}", e);
                return Ok(Turn::new(FALLBACK, prior.clone()));
            }
        };

        match intent {
            Intent::PomodoroStart => {
                let reply = traced(
                    "pomodoro_start",
                    Some(phone),
                    pomodoro::start(self.db.as_ref(), user, message, Utc::now(), self.cycles),
                )
                .await?;
                Ok(Turn::new(reply, ConversationState::Idle))
            }
            Intent::PomodoroStop => {
                let (reply, next) = traced(
                    "pomodoro_stop",
                    Some(phone),
                    pomodoro::stop(self.db.as_ref(), user, Utc::now()),
                )
                .await?;
                Ok(Turn::new(reply, next.unwrap_or_else(|| prior.clone())))
            }
            Intent::PomodoroStats => {
                let reply = traced(
                    "pomodoro_stats",
                    Some(phone),
                    pomodoro::stats(self.db.as_ref(), user, Utc::now()),
                )
                .await?;
                Ok(Turn::new(reply, ConversationState::Idle))
            }
            Intent::PomodoroBackfill => {
                let reply = traced(
                    "pomodoro_backfill",
                    Some(phone),
                    pomodoro::backfill(self.db.as_ref(), &self.llm, user, message),
                )
                .await?;
                Ok(Turn::new(reply, ConversationState::Idle))
            }
            Intent::TaskAdd => {
                let reply = traced(
                    "task_add",
                    Some(phone),
                    tasks::add_task(self.db.as_ref(), &self.llm, user, message),
                )
                .await?;
                Ok(Turn::new(reply, ConversationState::Idle))
            }
            Intent::TaskList => {
                let (reply, next) = traced(
                    "task_list",
                    Some(phone),
                    tasks::list_tasks(self.db.as_ref(), user),
                )
                .await?;
                Ok(Turn::new(reply, next))
            }
            Intent::TaskComplete => {
                if let ConversationState::AwaitingTaskCompletion { task_ids } = prior {
                    if let Some(task_id) =
                        first_number(message).and_then(|n| tasks::index_into(task_ids, n))
                    {
                        let reply = tasks::complete_task(self.db.as_ref(), task_id).await?;
                        return Ok(Turn::new(reply, ConversationState::Idle));
                    }
                }
                Ok(Turn::new(
                    "Reply with the number from your task list to mark it done.",
                    prior.clone(),
                ))
            }
            Intent::CalorieLog => {
                let preferences = user.dietary_preferences.clone().unwrap_or_default();
                match traced(
                    "calorie_log",
                    Some(phone),
                    self.llm.estimate_calories_text(message, &preferences),
                )
                .await
                {
                    Ok(estimate) => {
                        let (reply, next) = calories::confirmation_turn(estimate);
                        Ok(Turn::new(reply, next))
                    }
                    Err(e) => {
                        tracing::warn!("calorie estimation failed: {}", e);
                        Ok(Turn::new(
                            "I couldn't estimate that meal. Try describing it differently.",
                            prior.clone(),
                        ))
                    }
                }
            }
            Intent::CalorieSummary => {
                let reply = traced(
                    "calorie_summary",
                    Some(phone),
                    calories::daily_summary(self.db.as_ref(), user, Utc::now()),
                )
                .await?;
                Ok(Turn::new(reply, ConversationState::Idle))
            }
            Intent::CalorieGoal => {
                let reply = traced(
                    "calorie_goal",
                    Some(phone),
                    calories::update_goal(self.db.as_ref(), user, message),
                )
                .await?;
                Ok(Turn::new(reply, ConversationState::Idle))
            }
            Intent::Help => Ok(Turn::new(help_text(), ConversationState::Idle)),
            Intent::GeneralChat | Intent::Other => Ok(Turn::new(FALLBACK, prior.clone())),
        }
    }
}

fn help_text() -> String {
    "Quick commands:\n\
     • start — begin a focus cycle\n\
     • start 45 10 — custom work/break\n\
     • stop — end the current cycle\n\
     • stats — today's focus summary\n\
     • tasks — list open tasks\n\
     • done 1 — complete a task\n\
     • calories — daily calorie summary\n\
     • goal 2000 — set a calorie goal\n\
     • /onboarding — re-run setup\n\
     • /help — show this menu"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::CalorieEstimate;
    use crate::sessions::{SessionKind, SessionStatus};
    use crate::testutil::{MemoryDb, MockLlm, RecordingNotifier};
    use pretty_assertions::assert_eq;

    struct Fixture {
        db: Arc<MemoryDb>,
        llm: Arc<MockLlm>,
        #[allow(dead_code)]
        notifier: Arc<RecordingNotifier>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(MemoryDb::new());
        let llm = Arc::new(MockLlm::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let dispatcher = Dispatcher::new(
            db.clone(),
            llm.clone(),
            notifier.clone(),
            CycleDefaults::default(),
        );
        Fixture {
            db,
            llm,
            notifier,
            dispatcher,
        }
    }

    const PHONE: &str = "+15551230001";

    #[tokio::test]
    async fn test_start_with_custom_cycle() {
        let f = fixture();
        let user = f.db.add_user(PHONE);

        let reply = f.dispatcher.handle_message(PHONE, "start 45 10", None).await;

        assert!(reply.contains("45 minutes"), "reply was: {reply}");
        let sessions = f.db.sessions();
        assert_eq!(sessions.len(), 1);
        let session = &sessions[0];
        assert_eq!(session.kind, SessionKind::Work);
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(
            (session.planned_end - session.started_at).num_minutes(),
            45
        );
        assert_eq!(session.cycle_break_minutes, 10);
        assert_eq!(f.db.stored_state(user.id), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_start_cancels_prior_active_session() {
        let f = fixture();
        f.db.add_user(PHONE);

        f.dispatcher.handle_message(PHONE, "start 25 5", None).await;
        f.dispatcher.handle_message(PHONE, "start 45 10", None).await;

        let sessions = f.db.sessions();
        assert_eq!(sessions.len(), 2);
        let active: Vec<_> = sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .collect();
        assert_eq!(active.len(), 1, "at most one active session per user");
        assert_eq!(
            sessions[0].status,
            SessionStatus::Cancelled,
            "first session is force-cancelled by the second start"
        );
        assert!(sessions[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn test_stop_with_no_active_session_keeps_pending() {
        let f = fixture();
        let user = f.db.add_user(PHONE);
        let pending = ConversationState::AwaitingTaskCompletion {
            task_ids: vec![uuid::Uuid::new_v4()],
        };
        f.db.save_state(user.id, &pending).await.unwrap();

        let reply = f.dispatcher.handle_message(PHONE, "stop", None).await;

        assert_eq!(reply, "No active session to stop.");
        assert_eq!(f.db.stored_state(user.id), pending);
    }

    #[tokio::test]
    async fn test_stop_cancels_and_requests_summary() {
        let f = fixture();
        let user = f.db.add_user(PHONE);
        f.dispatcher.handle_message(PHONE, "start", None).await;

        let reply = f.dispatcher.handle_message(PHONE, "stop", None).await;

        assert!(reply.contains("What were you working on?"));
        let sessions = f.db.sessions();
        assert_eq!(sessions[0].status, SessionStatus::Cancelled);
        match f.db.stored_state(user.id) {
            ConversationState::AwaitingPomodoroSummary {
                session_id, nudged, ..
            } => {
                assert_eq!(session_id, sessions[0].id);
                assert!(!nudged);
            }
            other => panic!("expected summary continuation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_summary_continuation_consumes_any_text() {
        let f = fixture();
        let user = f.db.add_user(PHONE);
        f.dispatcher.handle_message(PHONE, "start", None).await;
        f.dispatcher.handle_message(PHONE, "stop", None).await;

        let reply = f
            .dispatcher
            .handle_message(PHONE, "wrote the quarterly report", None)
            .await;

        assert_eq!(reply, "Nice. Logged your session summary.");
        assert_eq!(
            f.db.sessions()[0].summary.as_deref(),
            Some("wrote the quarterly report")
        );
        assert_eq!(f.db.stored_state(user.id), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_task_completion_by_index() {
        let f = fixture();
        let user = f.db.add_user(PHONE);
        let a = f.db.seed_task(user.id, "buy milk", None);
        let b = f.db.seed_task(user.id, "write notes", None);
        let c = f.db.seed_task(user.id, "call the bank", None);
        f.db.save_state(user.id, &ConversationState::AwaitingTaskCompletion {
            task_ids: vec![a.id, b.id, c.id],
        })
        .await
        .unwrap();

        let reply = f.dispatcher.handle_message(PHONE, "3", None).await;

        assert!(reply.contains("call the bank"));
        let tasks = f.db.tasks();
        assert!(tasks.iter().find(|t| t.id == c.id).unwrap().completed);
        assert!(!tasks.iter().find(|t| t.id == a.id).unwrap().completed);
        assert_eq!(f.db.stored_state(user.id), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_task_continuation_declines_non_numeric() {
        let f = fixture();
        let user = f.db.add_user(PHONE);
        let task = f.db.seed_task(user.id, "buy milk", None);
        let pending = ConversationState::AwaitingTaskCompletion {
            task_ids: vec![task.id],
        };
        f.db.save_state(user.id, &pending).await.unwrap();
        f.llm.set_intent(Intent::GeneralChat);

        let reply = f.dispatcher.handle_message(PHONE, "nevermind", None).await;

        // Fell through the continuation to the classifier fallback, and the
        // task list stayed pending.
        assert_eq!(reply, FALLBACK);
        assert_eq!(f.db.stored_state(user.id), pending);
        assert!(!f.db.tasks()[0].completed);
    }

    #[tokio::test]
    async fn test_media_is_always_a_meal_photo() {
        let f = fixture();
        let user = f.db.add_user(PHONE);
        f.llm.set_estimate(CalorieEstimate {
            description: Some("avocado toast".to_string()),
            calories: Some(420),
            ..Default::default()
        });

        let reply = f
            .dispatcher
            .handle_message(PHONE, "", Some("https://media.example/abc"))
            .await;

        assert!(reply.contains("avocado toast"));
        match f.db.stored_state(user.id) {
            ConversationState::AwaitingCalorieConfirm { estimate } => {
                assert_eq!(estimate.calories, Some(420));
            }
            other => panic!("expected calorie confirmation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_calorie_confirm_yes_saves_log() {
        let f = fixture();
        let user = f.db.add_user(PHONE);
        let estimate = CalorieEstimate {
            description: Some("ramen".to_string()),
            calories: Some(800),
            ..Default::default()
        };
        f.db.save_state(user.id, &ConversationState::AwaitingCalorieConfirm {
            estimate,
        })
        .await
        .unwrap();

        let reply = f.dispatcher.handle_message(PHONE, "yes", None).await;

        assert!(reply.contains("Logged: ramen"));
        let logs = f.db.calorie_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].confirmed);
        assert_eq!(logs[0].calories, Some(800));
        assert_eq!(f.db.stored_state(user.id), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_calorie_confirm_number_overrides() {
        let f = fixture();
        let user = f.db.add_user(PHONE);
        f.db.save_state(user.id, &ConversationState::AwaitingCalorieConfirm {
            estimate: CalorieEstimate {
                description: Some("ramen".to_string()),
                calories: Some(800),
                ..Default::default()
            },
        })
        .await
        .unwrap();

        f.dispatcher.handle_message(PHONE, "650", None).await;

        assert_eq!(f.db.calorie_logs()[0].calories, Some(650));
        assert_eq!(f.db.stored_state(user.id), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_calorie_confirm_no_discards() {
        let f = fixture();
        let user = f.db.add_user(PHONE);
        f.db.save_state(user.id, &ConversationState::AwaitingCalorieConfirm {
            estimate: CalorieEstimate {
                description: Some("ramen".to_string()),
                calories: Some(800),
                ..Default::default()
            },
        })
        .await
        .unwrap();

        let reply = f.dispatcher.handle_message(PHONE, "no", None).await;

        assert!(reply.contains("discarded"));
        assert!(f.db.calorie_logs().is_empty());
        assert_eq!(f.db.stored_state(user.id), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_calorie_confirm_correction_refines_estimate() {
        let f = fixture();
        let user = f.db.add_user(PHONE);
        f.db.save_state(user.id, &ConversationState::AwaitingCalorieConfirm {
            estimate: CalorieEstimate {
                description: Some("chicken salad".to_string()),
                calories: Some(450),
                ..Default::default()
            },
        })
        .await
        .unwrap();
        let revised = CalorieEstimate {
            description: Some("fried chicken salad".to_string()),
            calories: Some(700),
            ..Default::default()
        };
        f.llm.set_refined(revised.clone());

        let reply = f
            .dispatcher
            .handle_message(PHONE, "it was fried", None)
            .await;

        assert!(reply.contains("fried chicken salad"));
        assert!(reply.contains("700 cal"));
        assert!(f.db.calorie_logs().is_empty(), "nothing saved until confirmed");
        assert_eq!(
            f.db.stored_state(user.id),
            ConversationState::AwaitingCalorieConfirm { estimate: revised }
        );
    }

    #[tokio::test]
    async fn test_classified_task_add_uses_extraction() {
        let f = fixture();
        f.db.add_user(PHONE);
        f.llm.set_intent(Intent::TaskAdd);
        let reminder_at = Utc::now() + chrono::Duration::hours(3);
        f.llm.set_task(crate::llm::TaskDraft {
            title: Some("Call mom".to_string()),
            reminder_at: Some(reminder_at),
        });

        let reply = f
            .dispatcher
            .handle_message(PHONE, "remind me to call mom in 3 hours", None)
            .await;

        assert!(reply.contains("Task saved"));
        assert!(reply.contains("Reminder set"));
        let tasks = f.db.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Call mom");
        assert_eq!(tasks[0].reminder_at, Some(reminder_at));
        assert_eq!(tasks[0].raw_message, "remind me to call mom in 3 hours");
    }

    #[tokio::test]
    async fn test_task_add_extraction_failure_keeps_raw_text() {
        let f = fixture();
        f.db.add_user(PHONE);
        f.llm.set_intent(Intent::TaskAdd);
        // No canned draft: extraction errors and the raw message survives.

        let reply = f
            .dispatcher
            .handle_message(PHONE, "pick up the dry cleaning", None)
            .await;

        assert!(reply.contains("Task saved"));
        let tasks = f.db.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "pick up the dry cleaning");
        assert_eq!(tasks[0].reminder_at, None);
    }

    #[tokio::test]
    async fn test_backfill_leaves_active_session_untouched() {
        let f = fixture();
        f.db.add_user(PHONE);
        f.dispatcher.handle_message(PHONE, "start 25 5", None).await;
        f.llm.set_intent(Intent::PomodoroBackfill);
        let end = Utc::now() - chrono::Duration::hours(1);
        let start = end - chrono::Duration::minutes(90);
        f.llm.set_backfill(crate::llm::BackfillDraft {
            start: Some(start),
            end: Some(end),
            description: Some("deck review".to_string()),
        });

        let reply = f
            .dispatcher
            .handle_message(PHONE, "I worked on the deck earlier", None)
            .await;

        assert!(reply.contains("90 minutes"));
        assert!(reply.contains("deck review"));
        let sessions = f.db.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].status, SessionStatus::Active, "live session untouched");
        let logged = &sessions[1];
        assert_eq!(logged.status, SessionStatus::Completed);
        assert!(logged.backfill);
        assert_eq!(logged.summary.as_deref(), Some("deck review"));
    }

    #[tokio::test]
    async fn test_storage_unreachable_aborts_with_apology() {
        let f = fixture();
        f.db.add_user(PHONE);
        f.db.fail_storage();

        let reply = f.dispatcher.handle_message(PHONE, "start 45 10", None).await;

        assert_eq!(reply, STORAGE_APOLOGY);
        assert!(f.db.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_first_contact_enters_onboarding() {
        let f = fixture();

        let reply = f.dispatcher.handle_message(PHONE, "hi", None).await;

        assert!(reply.contains("What's your name?"), "reply was: {reply}");
        let user = f.db.get_or_create_user(PHONE).await.unwrap();
        assert_eq!(f.db.stored_state(user.id), ConversationState::Onboarding);
    }

    #[tokio::test]
    async fn test_classifier_fallback_on_unknown_intent() {
        let f = fixture();
        let user = f.db.add_user(PHONE);
        f.llm.set_intent(Intent::Other);

        let reply = f
            .dispatcher
            .handle_message(PHONE, "what's the weather", None)
            .await;

        assert_eq!(reply, FALLBACK);
        assert_eq!(f.db.stored_state(user.id), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_classified_start_creates_session() {
        let f = fixture();
        f.db.add_user(PHONE);
        f.llm.set_intent(Intent::PomodoroStart);

        let reply = f
            .dispatcher
            .handle_message(PHONE, "let's focus for a bit", None)
            .await;

        assert!(reply.contains("25 minutes"), "reply was: {reply}");
        assert_eq!(f.db.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_help_command_bypasses_classifier() {
        let f = fixture();
        f.db.add_user(PHONE);
        // Classifier would claim this is something else; it must not run.
        f.llm.set_intent(Intent::CalorieLog);

        let reply = f.dispatcher.handle_message(PHONE, "help", None).await;

        assert!(reply.contains("Quick commands"));
        assert!(f.db.calorie_logs().is_empty());
    }

    #[tokio::test]
    async fn test_tasks_command_sets_completion_map() {
        let f = fixture();
        let user = f.db.add_user(PHONE);
        let a = f.db.seed_task(user.id, "buy milk", None);
        let b = f.db.seed_task(user.id, "write notes", None);

        let reply = f.dispatcher.handle_message(PHONE, "tasks", None).await;

        assert!(reply.contains("1. buy milk"));
        assert!(reply.contains("2. write notes"));
        assert_eq!(
            f.db.stored_state(user.id),
            ConversationState::AwaitingTaskCompletion {
                task_ids: vec![a.id, b.id],
            }
        );
    }
}
