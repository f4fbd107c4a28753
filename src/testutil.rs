//! In-memory test doubles for the storage, notification, and language
//! collaborators. Test-only.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use uuid::Uuid;

use crate::channels::Notifier;
use crate::db::{CalorieLog, Database, NewCalorieLog, NewTask, Task, User, UserPatch};
use crate::error::{ChannelError, DatabaseError, LlmError};
use crate::llm::{BackfillDraft, CalorieEstimate, Intent, Llm, TaskDraft};
use crate::sessions::{NewSession, Session, SessionStatus};
use crate::state::ConversationState;

#[derive(Default)]
struct MemoryInner {
    users: Vec<User>,
    states: HashMap<Uuid, ConversationState>,
    sessions: Vec<Session>,
    tasks: Vec<Task>,
    calorie_logs: Vec<CalorieLog>,
}

/// In-memory [`Database`] with storage-failure injection.
#[derive(Default)]
pub struct MemoryDb {
    inner: Mutex<MemoryInner>,
    fail: AtomicBool,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `Unavailable`.
    pub fn fail_storage(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DatabaseError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DatabaseError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    /// Seed a fully onboarded user.
    pub fn add_user(&self, phone_number: &str) -> User {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            phone_number: phone_number.to_string(),
            name: Some("Test".to_string()),
            timezone: "UTC".to_string(),
            features_enabled: vec![
                "pomodoro".to_string(),
                "tasks".to_string(),
                "calories".to_string(),
            ],
            default_work_minutes: 25,
            default_break_minutes: 5,
            daily_calorie_goal: None,
            dietary_preferences: None,
            onboarding_step: Some("done".to_string()),
            onboarding_complete: true,
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().unwrap().users.push(user.clone());
        user
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.lock().unwrap().sessions.clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.lock().unwrap().tasks.clone()
    }

    pub fn calorie_logs(&self) -> Vec<CalorieLog> {
        self.inner.lock().unwrap().calorie_logs.clone()
    }

    pub fn stored_state(&self, user_id: Uuid) -> ConversationState {
        self.inner
            .lock()
            .unwrap()
            .states
            .get(&user_id)
            .cloned()
            .unwrap_or(ConversationState::Idle)
    }

    /// Insert a task row directly, bypassing extraction.
    pub fn seed_task(&self, user_id: Uuid, title: &str, reminder_at: Option<DateTime<Utc>>) -> Task {
        let task = Task {
            id: Uuid::new_v4(),
            user_id,
            title: title.to_string(),
            raw_message: title.to_string(),
            reminder_at,
            reminder_sent: false,
            completed: false,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.inner.lock().unwrap().tasks.push(task.clone());
        task
    }
}

#[async_trait]
impl Database for MemoryDb {
    async fn get_or_create_user(&self, phone_number: &str) -> Result<User, DatabaseError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(user) = inner.users.iter().find(|u| u.phone_number == phone_number) {
            return Ok(user.clone());
        }
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            phone_number: phone_number.to_string(),
            name: None,
            timezone: "UTC".to_string(),
            features_enabled: Vec::new(),
            default_work_minutes: 25,
            default_break_minutes: 5,
            daily_calorie_goal: None,
            dietary_preferences: None,
            onboarding_step: None,
            onboarding_complete: false,
            created_at: now,
            updated_at: now,
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, DatabaseError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|u| u.id == id)
            .cloned())
    }

    async fn update_user(&self, id: Uuid, patch: UserPatch) -> Result<User, DatabaseError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let user = inner
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(DatabaseError::NotFound { entity: "user" })?;
        if let Some(v) = patch.name {
            user.name = Some(v);
        }
        if let Some(v) = patch.timezone {
            user.timezone = v;
        }
        if let Some(v) = patch.features_enabled {
            user.features_enabled = v;
        }
        if let Some(v) = patch.default_work_minutes {
            user.default_work_minutes = v;
        }
        if let Some(v) = patch.default_break_minutes {
            user.default_break_minutes = v;
        }
        if let Some(v) = patch.daily_calorie_goal {
            user.daily_calorie_goal = Some(v);
        }
        if let Some(v) = patch.dietary_preferences {
            user.dietary_preferences = Some(v);
        }
        if let Some(v) = patch.onboarding_step {
            user.onboarding_step = Some(v);
        }
        if let Some(v) = patch.onboarding_complete {
            user.onboarding_complete = v;
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn load_state(&self, user_id: Uuid) -> Result<ConversationState, DatabaseError> {
        self.check()?;
        Ok(self.stored_state(user_id))
    }

    async fn save_state(
        &self,
        user_id: Uuid,
        state: &ConversationState,
    ) -> Result<(), DatabaseError> {
        self.check()?;
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(user_id, state.clone());
        Ok(())
    }

    async fn states_awaiting_summary(
        &self,
    ) -> Result<Vec<(Uuid, ConversationState)>, DatabaseError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .states
            .iter()
            .filter(|(_, s)| {
                matches!(s, ConversationState::AwaitingPomodoroSummary { .. })
            })
            .map(|(id, s)| (*id, s.clone()))
            .collect())
    }

    async fn insert_session(&self, session: &NewSession) -> Result<Session, DatabaseError> {
        self.check()?;
        let row = Session {
            id: Uuid::new_v4(),
            user_id: session.user_id,
            kind: session.kind,
            status: session.status,
            started_at: session.started_at,
            planned_end: session.planned_end,
            ended_at: None,
            summary: session.summary.clone(),
            backfill: session.backfill,
            cycle_work_minutes: session.cycle_work_minutes,
            cycle_break_minutes: session.cycle_break_minutes,
        };
        self.inner.lock().unwrap().sessions.push(row.clone());
        Ok(row)
    }

    async fn close_session(
        &self,
        id: Uuid,
        status: SessionStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == id) {
            session.status = status;
            session.ended_at = Some(ended_at);
        }
        Ok(())
    }

    async fn attach_summary(&self, id: Uuid, text: &str) -> Result<(), DatabaseError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == id) {
            session.summary = Some(text.to_string());
        }
        Ok(())
    }

    async fn active_sessions(&self) -> Result<Vec<Session>, DatabaseError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect())
    }

    async fn active_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, DatabaseError> {
        Ok(self
            .active_sessions()
            .await?
            .into_iter()
            .filter(|s| s.user_id == user_id)
            .collect())
    }

    async fn work_sessions_between(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>, DatabaseError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .iter()
            .filter(|s| {
                s.user_id == user_id
                    && s.kind == crate::sessions::SessionKind::Work
                    && s.started_at >= from
                    && s.started_at < to
            })
            .cloned()
            .collect())
    }

    async fn insert_task(&self, task: &NewTask) -> Result<Task, DatabaseError> {
        self.check()?;
        let row = Task {
            id: Uuid::new_v4(),
            user_id: task.user_id,
            title: task.title.clone(),
            raw_message: task.raw_message.clone(),
            reminder_at: task.reminder_at,
            reminder_sent: false,
            completed: false,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.inner.lock().unwrap().tasks.push(row.clone());
        Ok(row)
    }

    async fn open_tasks(&self, user_id: Uuid) -> Result<Vec<Task>, DatabaseError> {
        self.check()?;
        let mut tasks: Vec<Task> = self
            .inner
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|t| t.user_id == user_id && !t.completed)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn complete_task(&self, id: Uuid) -> Result<Task, DatabaseError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(DatabaseError::NotFound { entity: "task" })?;
        task.completed = true;
        task.completed_at = Some(Utc::now());
        Ok(task.clone())
    }

    async fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|t| !t.reminder_sent && t.reminder_at.is_some_and(|at| at <= now))
            .cloned()
            .collect())
    }

    async fn mark_reminder_sent(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.tasks.iter_mut().find(|t| t.id == id) {
            task.reminder_sent = true;
        }
        Ok(())
    }

    async fn insert_calorie_log(&self, log: &NewCalorieLog) -> Result<(), DatabaseError> {
        self.check()?;
        let row = CalorieLog {
            id: Uuid::new_v4(),
            user_id: log.user_id,
            meal_description: log.meal_description.clone(),
            calories: log.calories,
            protein_g: log.protein_g,
            carbs_g: log.carbs_g,
            fat_g: log.fat_g,
            fiber_g: log.fiber_g,
            confirmed: log.confirmed,
            logged_at: Utc::now(),
        };
        self.inner.lock().unwrap().calorie_logs.push(row);
        Ok(())
    }

    async fn calorie_logs_between(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalorieLog>, DatabaseError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .calorie_logs
            .iter()
            .filter(|l| l.user_id == user_id && l.logged_at >= from && l.logged_at < to)
            .cloned()
            .collect())
    }
}

/// A sent notification.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub phone_number: String,
    pub body: String,
}

/// Recording [`Notifier`] with per-number failure injection.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentMessage>>,
    fail_numbers: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, phone_number: &str) {
        self.fail_numbers
            .lock()
            .unwrap()
            .insert(phone_number.to_string());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        phone_number: &str,
        body: &str,
        _media_url: Option<&str>,
    ) -> Result<(), ChannelError> {
        if self.fail_numbers.lock().unwrap().contains(phone_number) {
            return Err(ChannelError::SendFailed {
                reason: "injected failure".to_string(),
            });
        }
        self.sent.lock().unwrap().push(SentMessage {
            phone_number: phone_number.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn fetch_media_data_url(&self, _media_url: &str) -> Result<String, ChannelError> {
        Ok("data:image/jpeg;base64,dGVzdA==".to_string())
    }
}

/// Scripted [`Llm`] with canned responses.
pub struct MockLlm {
    intent: Mutex<Intent>,
    task: Mutex<Option<TaskDraft>>,
    backfill: Mutex<Option<BackfillDraft>>,
    estimate: Mutex<Option<CalorieEstimate>>,
    refined: Mutex<Option<CalorieEstimate>>,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self {
            intent: Mutex::new(Intent::GeneralChat),
            task: Mutex::new(None),
            backfill: Mutex::new(None),
            estimate: Mutex::new(None),
            refined: Mutex::new(None),
        }
    }
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_intent(&self, intent: Intent) {
        *self.intent.lock().unwrap() = intent;
    }

    pub fn set_task(&self, draft: TaskDraft) {
        *self.task.lock().unwrap() = Some(draft);
    }

    pub fn set_backfill(&self, draft: BackfillDraft) {
        *self.backfill.lock().unwrap() = Some(draft);
    }

    pub fn set_estimate(&self, estimate: CalorieEstimate) {
        *self.estimate.lock().unwrap() = Some(estimate);
    }

    pub fn set_refined(&self, estimate: CalorieEstimate) {
        *self.refined.lock().unwrap() = Some(estimate);
    }
}

fn canned<T: Clone>(slot: &Mutex<Option<T>>, what: &str) -> Result<T, LlmError> {
    slot.lock()
        .unwrap()
        .clone()
        .ok_or_else(|| LlmError::Malformed(format!("no canned {}", what)))
}

#[async_trait]
impl Llm for MockLlm {
    async fn classify_intent(&self, _message: &str, _pending: &str) -> Result<Intent, LlmError> {
        Ok(*self.intent.lock().unwrap())
    }

    async fn extract_task(&self, _message: &str, _tz: Tz) -> Result<TaskDraft, LlmError> {
        canned(&self.task, "task draft")
    }

    async fn parse_backfill(&self, _message: &str, _tz: Tz) -> Result<BackfillDraft, LlmError> {
        canned(&self.backfill, "backfill draft")
    }

    async fn estimate_calories_text(
        &self,
        _description: &str,
        _preferences: &str,
    ) -> Result<CalorieEstimate, LlmError> {
        canned(&self.estimate, "estimate")
    }

    async fn estimate_calories_image(
        &self,
        _image_data_url: &str,
        _preferences: &str,
    ) -> Result<CalorieEstimate, LlmError> {
        canned(&self.estimate, "estimate")
    }

    async fn refine_estimate(
        &self,
        _estimate: &CalorieEstimate,
        _correction: &str,
        _preferences: &str,
    ) -> Result<CalorieEstimate, LlmError> {
        canned(&self.refined, "refined estimate")
    }
}
