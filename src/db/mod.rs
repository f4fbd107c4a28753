//! Database abstraction layer.
//!
//! The dispatcher and the scheduler both talk to storage through this trait,
//! which keeps turns hermetically testable. The production implementation is
//! [`postgres::Store`].

pub mod postgres;

pub use postgres::Store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::sessions::{NewSession, Session, SessionStatus};
use crate::state::ConversationState;

/// A registered user. Created on first contact, never deleted.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub phone_number: String,
    pub name: Option<String>,
    /// IANA timezone name, e.g. "America/New_York".
    pub timezone: String,
    pub features_enabled: Vec<String>,
    pub default_work_minutes: i32,
    pub default_break_minutes: i32,
    pub daily_calorie_goal: Option<i32>,
    pub dietary_preferences: Option<String>,
    pub onboarding_step: Option<String>,
    pub onboarding_complete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field patch for a user row. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub name: Option<String>,
    pub timezone: Option<String>,
    pub features_enabled: Option<Vec<String>>,
    pub default_work_minutes: Option<i32>,
    pub default_break_minutes: Option<i32>,
    pub daily_calorie_goal: Option<i32>,
    pub dietary_preferences: Option<String>,
    pub onboarding_step: Option<String>,
    pub onboarding_complete: Option<bool>,
}

/// A captured task, optionally with a one-shot reminder.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub raw_message: String,
    pub reminder_at: Option<DateTime<Utc>>,
    pub reminder_sent: bool,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A task row to insert.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: Uuid,
    pub title: String,
    pub raw_message: String,
    pub reminder_at: Option<DateTime<Utc>>,
}

/// A logged meal.
#[derive(Debug, Clone)]
pub struct CalorieLog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub meal_description: String,
    pub calories: Option<i32>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub fiber_g: Option<f64>,
    pub confirmed: bool,
    pub logged_at: DateTime<Utc>,
}

/// A calorie log row to insert.
#[derive(Debug, Clone)]
pub struct NewCalorieLog {
    pub user_id: Uuid,
    pub meal_description: String,
    pub calories: Option<i32>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub fiber_g: Option<f64>,
    pub confirmed: bool,
}

/// Storage operations used by the dispatcher and the scheduler.
#[async_trait]
pub trait Database: Send + Sync {
    // --- Users ---

    async fn get_or_create_user(&self, phone_number: &str) -> Result<User, DatabaseError>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, DatabaseError>;

    async fn update_user(&self, id: Uuid, patch: UserPatch) -> Result<User, DatabaseError>;

    // --- Conversation state ---

    /// Load a user's conversation state, `Idle` when absent or unreadable.
    async fn load_state(&self, user_id: Uuid) -> Result<ConversationState, DatabaseError>;

    /// Full overwrite of a user's conversation state.
    async fn save_state(
        &self,
        user_id: Uuid,
        state: &ConversationState,
    ) -> Result<(), DatabaseError>;

    /// All users currently awaiting a pomodoro summary, for the nudge scan.
    async fn states_awaiting_summary(
        &self,
    ) -> Result<Vec<(Uuid, ConversationState)>, DatabaseError>;

    // --- Sessions ---

    async fn insert_session(&self, session: &NewSession) -> Result<Session, DatabaseError>;

    /// Close a session: set its terminal status and end time.
    async fn close_session(
        &self,
        id: Uuid,
        status: SessionStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Attach a free-text summary to a session regardless of its status.
    async fn attach_summary(&self, id: Uuid, text: &str) -> Result<(), DatabaseError>;

    /// All active sessions across all users, for the expiry scan.
    async fn active_sessions(&self) -> Result<Vec<Session>, DatabaseError>;

    async fn active_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, DatabaseError>;

    /// Work sessions started inside a time window, oldest first.
    async fn work_sessions_between(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>, DatabaseError>;

    // --- Tasks ---

    async fn insert_task(&self, task: &NewTask) -> Result<Task, DatabaseError>;

    /// Open tasks for a user, oldest first.
    async fn open_tasks(&self, user_id: Uuid) -> Result<Vec<Task>, DatabaseError>;

    async fn complete_task(&self, id: Uuid) -> Result<Task, DatabaseError>;

    /// Tasks whose reminder is due and has not been sent.
    async fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError>;

    /// Flip `reminder_sent` to true. Called after the send so a crash in
    /// between duplicates rather than drops.
    async fn mark_reminder_sent(&self, id: Uuid) -> Result<(), DatabaseError>;

    // --- Calorie logs ---

    async fn insert_calorie_log(&self, log: &NewCalorieLog) -> Result<(), DatabaseError>;

    async fn calorie_logs_between(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalorieLog>, DatabaseError>;
}
