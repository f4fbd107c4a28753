//! PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::{CalorieLog, Database, NewCalorieLog, NewTask, Task, User, UserPatch};
use crate::error::DatabaseError;
use crate::sessions::{NewSession, Session, SessionKind, SessionStatus};
use crate::state::ConversationState;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database store backed by a deadpool-postgres pool.
pub struct Store {
    pool: Pool,
}

impl Store {
    /// Create a new store and verify the database is reachable.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = PoolConfig::new();
        cfg.url = Some(config.url.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Run embedded schema migrations.
    ///
    /// Uses a dedicated connection: refinery drives a plain tokio-postgres
    /// client, not a pooled wrapper.
    pub async fn run_migrations(config: &DatabaseConfig) -> Result<(), DatabaseError> {
        let (mut client, connection) = tokio_postgres::connect(&config.url, NoTls).await?;
        let handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("migration connection error: {}", e);
            }
        });

        let report = embedded::migrations::runner()
            .run_async(&mut client)
            .await
            .map_err(Box::new)?;
        for migration in report.applied_migrations() {
            tracing::info!("applied migration {}", migration);
        }

        drop(client);
        let _ = handle.await;
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

fn user_from_row(row: &Row) -> User {
    User {
        id: row.get("id"),
        phone_number: row.get("phone_number"),
        name: row.get("name"),
        timezone: row.get("timezone"),
        features_enabled: row.get("features_enabled"),
        default_work_minutes: row.get("default_work_minutes"),
        default_break_minutes: row.get("default_break_minutes"),
        daily_calorie_goal: row.get("daily_calorie_goal"),
        dietary_preferences: row.get("dietary_preferences"),
        onboarding_step: row.get("onboarding_step"),
        onboarding_complete: row.get("onboarding_complete"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn session_from_row(row: &Row) -> Session {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    Session {
        id: row.get("id"),
        user_id: row.get("user_id"),
        kind: SessionKind::parse(&kind).unwrap_or_else(|| {
            tracing::warn!("unknown session kind {:?}, treating as work", kind);
            SessionKind::Work
        }),
        status: SessionStatus::parse(&status).unwrap_or_else(|| {
            tracing::warn!("unknown session status {:?}, treating as cancelled", status);
            SessionStatus::Cancelled
        }),
        started_at: row.get("started_at"),
        planned_end: row.get("planned_end"),
        ended_at: row.get("ended_at"),
        summary: row.get("summary"),
        backfill: row.get("backfill"),
        cycle_work_minutes: row.get("cycle_work_minutes"),
        cycle_break_minutes: row.get("cycle_break_minutes"),
    }
}

fn task_from_row(row: &Row) -> Task {
    Task {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        raw_message: row.get("raw_message"),
        reminder_at: row.get("reminder_at"),
        reminder_sent: row.get("reminder_sent"),
        completed: row.get("completed"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
    }
}

fn calorie_log_from_row(row: &Row) -> CalorieLog {
    CalorieLog {
        id: row.get("id"),
        user_id: row.get("user_id"),
        meal_description: row.get("meal_description"),
        calories: row.get("calories"),
        protein_g: row.get("protein_g"),
        carbs_g: row.get("carbs_g"),
        fat_g: row.get("fat_g"),
        fiber_g: row.get("fiber_g"),
        confirmed: row.get("confirmed"),
        logged_at: row.get("logged_at"),
    }
}

#[async_trait]
impl Database for Store {
    async fn get_or_create_user(&self, phone_number: &str) -> Result<User, DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO users (phone_number) VALUES ($1) ON CONFLICT (phone_number) DO NOTHING",
            &[&phone_number],
        )
        .await?;
        let row = conn
            .query_one("SELECT * FROM users WHERE phone_number = $1", &[
                &phone_number,
            ])
            .await?;
        Ok(user_from_row(&row))
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM users WHERE id = $1", &[&id])
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn update_user(&self, id: Uuid, patch: UserPatch) -> Result<User, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                UPDATE users SET
                    name = COALESCE($2, name),
                    timezone = COALESCE($3, timezone),
                    features_enabled = COALESCE($4, features_enabled),
                    default_work_minutes = COALESCE($5, default_work_minutes),
                    default_break_minutes = COALESCE($6, default_break_minutes),
                    daily_calorie_goal = COALESCE($7, daily_calorie_goal),
                    dietary_preferences = COALESCE($8, dietary_preferences),
                    onboarding_step = COALESCE($9, onboarding_step),
                    onboarding_complete = COALESCE($10, onboarding_complete),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
                &[
                    &id,
                    &patch.name,
                    &patch.timezone,
                    &patch.features_enabled,
                    &patch.default_work_minutes,
                    &patch.default_break_minutes,
                    &patch.daily_calorie_goal,
                    &patch.dietary_preferences,
                    &patch.onboarding_step,
                    &patch.onboarding_complete,
                ],
            )
            .await?;
        let row = row.ok_or(DatabaseError::NotFound { entity: "user" })?;
        Ok(user_from_row(&row))
    }

    async fn load_state(&self, user_id: Uuid) -> Result<ConversationState, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT state FROM conversation_state WHERE user_id = $1",
                &[&user_id],
            )
            .await?;
        Ok(ConversationState::decode(
            row.map(|r| r.get::<_, serde_json::Value>("state")),
        ))
    }

    async fn save_state(
        &self,
        user_id: Uuid,
        state: &ConversationState,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO conversation_state (user_id, state, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                state = EXCLUDED.state,
                updated_at = NOW()
            "#,
            &[&user_id, &state.encode()],
        )
        .await?;
        Ok(())
    }

    async fn states_awaiting_summary(
        &self,
    ) -> Result<Vec<(Uuid, ConversationState)>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT user_id, state FROM conversation_state
                 WHERE state->>'pending' = 'awaiting_pomodoro_summary'",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let state = ConversationState::decode(Some(row.get("state")));
                (row.get("user_id"), state)
            })
            .collect())
    }

    async fn insert_session(&self, session: &NewSession) -> Result<Session, DatabaseError> {
        let conn = self.conn().await?;
        let kind = session.kind.as_str();
        let status = session.status.as_str();
        let row = conn
            .query_one(
                r#"
                INSERT INTO sessions (
                    user_id, kind, status, started_at, planned_end,
                    summary, backfill, cycle_work_minutes, cycle_break_minutes
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING *
                "#,
                &[
                    &session.user_id,
                    &kind,
                    &status,
                    &session.started_at,
                    &session.planned_end,
                    &session.summary,
                    &session.backfill,
                    &session.cycle_work_minutes,
                    &session.cycle_break_minutes,
                ],
            )
            .await?;
        Ok(session_from_row(&row))
    }

    async fn close_session(
        &self,
        id: Uuid,
        status: SessionStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let status = status.as_str();
        conn.execute(
            "UPDATE sessions SET status = $2, ended_at = $3 WHERE id = $1",
            &[&id, &status, &ended_at],
        )
        .await?;
        Ok(())
    }

    async fn attach_summary(&self, id: Uuid, text: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute("UPDATE sessions SET summary = $2 WHERE id = $1", &[
            &id, &text,
        ])
        .await?;
        Ok(())
    }

    async fn active_sessions(&self) -> Result<Vec<Session>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query("SELECT * FROM sessions WHERE status = 'active'", &[])
            .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    async fn active_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM sessions WHERE status = 'active' AND user_id = $1",
                &[&user_id],
            )
            .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    async fn work_sessions_between(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM sessions
                 WHERE user_id = $1 AND kind = 'work'
                   AND started_at >= $2 AND started_at < $3
                 ORDER BY started_at",
                &[&user_id, &from, &to],
            )
            .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    async fn insert_task(&self, task: &NewTask) -> Result<Task, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO tasks (user_id, title, raw_message, reminder_at)
                VALUES ($1, $2, $3, $4)
                RETURNING *
                "#,
                &[
                    &task.user_id,
                    &task.title,
                    &task.raw_message,
                    &task.reminder_at,
                ],
            )
            .await?;
        Ok(task_from_row(&row))
    }

    async fn open_tasks(&self, user_id: Uuid) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM tasks WHERE user_id = $1 AND completed = FALSE ORDER BY created_at",
                &[&user_id],
            )
            .await?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    async fn complete_task(&self, id: Uuid) -> Result<Task, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "UPDATE tasks SET completed = TRUE, completed_at = NOW() WHERE id = $1 RETURNING *",
                &[&id],
            )
            .await?;
        let row = row.ok_or(DatabaseError::NotFound { entity: "task" })?;
        Ok(task_from_row(&row))
    }

    async fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM tasks WHERE reminder_sent = FALSE AND reminder_at <= $1",
                &[&now],
            )
            .await?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    async fn mark_reminder_sent(&self, id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute("UPDATE tasks SET reminder_sent = TRUE WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    async fn insert_calorie_log(&self, log: &NewCalorieLog) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO calorie_logs (
                user_id, meal_description, calories,
                protein_g, carbs_g, fat_g, fiber_g, confirmed
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            &[
                &log.user_id,
                &log.meal_description,
                &log.calories,
                &log.protein_g,
                &log.carbs_g,
                &log.fat_g,
                &log.fiber_g,
                &log.confirmed,
            ],
        )
        .await?;
        Ok(())
    }

    async fn calorie_logs_between(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalorieLog>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM calorie_logs
                 WHERE user_id = $1 AND logged_at >= $2 AND logged_at < $3
                 ORDER BY logged_at",
                &[&user_id, &from, &to],
            )
            .await?;
        Ok(rows.iter().map(calorie_log_from_row).collect())
    }
}
