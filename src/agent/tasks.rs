//! Task capture, listing, and completion.

use std::sync::Arc;

use uuid::Uuid;

use crate::db::{Database, NewTask, User};
use crate::error::DatabaseError;
use crate::llm::Llm;
use crate::state::ConversationState;
use crate::timeutil::{safe_tz, short_local_time};

/// Capture a task from a free-text message.
///
/// Extraction failure is not an error: the raw message becomes the title
/// and no reminder is set.
pub async fn add_task(
    db: &dyn Database,
    llm: &Arc<dyn Llm>,
    user: &User,
    message: &str,
) -> Result<String, DatabaseError> {
    let tz = safe_tz(&user.timezone);
    let draft = match llm.extract_task(message, tz).await {
        Ok(draft) => draft,
        Err(e) => {
            tracing::warn!("task extraction failed, using raw message: {}", e);
            crate::llm::TaskDraft {
                title: None,
                reminder_at: None,
            }
        }
    };

    let title = draft
        .title
        .unwrap_or_else(|| message.trim().to_string());
    let task = db
        .insert_task(&NewTask {
            user_id: user.id,
            title,
            raw_message: message.to_string(),
            reminder_at: draft.reminder_at,
        })
        .await?;

    if let Some(at) = task.reminder_at {
        return Ok(format!(
            "✅ Task saved. ⏰ Reminder set for {}.",
            short_local_time(at, tz)
        ));
    }
    Ok("✅ Task saved.".to_string())
}

/// List open tasks as a numbered menu and remember the id map so a bare
/// number reply can complete one.
pub async fn list_tasks(
    db: &dyn Database,
    user: &User,
) -> Result<(String, ConversationState), DatabaseError> {
    let tasks = db.open_tasks(user.id).await?;
    if tasks.is_empty() {
        return Ok((
            "✅ You're all caught up. No open tasks.".to_string(),
            ConversationState::Idle,
        ));
    }

    let tz = safe_tz(&user.timezone);
    let mut lines = vec!["Open tasks:".to_string()];
    let mut task_ids = Vec::with_capacity(tasks.len());
    for (idx, task) in tasks.iter().enumerate() {
        match task.reminder_at {
            Some(at) => lines.push(format!(
                "{}. {} (reminder: {})",
                idx + 1,
                task.title,
                short_local_time(at, tz)
            )),
            None => lines.push(format!("{}. {}", idx + 1, task.title)),
        }
        task_ids.push(task.id);
    }
    lines.push("Reply with a number to mark one done.".to_string());

    Ok((
        lines.join("\n"),
        ConversationState::AwaitingTaskCompletion { task_ids },
    ))
}

/// Mark a task done and confirm with its title.
pub async fn complete_task(db: &dyn Database, task_id: Uuid) -> Result<String, DatabaseError> {
    let task = db.complete_task(task_id).await?;
    Ok(format!("✅ '{}' marked done!", task.title))
}

/// Resolve a 1-based index reply against a stored task id map.
pub fn index_into(task_ids: &[Uuid], number: i64) -> Option<Uuid> {
    if number < 1 {
        return None;
    }
    task_ids.get(number as usize - 1).copied()
}
