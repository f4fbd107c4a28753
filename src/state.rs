//! Per-user conversation state.
//!
//! Each user owes at most one outstanding follow-up at a time. The state is
//! persisted as a single jsonb row and fully overwritten on every save, so
//! the variant tag and its payload always travel together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::CalorieEstimate;

/// The single outstanding follow-up a user owes a reply to.
///
/// Decoding is defensive: rows written by older builds, or corrupted by
/// hand-edits, must degrade to [`ConversationState::Idle`] instead of
/// failing the turn. Use [`ConversationState::decode`] when reading from
/// storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pending", content = "payload", rename_all = "snake_case")]
pub enum ConversationState {
    /// Normal routing, nothing outstanding.
    Idle,
    /// A focus block closed and we asked what the user worked on.
    AwaitingPomodoroSummary {
        session_id: Uuid,
        requested_at: DateTime<Utc>,
        nudged: bool,
    },
    /// A meal estimate is waiting for a yes / correction.
    AwaitingCalorieConfirm { estimate: CalorieEstimate },
    /// A numbered task list is waiting for an index reply.
    AwaitingTaskCompletion { task_ids: Vec<Uuid> },
    /// The user is inside the setup dialogue.
    Onboarding,
}

impl ConversationState {
    /// Decode a stored jsonb value, falling back to `Idle` when the row is
    /// absent or unreadable.
    pub fn decode(value: Option<serde_json::Value>) -> Self {
        let Some(value) = value else {
            return ConversationState::Idle;
        };
        match serde_json::from_value(value) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("undecodable conversation state, treating as idle: {}", e);
                ConversationState::Idle
            }
        }
    }

    /// Encode for storage. Never fails for the variants we define.
    pub fn encode(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// The tag handed to the intent classifier as conversational context.
    pub fn tag(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::AwaitingPomodoroSummary { .. } => "awaiting_pomodoro_summary",
            ConversationState::AwaitingCalorieConfirm { .. } => "awaiting_calorie_confirm",
            ConversationState::AwaitingTaskCompletion { .. } => "awaiting_task_completion",
            ConversationState::Onboarding => "onboarding",
        }
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        ConversationState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_round_trip_all_variants() {
        let states = vec![
            ConversationState::Idle,
            ConversationState::AwaitingPomodoroSummary {
                session_id: Uuid::new_v4(),
                requested_at: Utc::now(),
                nudged: false,
            },
            ConversationState::AwaitingCalorieConfirm {
                estimate: CalorieEstimate {
                    description: Some("grilled chicken salad".to_string()),
                    calories: Some(450),
                    protein_g: Some(38.0),
                    carbs_g: Some(12.0),
                    fat_g: Some(20.0),
                    fiber_g: None,
                },
            },
            ConversationState::AwaitingTaskCompletion {
                task_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
            },
            ConversationState::Onboarding,
        ];

        for state in states {
            let decoded = ConversationState::decode(Some(state.encode()));
            assert_eq!(decoded, state);
        }
    }

    #[test]
    fn test_missing_row_is_idle() {
        assert_eq!(ConversationState::decode(None), ConversationState::Idle);
    }

    #[test]
    fn test_unknown_tag_is_idle() {
        let value = serde_json::json!({"pending": "awaiting_moon_phase", "payload": {}});
        assert_eq!(
            ConversationState::decode(Some(value)),
            ConversationState::Idle
        );
    }

    #[test]
    fn test_malformed_payload_is_idle() {
        // Right tag, wrong payload shape.
        let value = serde_json::json!({
            "pending": "awaiting_pomodoro_summary",
            "payload": {"session_id": 42}
        });
        assert_eq!(
            ConversationState::decode(Some(value)),
            ConversationState::Idle
        );
    }

    #[test]
    fn test_tag_matches_wire_name() {
        let state = ConversationState::AwaitingTaskCompletion { task_ids: vec![] };
        let value = state.encode();
        assert_eq!(value["pending"], state.tag());
    }
}
