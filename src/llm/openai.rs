//! OpenAI-backed classifier and extractors.
//!
//! Every call uses the Chat Completions API with `response_format:
//! json_object` and temperature 0, then decodes the JSON into the typed
//! structs the rest of the crate consumes. Relative time expressions come
//! back as ISO-8601 local timestamps and are resolved against the user's
//! timezone here.

use async_trait::async_trait;
use chrono_tz::Tz;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;

use crate::config::OpenAiConfig;
use crate::error::LlmError;
use crate::llm::{BackfillDraft, CalorieEstimate, Intent, Llm, TaskDraft};
use crate::timeutil::parse_local_datetime;

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

const INTENT_PROMPT: &str = r#"You classify messages sent to a productivity assistant that handles focus sessions (pomodoro), tasks, and calorie tracking. You receive the user's current conversation context and their message.

Reply with JSON: {"intent": "<tag>"} where <tag> is exactly one of:
pomodoro_start, pomodoro_stop, pomodoro_stats, pomodoro_backfill,
task_add, task_list, task_complete,
calorie_log, calorie_summary, calorie_goal,
help, general_chat.

Examples: "let's focus for 45 minutes" -> pomodoro_start. "I worked on the deck from 2 to 4" -> pomodoro_backfill. "remind me to call mom at 5" -> task_add. "I had a burrito for lunch" -> calorie_log. "how am I doing today" with no other signal -> pomodoro_stats."#;

const TASK_PROMPT: &str = r#"Extract a task from the message. Reply with JSON:
{"title": "<short imperative title>", "reminder_time": "<ISO-8601 local timestamp or null>"}

The user's timezone is provided; resolve relative expressions ("tomorrow at 9", "in two hours") into a concrete local timestamp formatted as YYYY-MM-DDTHH:MM:SS with no offset. Use null when no reminder is requested."#;

const BACKFILL_PROMPT: &str = r#"The user is logging focus work they already did. Reply with JSON:
{"start_time": "<ISO-8601 local>", "end_time": "<ISO-8601 local>", "description": "<what they worked on>"}

Resolve relative expressions ("this morning", "2pm to 4pm") against the provided timezone and the current date, preferring the past. Format timestamps as YYYY-MM-DDTHH:MM:SS with no offset. Use null for anything you cannot determine."#;

const CALORIE_PROMPT: &str = r#"Estimate the nutrition of the described or pictured meal. Reply with JSON:
{"description": "<short meal name>", "calories": <int>, "protein_g": <number>, "carbs_g": <number>, "fat_g": <number>, "fiber_g": <number or null>}

Estimate a single plausible value for each field, never a range. Respect any dietary preferences provided."#;

const REFINE_PROMPT: &str = r#"You previously estimated a meal's nutrition. The user sent a correction. Produce a revised estimate as JSON with the same shape:
{"description": "...", "calories": <int>, "protein_g": <number>, "carbs_g": <number>, "fat_g": <number>, "fiber_g": <number or null>}

Keep fields the correction does not touch close to the original estimate."#;

/// OpenAI chat-completions client.
pub struct OpenAiLlm {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiLlm {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// One JSON-mode chat call. `user_content` is either a plain string or
    /// a multimodal content array.
    async fn chat_json(
        &self,
        model: &str,
        system: &str,
        user_content: serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user_content},
            ],
            "response_format": {"type": "json_object"},
            "temperature": 0,
        });

        let response = self
            .client
            .post(CHAT_COMPLETIONS_URL)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Malformed("no choices in completion".to_string()))?;

        serde_json::from_str(&content).map_err(|e| LlmError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntentWire {
    intent: Option<Intent>,
}

#[derive(Debug, Deserialize)]
struct TaskWire {
    title: Option<String>,
    reminder_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackfillWire {
    start_time: Option<String>,
    end_time: Option<String>,
    description: Option<String>,
}

fn task_draft_from_wire(wire: TaskWire, tz: Tz) -> TaskDraft {
    TaskDraft {
        title: wire.title.filter(|t| !t.trim().is_empty()),
        reminder_at: wire
            .reminder_time
            .as_deref()
            .and_then(|v| parse_local_datetime(v, tz)),
    }
}

fn backfill_from_wire(wire: BackfillWire, tz: Tz) -> BackfillDraft {
    BackfillDraft {
        start: wire
            .start_time
            .as_deref()
            .and_then(|v| parse_local_datetime(v, tz)),
        end: wire
            .end_time
            .as_deref()
            .and_then(|v| parse_local_datetime(v, tz)),
        description: wire.description.filter(|d| !d.trim().is_empty()),
    }
}

#[async_trait]
impl Llm for OpenAiLlm {
    async fn classify_intent(&self, message: &str, pending: &str) -> Result<Intent, LlmError> {
        let payload = format!("Context: {}\nMessage: {}", pending, message);
        let value = self
            .chat_json(&self.config.model, INTENT_PROMPT, json!(payload))
            .await?;
        let wire: IntentWire =
            serde_json::from_value(value).map_err(|e| LlmError::Malformed(e.to_string()))?;
        Ok(wire.intent.unwrap_or(Intent::GeneralChat))
    }

    async fn extract_task(&self, message: &str, tz: Tz) -> Result<TaskDraft, LlmError> {
        let payload = format!("Timezone: {}\nMessage: {}", tz, message);
        let value = self
            .chat_json(&self.config.model, TASK_PROMPT, json!(payload))
            .await?;
        let wire: TaskWire =
            serde_json::from_value(value).map_err(|e| LlmError::Malformed(e.to_string()))?;
        Ok(task_draft_from_wire(wire, tz))
    }

    async fn parse_backfill(&self, message: &str, tz: Tz) -> Result<BackfillDraft, LlmError> {
        let payload = format!("Timezone: {}\nMessage: {}", tz, message);
        let value = self
            .chat_json(&self.config.model, BACKFILL_PROMPT, json!(payload))
            .await?;
        let wire: BackfillWire =
            serde_json::from_value(value).map_err(|e| LlmError::Malformed(e.to_string()))?;
        Ok(backfill_from_wire(wire, tz))
    }

    async fn estimate_calories_text(
        &self,
        description: &str,
        preferences: &str,
    ) -> Result<CalorieEstimate, LlmError> {
        let payload = format!("Description: {}\nPreferences: {}", description, preferences);
        let value = self
            .chat_json(&self.config.model, CALORIE_PROMPT, json!(payload))
            .await?;
        serde_json::from_value(value).map_err(|e| LlmError::Malformed(e.to_string()))
    }

    async fn estimate_calories_image(
        &self,
        image_data_url: &str,
        preferences: &str,
    ) -> Result<CalorieEstimate, LlmError> {
        let content = json!([
            {"type": "text", "text": format!("Preferences: {}", preferences)},
            {"type": "image_url", "image_url": {"url": image_data_url}},
        ]);
        let value = self
            .chat_json(&self.config.vision_model, CALORIE_PROMPT, content)
            .await?;
        serde_json::from_value(value).map_err(|e| LlmError::Malformed(e.to_string()))
    }

    async fn refine_estimate(
        &self,
        estimate: &CalorieEstimate,
        correction: &str,
        preferences: &str,
    ) -> Result<CalorieEstimate, LlmError> {
        let payload = json!({
            "existing_estimate": estimate,
            "correction": correction,
            "preferences": preferences,
        });
        let value = self
            .chat_json(&self.config.model, REFINE_PROMPT, json!(payload.to_string()))
            .await?;
        serde_json::from_value(value).map_err(|e| LlmError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_task_wire_resolves_reminder_in_user_tz() {
        let wire = TaskWire {
            title: Some("Call mom".to_string()),
            reminder_time: Some("2024-06-04T17:00:00".to_string()),
        };
        let draft = task_draft_from_wire(wire, chrono_tz::America::New_York);
        assert_eq!(draft.title.as_deref(), Some("Call mom"));
        assert_eq!(
            draft.reminder_at,
            Some(Utc.with_ymd_and_hms(2024, 6, 4, 21, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_task_wire_blank_title_drops() {
        let wire = TaskWire {
            title: Some("   ".to_string()),
            reminder_time: None,
        };
        let draft = task_draft_from_wire(wire, Tz::UTC);
        assert_eq!(draft.title, None);
        assert_eq!(draft.reminder_at, None);
    }

    #[test]
    fn test_backfill_wire_unparseable_times_degrade() {
        let wire = BackfillWire {
            start_time: Some("sometime earlier".to_string()),
            end_time: Some("2024-06-04T16:00:00".to_string()),
            description: Some("slides".to_string()),
        };
        let draft = backfill_from_wire(wire, Tz::UTC);
        assert_eq!(draft.start, None);
        assert!(draft.end.is_some());
        assert_eq!(draft.description.as_deref(), Some("slides"));
    }
}
