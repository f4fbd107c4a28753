//! Intent classification and field extraction.
//!
//! The dispatcher treats language understanding as an external collaborator
//! with a fixed contract: a message (plus the current pending tag) maps to
//! an [`Intent`], and extraction calls map free text to typed drafts. The
//! production implementation is [`openai::OpenAiLlm`].

pub mod openai;

pub use openai::OpenAiLlm;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Intent vocabulary returned by the classifier.
///
/// Anything outside the vocabulary decodes as `Other`, which routes to the
/// generic help fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    PomodoroStart,
    PomodoroStop,
    PomodoroStats,
    PomodoroBackfill,
    TaskAdd,
    TaskList,
    TaskComplete,
    CalorieLog,
    CalorieSummary,
    CalorieGoal,
    Help,
    GeneralChat,
    #[serde(other)]
    Other,
}

/// Extracted task fields. Missing fields degrade, they never error.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDraft {
    pub title: Option<String>,
    pub reminder_at: Option<DateTime<Utc>>,
}

/// Extracted backfill range.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillDraft {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

/// A meal estimate, also the payload of the calorie-confirm continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CalorieEstimate {
    pub description: Option<String>,
    pub calories: Option<i32>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub fiber_g: Option<f64>,
}

/// Language-understanding collaborator.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Classify a message given the current pending tag (or "idle").
    async fn classify_intent(&self, message: &str, pending: &str) -> Result<Intent, LlmError>;

    /// Extract a task title and optional reminder time, resolving relative
    /// expressions against the user's timezone.
    async fn extract_task(&self, message: &str, tz: Tz) -> Result<TaskDraft, LlmError>;

    /// Extract a historical work range for backfill.
    async fn parse_backfill(&self, message: &str, tz: Tz) -> Result<BackfillDraft, LlmError>;

    /// Estimate calories and macros from a text description.
    async fn estimate_calories_text(
        &self,
        description: &str,
        preferences: &str,
    ) -> Result<CalorieEstimate, LlmError>;

    /// Estimate calories and macros from a meal photo (base64 data URL).
    async fn estimate_calories_image(
        &self,
        image_data_url: &str,
        preferences: &str,
    ) -> Result<CalorieEstimate, LlmError>;

    /// Revise an estimate given a user correction ("it was fried", "no
    /// dressing").
    async fn refine_estimate(
        &self,
        estimate: &CalorieEstimate,
        correction: &str,
        preferences: &str,
    ) -> Result<CalorieEstimate, LlmError>;
}
