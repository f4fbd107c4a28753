//! Calorie logging: estimation, the confirm continuation, daily summary,
//! and goals.

use std::sync::Arc;

use crate::db::{Database, NewCalorieLog, User};
use crate::error::DatabaseError;
use crate::llm::{CalorieEstimate, Llm};
use crate::sessions::first_number;
use crate::state::ConversationState;
use crate::timeutil::{local_day_bounds, safe_tz};

/// Build the confirm prompt for a fresh estimate and park it in the
/// continuation payload.
pub fn confirmation_turn(estimate: CalorieEstimate) -> (String, ConversationState) {
    let description = estimate
        .description
        .clone()
        .unwrap_or_else(|| "a meal".to_string());
    let details = format_macros(&estimate);
    let details_text = if details.is_empty() {
        "No macros estimate yet.".to_string()
    } else {
        details.join(" | ")
    };
    let text = format!(
        "That looks like {}.\nEstimate: {}\nReply 'yes' to log, or send a new calorie number to adjust.",
        description, details_text
    );
    (text, ConversationState::AwaitingCalorieConfirm { estimate })
}

/// Handle a reply while an estimate is awaiting confirmation.
///
/// "yes" logs as-is, a bare number overrides the calories first, "no"
/// discards, and anything else is treated as a correction and sent back
/// through the model for a revised estimate. Always consumes the message.
pub async fn handle_confirmation(
    db: &dyn Database,
    llm: &Arc<dyn Llm>,
    user: &User,
    message: &str,
    estimate: &CalorieEstimate,
) -> Result<(String, ConversationState), DatabaseError> {
    let lowered = message.trim().to_lowercase();

    if matches!(lowered.as_str(), "yes" | "y" | "correct" | "looks good") {
        let reply = save_log(db, user, estimate, true).await?;
        return Ok((reply, ConversationState::Idle));
    }

    if matches!(lowered.as_str(), "no" | "cancel" | "nevermind" | "never mind") {
        return Ok((
            "Okay, discarded. Send the meal again anytime.".to_string(),
            ConversationState::Idle,
        ));
    }

    if let Some(calories) = first_number(message) {
        let mut adjusted = estimate.clone();
        adjusted.calories = Some(calories as i32);
        let reply = save_log(db, user, &adjusted, true).await?;
        return Ok((reply, ConversationState::Idle));
    }

    // Free-text correction: revise the estimate and re-confirm.
    let preferences = user.dietary_preferences.clone().unwrap_or_default();
    match llm.refine_estimate(estimate, message, &preferences).await {
        Ok(revised) => Ok(confirmation_turn(revised)),
        Err(e) => {
            tracing::warn!("calorie refinement failed: {}", e);
            Ok((
                "Reply 'yes' to log this, or send a new calorie number (e.g. 600) to adjust."
                    .to_string(),
                ConversationState::AwaitingCalorieConfirm {
                    estimate: estimate.clone(),
                },
            ))
        }
    }
}

/// Persist an estimate as a calorie log and confirm what was saved.
pub async fn save_log(
    db: &dyn Database,
    user: &User,
    estimate: &CalorieEstimate,
    confirmed: bool,
) -> Result<String, DatabaseError> {
    let description = estimate
        .description
        .clone()
        .unwrap_or_else(|| "Meal".to_string());
    db.insert_calorie_log(&NewCalorieLog {
        user_id: user.id,
        meal_description: description.clone(),
        calories: estimate.calories,
        protein_g: estimate.protein_g,
        carbs_g: estimate.carbs_g,
        fat_g: estimate.fat_g,
        fiber_g: estimate.fiber_g,
        confirmed,
    })
    .await?;

    let details = format_macros(estimate);
    if details.is_empty() {
        return Ok(format!("✅ Logged: {}.", description));
    }
    Ok(format!("✅ Logged: {}\n{}", description, details.join(" | ")))
}

/// Today's intake against the user's goal.
pub async fn daily_summary(
    db: &dyn Database,
    user: &User,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<String, DatabaseError> {
    let tz = safe_tz(&user.timezone);
    let (from, to) = local_day_bounds(tz, now);
    let logs = db.calorie_logs_between(user.id, from, to).await?;
    if logs.is_empty() {
        return Ok(
            "No meals logged yet today. Send a photo or a text description to log one."
                .to_string(),
        );
    }

    let total: i64 = logs.iter().filter_map(|l| l.calories.map(i64::from)).sum();
    let protein: f64 = logs.iter().filter_map(|l| l.protein_g).sum();
    let carbs: f64 = logs.iter().filter_map(|l| l.carbs_g).sum();
    let fat: f64 = logs.iter().filter_map(|l| l.fat_g).sum();

    let macros = format!(
        "🥩 {}g protein | 🍞 {}g carbs | 🧈 {}g fat",
        protein as i64, carbs as i64, fat as i64
    );
    match user.daily_calorie_goal {
        Some(goal) => {
            let remaining = i64::from(goal) - total;
            Ok(format!(
                "Today's intake:\n🔥 {} / {} cal\n{}\nRemaining: {} cal",
                total, goal, macros, remaining
            ))
        }
        None => Ok(format!("Today's intake:\n🔥 {} cal\n{}", total, macros)),
    }
}

/// Set the daily calorie goal from a "goal 2000"-style message.
pub async fn update_goal(
    db: &dyn Database,
    user: &User,
    message: &str,
) -> Result<String, DatabaseError> {
    let Some(goal) = first_number(message) else {
        return Ok("Please send a number, like 'goal 2000'.".to_string());
    };
    db.update_user(user.id, crate::db::UserPatch {
        daily_calorie_goal: Some(goal as i32),
        ..Default::default()
    })
    .await?;
    Ok(format!("✅ Daily calorie goal set to {}.", goal))
}

fn format_macros(estimate: &CalorieEstimate) -> Vec<String> {
    let mut parts = Vec::new();
    if let Some(calories) = estimate.calories {
        parts.push(format!("🔥 {} cal", calories));
    }
    if let Some(protein) = estimate.protein_g {
        parts.push(format!("🥩 {}g protein", protein as i64));
    }
    if let Some(carbs) = estimate.carbs_g {
        parts.push(format!("🍞 {}g carbs", carbs as i64));
    }
    if let Some(fat) = estimate.fat_g {
        parts.push(format!("🧈 {}g fat", fat as i64));
    }
    if let Some(fiber) = estimate.fiber_g {
        parts.push(format!("🌾 {}g fiber", fiber as i64));
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn estimate() -> CalorieEstimate {
        CalorieEstimate {
            description: Some("chicken burrito".to_string()),
            calories: Some(750),
            protein_g: Some(42.0),
            carbs_g: Some(68.0),
            fat_g: Some(28.5),
            fiber_g: None,
        }
    }

    #[test]
    fn test_confirmation_turn_parks_estimate() {
        let (text, state) = confirmation_turn(estimate());
        assert!(text.contains("chicken burrito"));
        assert!(text.contains("750 cal"));
        assert_eq!(
            state,
            ConversationState::AwaitingCalorieConfirm {
                estimate: estimate()
            }
        );
    }

    #[test]
    fn test_format_macros_skips_missing() {
        let parts = format_macros(&estimate());
        assert_eq!(parts.len(), 4);
        assert!(parts.iter().all(|p| !p.contains("fiber")));
    }

    #[test]
    fn test_confirmation_turn_without_estimate_fields() {
        let (text, _) = confirmation_turn(CalorieEstimate::default());
        assert!(text.contains("a meal"));
        assert!(text.contains("No macros estimate yet."));
    }
}
