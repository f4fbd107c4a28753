//! Setup dialogue for new users.
//!
//! A small step machine persisted on the user row: welcome → name →
//! features → pomodoro prefs → calorie goal → done. `/onboarding` restarts
//! it at any time.

use regex::Regex;
use std::sync::OnceLock;

use crate::db::{Database, User, UserPatch};
use crate::error::DatabaseError;
use crate::sessions::{first_number, parse_cycle};
use crate::state::ConversationState;

/// Literal command that restarts the setup dialogue.
pub const RESTART_COMMAND: &str = "/onboarding";

/// Advance the onboarding dialogue one step.
pub async fn handle(
    db: &dyn Database,
    user: &User,
    message: &str,
) -> Result<(String, ConversationState), DatabaseError> {
    let mut user = user.clone();
    let mut step = user.onboarding_step.clone().unwrap_or_else(|| "welcome".to_string());

    if message.trim().eq_ignore_ascii_case(RESTART_COMMAND) {
        step = "welcome".to_string();
        user = db
            .update_user(user.id, UserPatch {
                onboarding_step: Some("welcome".to_string()),
                onboarding_complete: Some(false),
                ..Default::default()
            })
            .await?;
    }

    match step.as_str() {
        "welcome" => {
            db.update_user(user.id, UserPatch {
                onboarding_step: Some("name".to_string()),
                onboarding_complete: Some(false),
                ..Default::default()
            })
            .await?;
            let text = "Hey! I'm Dash — your WhatsApp productivity copilot.\n\n\
                        I can help you:\n\
                        • ⏱ Run focus sessions (Pomodoro)\n\
                        • ✅ Capture tasks fast\n\
                        • 🍎 Log meals & calories\n\n\
                        Let's get you set up. What's your name?";
            Ok((text.to_string(), ConversationState::Onboarding))
        }
        "name" => {
            let name = extract_name(message);
            db.update_user(user.id, UserPatch {
                name: Some(name.clone()),
                onboarding_step: Some("features".to_string()),
                ..Default::default()
            })
            .await?;
            let text = format!(
                "Nice to meet you, {}!\n\n\
                 Which features do you want to use?\n\
                 1️⃣ Focus (Pomodoro)\n\
                 2️⃣ Tasks\n\
                 3️⃣ Calories\n\n\
                 Reply with numbers (e.g. 1 2 3 for all).",
                name
            );
            Ok((text, ConversationState::Onboarding))
        }
        "features" => {
            let features = parse_features(message);
            if features.is_empty() {
                return Ok((
                    "Please reply with numbers like 1 2 3 (example: 1 3).".to_string(),
                    ConversationState::Onboarding,
                ));
            }
            let user = db
                .update_user(user.id, UserPatch {
                    features_enabled: Some(features.clone()),
                    onboarding_step: Some("pomodoro_prefs".to_string()),
                    ..Default::default()
                })
                .await?;
            if features.iter().any(|f| f == "pomodoro") {
                let text = "What's your default focus cycle?\n\
                            Example: 45 10 (work/break)\n\
                            Or reply 'ok' to use 25/5.";
                return Ok((text.to_string(), ConversationState::Onboarding));
            }
            if features.iter().any(|f| f == "calories") {
                db.update_user(user.id, UserPatch {
                    onboarding_step: Some("calorie_goal".to_string()),
                    ..Default::default()
                })
                .await?;
                return Ok((goal_prompt(), ConversationState::Onboarding));
            }
            finish(db, &user).await
        }
        "pomodoro_prefs" => {
            let (work, rest) = parse_prefs(message);
            let user = db
                .update_user(user.id, UserPatch {
                    default_work_minutes: Some(work),
                    default_break_minutes: Some(rest),
                    ..Default::default()
                })
                .await?;
            if user.features_enabled.iter().any(|f| f == "calories") {
                db.update_user(user.id, UserPatch {
                    onboarding_step: Some("calorie_goal".to_string()),
                    ..Default::default()
                })
                .await?;
                return Ok((goal_prompt(), ConversationState::Onboarding));
            }
            finish(db, &user).await
        }
        "calorie_goal" => {
            if let Some(goal) = parse_goal(message) {
                db.update_user(user.id, UserPatch {
                    daily_calorie_goal: Some(goal),
                    ..Default::default()
                })
                .await?;
            }
            finish(db, &user).await
        }
        _ => finish(db, &user).await,
    }
}

async fn finish(
    db: &dyn Database,
    user: &User,
) -> Result<(String, ConversationState), DatabaseError> {
    db.update_user(user.id, UserPatch {
        onboarding_complete: Some(true),
        onboarding_step: Some("done".to_string()),
        ..Default::default()
    })
    .await?;
    let text = "You're all set!\n\n\
                Quick starts:\n\
                • start (or start 45 10)\n\
                • tasks\n\
                • calories\n\n\
                Send /help anytime.";
    Ok((text.to_string(), ConversationState::Idle))
}

fn goal_prompt() -> String {
    "What's your daily calorie goal?\n\
     Example: 2000\n\
     Or reply 'skip' to set it later."
        .to_string()
}

fn extract_name(message: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)name is ([A-Za-z][A-Za-z\s'-]+)").expect("static regex")
    });
    if let Some(captures) = re.captures(message) {
        return title_case(captures[1].trim());
    }
    title_case(message.trim())
}

fn parse_features(message: &str) -> Vec<String> {
    let mut features = Vec::new();
    for c in message.chars() {
        let feature = match c {
            '1' => "pomodoro",
            '2' => "tasks",
            '3' => "calories",
            _ => continue,
        };
        if !features.iter().any(|f| f == feature) {
            features.push(feature.to_string());
        }
    }
    features
}

fn parse_prefs(message: &str) -> (i32, i32) {
    let lowered = message.trim().to_lowercase();
    if matches!(lowered.as_str(), "ok" | "okay" | "default") {
        return (25, 5);
    }
    parse_cycle(message, 25, 5)
}

fn parse_goal(message: &str) -> Option<i32> {
    let lowered = message.trim().to_lowercase();
    if matches!(lowered.as_str(), "skip" | "later" | "no") {
        return None;
    }
    first_number(message).map(|n| n as i32)
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
