//! Process configuration.
//!
//! Built once in `main` from the environment and passed into the dispatcher
//! and scheduler explicitly. Nothing in the core reads ambient globals.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub twilio: TwilioConfig,
    pub openai: OpenAiConfig,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub cycles: CycleDefaults,
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: usize,
}

/// Twilio WhatsApp credentials.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    /// Sender number, e.g. `whatsapp:+14155238886`.
    pub whatsapp_number: String,
}

/// OpenAI API settings.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: SecretString,
    pub model: String,
    pub vision_model: String,
}

/// Webhook server bind settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Timer scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between scheduler ticks.
    pub poll_interval: Duration,
    /// How long an unanswered summary request waits before the one-time nudge.
    pub nudge_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            nudge_after: Duration::from_secs(120),
        }
    }
}

/// Fallback focus-cycle lengths for users without stored preferences.
#[derive(Debug, Clone, Copy)]
pub struct CycleDefaults {
    pub work_minutes: i32,
    pub break_minutes: i32,
}

impl Default for CycleDefaults {
    fn default() -> Self {
        Self {
            work_minutes: 25,
            break_minutes: 5,
        }
    }
}

impl Config {
    /// Build the configuration from environment variables.
    ///
    /// Call `dotenvy::dotenv()` first if a `.env` file should be honored.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig {
                url: require("DATABASE_URL")?,
                pool_size: optional_parsed("DATABASE_POOL_SIZE", 8)?,
            },
            twilio: TwilioConfig {
                account_sid: require("TWILIO_ACCOUNT_SID")?,
                auth_token: SecretString::from(require("TWILIO_AUTH_TOKEN")?),
                whatsapp_number: require("TWILIO_WHATSAPP_NUMBER")?,
            },
            openai: OpenAiConfig {
                api_key: SecretString::from(require("OPENAI_API_KEY")?),
                model: optional("OPENAI_MODEL", "gpt-4o"),
                vision_model: optional("OPENAI_VISION_MODEL", "gpt-4o"),
            },
            server: ServerConfig {
                host: optional("HOST", "0.0.0.0"),
                port: optional_parsed("PORT", 8000)?,
            },
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_secs(optional_parsed(
                    "POMODORO_POLL_SECONDS",
                    30u64,
                )?),
                nudge_after: Duration::from_secs(optional_parsed(
                    "POMODORO_NUDGE_SECONDS",
                    120u64,
                )?),
            },
            cycles: CycleDefaults::default(),
        })
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn optional(var: &str, default: &str) -> String {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn optional_parsed<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.nudge_after, Duration::from_secs(120));
    }

    #[test]
    fn test_cycle_defaults() {
        let cycles = CycleDefaults::default();
        assert_eq!(cycles.work_minutes, 25);
        assert_eq!(cycles.break_minutes, 5);
    }
}
