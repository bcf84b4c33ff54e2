//! Environment-driven configuration.
//!
//! Every external capability keys off the presence of its credentials:
//! missing email, chat, LLM, or sheets credentials disable that capability
//! instead of failing startup. Thresholds have the documented defaults and
//! every value can be overridden per deployment.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,

    /// Address the agent sends from. Required for the email capability.
    pub agent_email: Option<String>,
    pub gmail_access_token: Option<String>,
    pub watch_topic: Option<String>,
    pub watch_renewal_lead_secs: i64,

    pub slack_bot_token: Option<String>,
    pub slack_channel: String,

    pub openrouter_api_key: Option<String>,
    pub llm_model: String,
    pub llm_timeout_secs: u64,

    pub sheets_api_key: Option<String>,
    pub sheets_spreadsheet_id: Option<String>,
    pub sheets_range: String,

    pub campaign_source_url: Option<String>,
    pub campaign_source_api_key: Option<String>,

    pub cpm_floor: Decimal,
    pub cpm_ceiling: Decimal,
    pub low_rate_threshold: Decimal,
    pub intent_confidence_threshold: f64,
    pub max_rounds: u32,
    pub trigger_config_path: Option<PathBuf>,

    pub stale_after_hours: i64,
    pub stale_check_interval_secs: u64,
    pub details_link_base: String,
    pub compose_guidance: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(v.trim()).ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            database_path: env_or("DATABASE_PATH", "./dealbot.db"),
            port: env_parsed("PORT", 8080),

            agent_email: env_opt("AGENT_EMAIL"),
            gmail_access_token: env_opt("GMAIL_ACCESS_TOKEN"),
            watch_topic: env_opt("GMAIL_WATCH_TOPIC"),
            watch_renewal_lead_secs: env_parsed("WATCH_RENEWAL_LEAD_SECS", 3600),

            slack_bot_token: env_opt("SLACK_BOT_TOKEN"),
            slack_channel: env_or("SLACK_CHANNEL", "#deal-desk"),

            openrouter_api_key: env_opt("OPENROUTER_API_KEY"),
            llm_model: env_or("LLM_MODEL", "anthropic/claude-sonnet-4.5"),
            llm_timeout_secs: env_parsed("LLM_TIMEOUT_SECS", 30),

            sheets_api_key: env_opt("SHEETS_API_KEY"),
            sheets_spreadsheet_id: env_opt("SHEETS_SPREADSHEET_ID"),
            sheets_range: env_or("SHEETS_RANGE", "Influencers!A:H"),

            campaign_source_url: env_opt("CAMPAIGN_SOURCE_URL"),
            campaign_source_api_key: env_opt("CAMPAIGN_SOURCE_API_KEY"),

            cpm_floor: env_decimal("CPM_FLOOR", dec!(20)),
            cpm_ceiling: env_decimal("CPM_CEILING", dec!(30)),
            low_rate_threshold: env_decimal("LOW_RATE_THRESHOLD", dec!(15)),
            intent_confidence_threshold: env_parsed("INTENT_CONFIDENCE_THRESHOLD", 0.70),
            max_rounds: env_parsed("MAX_ROUNDS", 5),
            trigger_config_path: env_opt("TRIGGER_CONFIG_PATH").map(PathBuf::from),

            stale_after_hours: env_parsed("STALE_AFTER_HOURS", 96),
            stale_check_interval_secs: env_parsed("STALE_CHECK_INTERVAL_SECS", 3600),
            details_link_base: env_or("DETAILS_LINK_BASE", "https://mail.google.com/mail/u/0/#all"),
            compose_guidance: env_opt("COMPOSE_GUIDANCE"),
        })
    }
}
