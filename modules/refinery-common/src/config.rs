use std::env;

use crate::error::{RefineryError, Result};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub database_url: String,

    // LLM provider
    pub llm_api_key: String,
    pub llm_endpoint: String,

    // Chat platform (outbound)
    pub chat_send_token: String,
    pub chat_send_endpoint: String,

    // Mirroring channels
    pub primary_channel_id: String,
    pub secondary_channel_id: Option<String>,
    pub admin_channel_id: Option<String>,

    /// Labels of our own outbound channels. Inbound messages whose title
    /// matches one of these are the mirror's output re-entering, and are
    /// dropped by the ingest pipeline.
    pub outbound_channel_labels: Vec<String>,

    // Web server
    pub web_host: String,
    pub web_port: u16,

    // Heartbeat
    pub base_heartbeat_ms: i64,
    pub max_heartbeat_ms: i64,
    pub min_heartbeat_ms: i64,

    // Analysis
    pub analysis_reuse_window_ms: i64,
    pub batch_max: u32,
    pub max_retries: u32,

    // Mirroring thresholds
    pub relevance_primary_threshold: i64,
    pub relevance_secondary_threshold: i64,
}

impl Config {
    /// Load configuration from environment variables. Missing required
    /// vars are a fatal config error (exit code 1 in the binary).
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://refinery.db?mode=rwc".to_string()),
            llm_api_key: required_env("LLM_API_KEY")?,
            llm_endpoint: required_env("LLM_ENDPOINT")?,
            chat_send_token: required_env("CHAT_SEND_TOKEN")?,
            chat_send_endpoint: required_env("CHAT_SEND_ENDPOINT")?,
            primary_channel_id: required_env("PRIMARY_CHANNEL_ID")?,
            secondary_channel_id: env::var("SECONDARY_CHANNEL_ID").ok().filter(|s| !s.is_empty()),
            admin_channel_id: env::var("ADMIN_CHANNEL_ID").ok().filter(|s| !s.is_empty()),
            outbound_channel_labels: env::var("OUTBOUND_CHANNEL_LABELS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: env::var("WEB_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| RefineryError::Config("WEB_PORT must be a number".into()))?,
            base_heartbeat_ms: env_i64("BASE_HEARTBEAT_MS", 300_000),
            max_heartbeat_ms: env_i64("MAX_HEARTBEAT_MS", 3_600_000),
            min_heartbeat_ms: env_i64("MIN_HEARTBEAT_MS", 5_000),
            analysis_reuse_window_ms: env_i64("ANALYSIS_REUSE_WINDOW_MS", 86_400_000),
            batch_max: env_i64("BATCH_MAX", 20) as u32,
            max_retries: env_i64("MAX_RETRIES", 5) as u32,
            relevance_primary_threshold: env_i64("RELEVANCE_PRIMARY_THRESHOLD", 80),
            relevance_secondary_threshold: env_i64("RELEVANCE_SECONDARY_THRESHOLD", 60),
        })
    }

    /// Log presence and length of each sensitive value for debugging.
    /// Never logs the value itself.
    pub fn log_redacted(&self) {
        let vars = [
            ("LLM_API_KEY", &self.llm_api_key),
            ("LLM_ENDPOINT", &self.llm_endpoint),
            ("CHAT_SEND_TOKEN", &self.chat_send_token),
            ("CHAT_SEND_ENDPOINT", &self.chat_send_endpoint),
        ];
        for (name, value) in vars {
            if value.is_empty() {
                tracing::info!("{name} = (empty)");
            } else {
                tracing::info!("{name} = ({} chars)", value.len());
            }
        }
        tracing::info!(
            primary = %self.primary_channel_id,
            secondary = self.secondary_channel_id.is_some(),
            admin = self.admin_channel_id.is_some(),
            "Mirror channels configured"
        );
    }
}

fn required_env(key: &str) -> Result<String> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RefineryError::Config(format!("{key} environment variable is required")))
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
