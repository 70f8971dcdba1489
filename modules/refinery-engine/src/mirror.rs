// Outbound delivery: tiered routing of signals to chat channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use refinery_common::{Config, Sentiment, Signal};

const MESSAGE_MAX_CHARS: usize = 4_000;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_ATTEMPTS: u32 = 3;

/// Send failures split into what a retry can fix and what it cannot.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Network error, 5xx, or 429.
    #[error("retryable send failure: {0}")]
    Retryable(String),
    /// The platform rejected the message; retrying would repeat the rejection.
    #[error("send rejected: {0}")]
    Fatal(String),
}

/// Outbound chat surface. Production posts to the chat platform; tests
/// capture messages in memory.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(
        &self,
        channel_id: &str,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<(), SendError>;
}

/// HTTPS sender for the chat platform's send endpoint.
pub struct ChatSender {
    token: String,
    endpoint: String,
    http: reqwest::Client,
}

impl ChatSender {
    pub fn new(token: &str, endpoint: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .expect("Failed to build chat HTTP client");
        Self {
            token: token.to_string(),
            endpoint: endpoint.to_string(),
            http,
        }
    }
}

#[async_trait]
impl Sender for ChatSender {
    async fn send(
        &self,
        channel_id: &str,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<(), SendError> {
        let mut body = json!({
            "chat_id": channel_id,
            "text": text,
            "parse_mode": "HTML",
        });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup;
        }

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Retryable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(SendError::Retryable(format!("{status}: {detail}")))
        } else {
            Err(SendError::Fatal(format!("{status}: {detail}")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    Primary,
    Secondary,
    Skipped,
}

/// Routes each new signal to the channel its relevance earns, if any.
pub struct Mirror {
    sender: Arc<dyn Sender>,
    primary_channel: String,
    secondary_channel: Option<String>,
    admin_channel: Option<String>,
    primary_threshold: i64,
    secondary_threshold: i64,
    retry_base: Duration,
}

impl Mirror {
    pub fn new(sender: Arc<dyn Sender>, config: &Config) -> Self {
        Self {
            sender,
            primary_channel: config.primary_channel_id.clone(),
            secondary_channel: config.secondary_channel_id.clone(),
            admin_channel: config.admin_channel_id.clone(),
            primary_threshold: config.relevance_primary_threshold,
            secondary_threshold: config.relevance_secondary_threshold,
            retry_base: Duration::from_secs(1),
        }
    }

    /// Shrink the retry backoff; tests use a zero base.
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    /// Route a freshly persisted signal. The send is best-effort: a
    /// final failure is logged and dropped, the signal row stays.
    pub async fn dispatch(&self, signal: &Signal) -> MirrorOutcome {
        let (channel, outcome) = if signal.relevance_score >= self.primary_threshold {
            (self.primary_channel.as_str(), MirrorOutcome::Primary)
        } else if signal.relevance_score >= self.secondary_threshold {
            match &self.secondary_channel {
                Some(c) => (c.as_str(), MirrorOutcome::Secondary),
                None => return MirrorOutcome::Skipped,
            }
        } else {
            return MirrorOutcome::Skipped;
        };

        let card = truncate_at_word(&format_signal_card(signal), MESSAGE_MAX_CHARS);
        let keyboard = deep_dive_keyboard(signal);

        if self.send_with_retry(channel, &card, keyboard).await {
            info!(signal = %signal.id, score = signal.relevance_score, ?outcome, "Signal mirrored");
        }
        outcome
    }

    async fn send_with_retry(
        &self,
        channel: &str,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> bool {
        for attempt in 0..SEND_ATTEMPTS {
            match self.sender.send(channel, text, reply_markup.clone()).await {
                Ok(()) => return true,
                Err(SendError::Fatal(e)) => {
                    warn!(channel, error = %e, "Outbound send rejected");
                    return false;
                }
                Err(SendError::Retryable(e)) if attempt + 1 < SEND_ATTEMPTS => {
                    let delay = self.retry_base * (1u32 << attempt);
                    warn!(channel, attempt, error = %e, "Outbound send failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(SendError::Retryable(e)) => {
                    warn!(channel, error = %e, "Outbound send failed after retries, dropping");
                    return false;
                }
            }
        }
        false
    }

    /// One-shot operator notice. Never retried.
    pub async fn notify_admin(&self, text: &str) {
        let Some(channel) = &self.admin_channel else {
            return;
        };
        if let Err(e) = self.sender.send(channel, text, None).await {
            warn!(error = %e, "Admin notification failed");
        }
    }

    /// Plain reply to an inbound chat, with the mirror's retry policy.
    pub async fn reply(&self, chat_id: &str, text: &str) {
        let text = truncate_at_word(text, MESSAGE_MAX_CHARS);
        self.send_with_retry(chat_id, &text, None).await;
    }
}

fn sentiment_glyph(sentiment: Sentiment) -> &'static str {
    match sentiment {
        Sentiment::Bullish => "▲",
        Sentiment::Bearish => "▼",
        Sentiment::Neutral => "▪",
    }
}

/// The full "signal card" sent to the primary channel.
pub fn format_signal_card(signal: &Signal) -> String {
    let mut card = format!(
        "<b>{}</b>\n{} {} · relevance {}",
        escape_html(&signal.summary),
        sentiment_glyph(signal.sentiment),
        signal.sentiment,
        signal.relevance_score,
    );
    if signal.urgent {
        card.push_str(" · URGENT");
    }
    if !signal.analysis.is_empty() {
        card.push_str("\n\n");
        card.push_str(&escape_html(&signal.analysis));
    }
    if let Some(fact_check) = &signal.fact_check {
        card.push_str("\n\n<i>Fact check:</i> ");
        card.push_str(&escape_html(fact_check));
    }
    if !signal.tickers.is_empty() {
        card.push_str(&format!("\n\nTickers: {}", escape_html(&signal.tickers.join(", "))));
    }
    if !signal.tags.is_empty() {
        card.push_str(&format!("\nTags: {}", escape_html(&signal.tags.join(", "))));
    }
    if !signal.source_name.is_empty() {
        card.push_str(&format!("\nSource: {}", escape_html(&signal.source_name)));
    }
    card
}

/// Inline keyboard wiring the card to the callback dispatcher.
fn deep_dive_keyboard(signal: &Signal) -> Option<serde_json::Value> {
    let item_id = signal.source_item_ids.first()?;
    Some(json!({
        "inline_keyboard": [[
            { "text": "Fact-check", "callback_data": format!("CALLBACK:chk:{item_id}") },
            { "text": "Synthesis",  "callback_data": format!("CALLBACK:syn:{item_id}") },
            { "text": "Deep dive",  "callback_data": format!("CALLBACK:div:{item_id}") },
        ]]
    }))
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Cut to `max` characters at a word boundary, appending an ellipsis.
pub fn truncate_at_word(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }

    // Reserve one slot for the ellipsis.
    let head: String = text.chars().take(max.saturating_sub(1)).collect();
    let cut = match head.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => &head[..pos],
        _ => head.as_str(),
    };
    format!("{}…", cut.trim_end())
}
