use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Content lifecycle ---

/// Tri-valued analysis outcome carried on every content item.
/// Stored as an integer: 0 pending, 1 promoted, -1 permanently failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalState {
    Pending,
    Promoted,
    Failed,
}

impl SignalState {
    pub fn as_i64(self) -> i64 {
        match self {
            SignalState::Pending => 0,
            SignalState::Promoted => 1,
            SignalState::Failed => -1,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => SignalState::Promoted,
            -1 => SignalState::Failed,
            _ => SignalState::Pending,
        }
    }
}

/// One ingested unit of raw text, deduplicated on `content_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: Uuid,
    /// Opaque upstream origin; carries enough to re-query the source.
    pub source_id: String,
    /// Human label, e.g. feed title or chat name.
    pub source_name: String,
    /// Scrubbed, possibly media-enriched text. Never empty for analyzable items.
    pub raw_text: String,
    /// SHA-256 hex of `raw_text`.
    pub content_hash: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Full LLM response array for the batch this item was analyzed in.
    pub processed_json: Option<serde_json::Value>,
    pub is_signal: SignalState,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_analyzed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

// --- Signals ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sentiment::Bullish => write!(f, "bullish"),
            Sentiment::Bearish => write!(f, "bearish"),
            Sentiment::Neutral => write!(f, "neutral"),
        }
    }
}

impl std::str::FromStr for Sentiment {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bullish" => Ok(Self::Bullish),
            "bearish" => Ok(Self::Bearish),
            "neutral" => Ok(Self::Neutral),
            other => Err(format!("unknown Sentiment: {other}")),
        }
    }
}

/// A synthesized, high-relevance artifact derived from one or more
/// content items. Created by the analyzer, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    /// Non-empty set of content item ids that contributed.
    pub source_item_ids: Vec<Uuid>,
    pub summary: String,
    pub analysis: String,
    pub fact_check: Option<String>,
    pub sentiment: Sentiment,
    /// 0–100.
    pub relevance_score: i64,
    pub urgent: bool,
    /// Canonicalized uppercase.
    pub tickers: Vec<String>,
    pub tags: Vec<String>,
    /// Human label of the upstream origin, for attribution and filtering.
    pub source_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

// --- Channels ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Chat,
    Feed,
    Webhook,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::Chat => write!(f, "chat"),
            ChannelType::Feed => write!(f, "feed"),
            ChannelType::Webhook => write!(f, "webhook"),
        }
    }
}

impl std::str::FromStr for ChannelType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "feed" => Ok(Self::Feed),
            "webhook" => Ok(Self::Webhook),
            other => Err(format!("unknown ChannelType: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Ignored,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Active => write!(f, "active"),
            ChannelStatus::Ignored => write!(f, "ignored"),
        }
    }
}

impl std::str::FromStr for ChannelStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "ignored" => Ok(Self::Ignored),
            other => Err(format!("unknown ChannelStatus: {other}")),
        }
    }
}

/// A known upstream source, upserted on first sighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub channel_type: ChannelType,
    pub feed_url: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_polled_at: Option<DateTime<Utc>>,
    pub success_count: u32,
    pub failure_count: u32,
    pub status: ChannelStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

// --- Ingest ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Pdf,
    Image,
    Audio,
    Other,
}

/// Reference to a media blob attached to an inbound message. The
/// collector downloads and classifies it during enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub mime_type: Option<String>,
}

/// Normalized input to the ingest pipeline, produced by a collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRecord {
    pub chat_id: String,
    pub message_id: Option<String>,
    pub title: String,
    pub text: String,
    pub media: Option<MediaRef>,
}

// --- Internal logs ---

/// Time-stamped operational breadcrumb, pruned by the janitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalLog {
    pub id: i64,
    pub module: String,
    pub message: String,
    pub context: Option<serde_json::Value>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// O(1) counters kept consistent with the durable tables.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Stats {
    pub items: i64,
    pub signals: i64,
    pub channels: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_state_round_trips() {
        for s in [SignalState::Pending, SignalState::Promoted, SignalState::Failed] {
            assert_eq!(SignalState::from_i64(s.as_i64()), s);
        }
    }

    #[test]
    fn sentiment_parses_lowercase() {
        assert_eq!("bullish".parse::<Sentiment>().unwrap(), Sentiment::Bullish);
        assert!("BULLISH".parse::<Sentiment>().is_err());
    }

    #[test]
    fn channel_type_display_matches_from_str() {
        for t in [ChannelType::Chat, ChannelType::Feed, ChannelType::Webhook] {
            assert_eq!(t.to_string().parse::<ChannelType>().unwrap(), t);
        }
    }
}
