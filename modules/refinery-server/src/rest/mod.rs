// HTTP surface: webhook intake, direct ingest, and the rate-limited
// read API backing the dashboard.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use refinery_common::{ChannelStatus, ChannelType, IngestRecord, MediaRef, Signal};
use refinery_engine::collectors::webhook::{self, ChatUpdate, WebhookPayload};
use refinery_engine::pipeline::IngestOutcome;
use refinery_engine::store::SignalFilters;

use crate::{AppState, CachedPage};

pub const READ_RATE_LIMIT_PER_MINUTE: usize = 60;
const RATE_WINDOW: Duration = Duration::from_secs(60);
const SIGNALS_CACHE_TTL: Duration = Duration::from_secs(30);
const SIGNALS_PAGE_DEFAULT: u32 = 20;
const SIGNALS_PAGE_MAX: u32 = 100;
const EXPORT_MAX: u32 = 1_000;

// --- Liveness ---

pub async fn health() -> &'static str {
    "ok"
}

// --- Rate limiting (read API only; webhooks are trusted) ---

/// Sliding-window check for one IP. Prunes expired entries and records
/// the new request when allowed.
pub fn check_rate_limit(
    entries: &mut Vec<Instant>,
    now: Instant,
    max_per_window: usize,
    window: Duration,
) -> bool {
    let cutoff = now - window;
    entries.retain(|t| *t > cutoff);
    if entries.len() >= max_per_window {
        return false;
    }
    entries.push(now);
    true
}

/// Drop IPs whose entries have all expired, bounding the map.
pub fn prune_empty_entries(
    limiter: &mut std::collections::HashMap<IpAddr, Vec<Instant>>,
    window: Duration,
) {
    let cutoff = Instant::now() - window;
    limiter.retain(|_, entries| {
        entries.retain(|t| *t > cutoff);
        !entries.is_empty()
    });
}

async fn allow_read(state: &AppState, ip: IpAddr) -> bool {
    let mut limiter = state.rate_limiter.lock().await;
    if limiter.len() > 1_000 {
        prune_empty_entries(&mut limiter, RATE_WINDOW);
    }
    let entries = limiter.entry(ip).or_default();
    check_rate_limit(entries, Instant::now(), READ_RATE_LIMIT_PER_MINUTE, RATE_WINDOW)
}

fn rate_limited() -> axum::response::Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({"error": "rate limit exceeded"})),
    )
        .into_response()
}

// --- Webhooks ---

pub async fn webhook_chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let update: ChatUpdate = match serde_json::from_value(body) {
        Ok(update) => update,
        Err(e) => {
            warn!(error = %e, "Malformed chat webhook body");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error").into_response();
        }
    };

    if let WebhookPayload::Record(record) = webhook::normalize_chat(update) {
        // Acknowledge immediately; routing and any LLM work happen off
        // the request path.
        let coordinator = state.coordinator.clone();
        tokio::spawn(async move { coordinator.on_webhook(record).await });
    }
    (StatusCode::OK, "OK").into_response()
}

pub async fn webhook_kind(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let payload = match kind.as_str() {
        "generic" => webhook::normalize_generic(body),
        "discord" => webhook::normalize_discord(body),
        "slack" => webhook::normalize_slack(body),
        _ => return StatusCode::NOT_FOUND.into_response(),
    };

    match payload {
        WebhookPayload::Challenge(challenge) => {
            Json(serde_json::json!({ "challenge": challenge })).into_response()
        }
        WebhookPayload::Record(record) => {
            let coordinator = state.coordinator.clone();
            tokio::spawn(async move { coordinator.on_webhook(record).await });
            (StatusCode::OK, "OK").into_response()
        }
        WebhookPayload::Ignored => (StatusCode::OK, "OK").into_response(),
    }
}

// --- Direct ingest ---

#[derive(Deserialize)]
pub struct IngestBody {
    chat_id: Option<String>,
    title: Option<String>,
    text: String,
    media: Option<MediaRef>,
}

fn outcome_label(outcome: &IngestOutcome) -> &'static str {
    match outcome {
        IngestOutcome::Dropped => "dropped",
        IngestOutcome::NoContent => "no_content",
        IngestOutcome::Reused { .. } => "reused",
        IngestOutcome::Deduped { .. } => "deduped",
        IngestOutcome::Inserted { .. } => "inserted",
    }
}

pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngestBody>,
) -> impl IntoResponse {
    let record = IngestRecord {
        chat_id: body.chat_id.unwrap_or_else(|| "api".to_string()),
        message_id: None,
        title: body.title.unwrap_or_else(|| "api".to_string()),
        text: body.text,
        media: body.media,
    };

    match state.coordinator.ingest_direct(record).await {
        Ok(outcome) => Json(serde_json::json!({
            "id": outcome.item_id(),
            "outcome": outcome_label(&outcome),
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Direct ingest failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// --- Signals read API ---

#[derive(Deserialize, Default)]
pub struct SignalsQuery {
    limit: Option<u32>,
    offset: Option<u32>,
    source: Option<String>,
    sentiment: Option<String>,
    urgent: Option<bool>,
    from: Option<i64>,
    to: Option<i64>,
    q: Option<String>,
}

impl SignalsQuery {
    fn filters(&self) -> SignalFilters {
        SignalFilters {
            source: self.source.clone().filter(|s| !s.is_empty()),
            sentiment: self.sentiment.as_deref().and_then(|s| s.parse().ok()),
            urgent: self.urgent,
            from: self.from.and_then(chrono::DateTime::from_timestamp_millis),
            to: self.to.and_then(chrono::DateTime::from_timestamp_millis),
            q: self.q.clone().filter(|s| !s.is_empty()),
        }
    }

    fn is_unfiltered(&self) -> bool {
        self.source.is_none()
            && self.sentiment.is_none()
            && self.urgent.is_none()
            && self.from.is_none()
            && self.to.is_none()
            && self.q.is_none()
            && self.offset.unwrap_or(0) == 0
    }
}

pub async fn signals(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    Query(params): Query<SignalsQuery>,
) -> impl IntoResponse {
    if !allow_read(&state, addr.ip()).await {
        return rate_limited();
    }

    let limit = params.limit.unwrap_or(SIGNALS_PAGE_DEFAULT).min(SIGNALS_PAGE_MAX);
    let offset = params.offset.unwrap_or(0);

    // Short-TTL cache for the unfiltered first page; any saved signal
    // changes the store generation and invalidates it.
    let cacheable = params.is_unfiltered();
    if cacheable {
        let cache = state.signals_cache.lock().await;
        if let Some(page) = cache.as_ref() {
            if page.limit == limit
                && page.filled_at.elapsed() < SIGNALS_CACHE_TTL
                && page.generation == state.store.signal_generation()
            {
                return Json(page.body.clone()).into_response();
            }
        }
    }

    match state.store.list_signals(&params.filters(), limit, offset).await {
        Ok((signals, total)) => {
            let body = serde_json::json!({
                "signals": signals,
                "total": total,
                "limit": limit,
                "offset": offset,
            });
            if cacheable {
                let mut cache = state.signals_cache.lock().await;
                *cache = Some(CachedPage {
                    filled_at: Instant::now(),
                    generation: state.store.signal_generation(),
                    limit,
                    body: body.clone(),
                });
            }
            Json(body).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to list signals");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize, Default)]
pub struct ExportQuery {
    format: Option<String>,
    limit: Option<u32>,
    source: Option<String>,
    sentiment: Option<String>,
    urgent: Option<bool>,
    from: Option<i64>,
    to: Option<i64>,
    q: Option<String>,
}

impl ExportQuery {
    fn filters(&self) -> SignalFilters {
        SignalFilters {
            source: self.source.clone().filter(|s| !s.is_empty()),
            sentiment: self.sentiment.as_deref().and_then(|s| s.parse().ok()),
            urgent: self.urgent,
            from: self.from.and_then(chrono::DateTime::from_timestamp_millis),
            to: self.to.and_then(chrono::DateTime::from_timestamp_millis),
            q: self.q.clone().filter(|s| !s.is_empty()),
        }
    }
}

pub async fn signals_export(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    Query(params): Query<ExportQuery>,
) -> impl IntoResponse {
    if !allow_read(&state, addr.ip()).await {
        return rate_limited();
    }

    let limit = params.limit.unwrap_or(EXPORT_MAX).min(EXPORT_MAX);
    let (signals, _) = match state
        .store
        .list_signals(&params.filters(), limit, 0)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "Failed to export signals");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match params.format.as_deref().unwrap_or("json") {
        "csv" => match signals_to_csv(&signals) {
            Ok(bytes) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
                bytes,
            )
                .into_response(),
            Err(e) => {
                warn!(error = %e, "CSV export failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        "json" => Json(serde_json::json!({ "signals": signals })).into_response(),
        other => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": format!("unknown format: {other}")})),
        )
            .into_response(),
    }
}

fn signals_to_csv(signals: &[Signal]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "id",
        "created_at",
        "summary",
        "analysis",
        "fact_check",
        "sentiment",
        "relevance_score",
        "urgent",
        "tickers",
        "tags",
        "source_name",
        "source_item_ids",
    ])?;
    for signal in signals {
        writer.write_record([
            signal.id.to_string(),
            signal.created_at.timestamp_millis().to_string(),
            signal.summary.clone(),
            signal.analysis.clone(),
            signal.fact_check.clone().unwrap_or_default(),
            signal.sentiment.to_string(),
            signal.relevance_score.to_string(),
            signal.urgent.to_string(),
            signal.tickers.join(" "),
            signal.tags.join(" "),
            signal.source_name.clone(),
            signal
                .source_item_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(" "),
        ])?;
    }
    Ok(writer.into_inner()?)
}

pub async fn signal_sources(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
) -> impl IntoResponse {
    if !allow_read(&state, addr.ip()).await {
        return rate_limited();
    }
    match state.store.distinct_signal_sources().await {
        Ok(sources) => Json(serde_json::json!({ "sources": sources })).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to list signal sources");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
) -> impl IntoResponse {
    if !allow_read(&state, addr.ip()).await {
        return rate_limited();
    }
    match state.store.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "items": stats.items,
            "signals": stats.signals,
            "channels": stats.channels,
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to read stats");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// --- Feed registration ---

pub async fn list_feeds(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_channels(Some(ChannelType::Feed)).await {
        Ok(feeds) => Json(serde_json::json!({ "feeds": feeds })).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to list feeds");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
pub struct AddFeedBody {
    name: String,
    url: String,
}

pub async fn add_feed(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddFeedBody>,
) -> impl IntoResponse {
    if body.url.len() > 2_048 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "url too long"})),
        )
            .into_response();
    }
    match url::Url::parse(&body.url) {
        Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {}
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "not a valid feed url"})),
            )
                .into_response();
        }
    }

    match state
        .store
        .upsert_channel(&body.name, ChannelType::Feed, Some(&body.url))
        .await
    {
        Ok(outcome) => Json(serde_json::json!({ "id": outcome.id })).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to register feed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
pub struct RemoveFeedBody {
    id: String,
}

pub async fn remove_feed(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RemoveFeedBody>,
) -> impl IntoResponse {
    let Ok(id) = Uuid::parse_str(&body.id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "not a channel id"})),
        )
            .into_response();
    };

    match state.store.set_channel_status(id, ChannelStatus::Ignored).await {
        Ok(found) => Json(serde_json::json!({ "ok": found })).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to remove feed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
