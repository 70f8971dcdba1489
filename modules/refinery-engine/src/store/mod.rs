// SQLite persistence. The only durable state in the system; every other
// component is stateless or cache-only.

pub mod migrate;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::{Mutex, OnceCell};
use tracing::warn;
use uuid::Uuid;

use refinery_common::{
    Channel, ChannelStatus, ChannelType, ContentItem, Result, Sentiment, Signal, SignalState,
    Stats,
};

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

fn opt_ms_to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(ms_to_dt)
}

/// Cached table counts. Materialized once from the durable tables, then
/// kept in lockstep by every write path.
#[derive(Default)]
struct Counters {
    items: AtomicI64,
    signals: AtomicI64,
    channels: AtomicI64,
}

#[derive(Clone)]
pub struct ContentStore {
    pool: SqlitePool,
    /// Single-writer gate. Held only around store mutations, never
    /// across network I/O.
    writer: Arc<Mutex<()>>,
    counters: Arc<OnceCell<Counters>>,
    /// Bumped on every saved signal; read-side caches key off it.
    signal_generation: Arc<AtomicU64>,
}

/// Parameters for a fresh content item; id and timestamps are assigned
/// by the store.
#[derive(Debug, Clone)]
pub struct NewContentItem {
    pub source_id: String,
    pub source_name: String,
    pub raw_text: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Copy)]
pub struct UpsertOutcome {
    pub id: Uuid,
    pub inserted: bool,
}

#[derive(Debug, Default, Clone)]
pub struct SignalFilters {
    pub source: Option<String>,
    pub sentiment: Option<Sentiment>,
    pub urgent: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub q: Option<String>,
}

// --- Row types ---

#[derive(Debug, sqlx::FromRow)]
struct ContentItemRow {
    id: String,
    source_id: String,
    source_name: String,
    raw_text: String,
    content_hash: String,
    created_at: i64,
    processed_json: Option<String>,
    is_signal: i64,
    last_analyzed_at: Option<i64>,
    retry_count: i64,
    last_error: Option<String>,
}

impl TryFrom<ContentItemRow> for ContentItem {
    type Error = refinery_common::RefineryError;

    fn try_from(r: ContentItemRow) -> Result<Self> {
        Ok(ContentItem {
            id: Uuid::parse_str(&r.id)
                .map_err(|e| refinery_common::RefineryError::Database(e.to_string()))?,
            source_id: r.source_id,
            source_name: r.source_name,
            raw_text: r.raw_text,
            content_hash: r.content_hash,
            created_at: ms_to_dt(r.created_at),
            processed_json: r.processed_json.and_then(|s| serde_json::from_str(&s).ok()),
            is_signal: SignalState::from_i64(r.is_signal),
            last_analyzed_at: opt_ms_to_dt(r.last_analyzed_at),
            retry_count: r.retry_count.max(0) as u32,
            last_error: r.last_error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SignalRow {
    id: String,
    source_item_ids: String,
    summary: String,
    analysis: String,
    fact_check: Option<String>,
    sentiment: String,
    relevance_score: i64,
    urgent: bool,
    tickers: String,
    tags: String,
    source_name: String,
    created_at: i64,
}

impl TryFrom<SignalRow> for Signal {
    type Error = refinery_common::RefineryError;

    fn try_from(r: SignalRow) -> Result<Self> {
        let ids: Vec<String> = serde_json::from_str(&r.source_item_ids).unwrap_or_default();
        Ok(Signal {
            id: Uuid::parse_str(&r.id)
                .map_err(|e| refinery_common::RefineryError::Database(e.to_string()))?,
            source_item_ids: ids.iter().filter_map(|s| Uuid::parse_str(s).ok()).collect(),
            summary: r.summary,
            analysis: r.analysis,
            fact_check: r.fact_check,
            sentiment: r.sentiment.parse().unwrap_or(Sentiment::Neutral),
            relevance_score: r.relevance_score,
            urgent: r.urgent,
            tickers: serde_json::from_str(&r.tickers).unwrap_or_default(),
            tags: serde_json::from_str(&r.tags).unwrap_or_default(),
            source_name: r.source_name,
            created_at: ms_to_dt(r.created_at),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChannelRow {
    id: String,
    name: String,
    channel_type: String,
    feed_url: Option<String>,
    last_polled_at: Option<i64>,
    success_count: i64,
    failure_count: i64,
    status: String,
    created_at: i64,
}

impl TryFrom<ChannelRow> for Channel {
    type Error = refinery_common::RefineryError;

    fn try_from(r: ChannelRow) -> Result<Self> {
        Ok(Channel {
            id: Uuid::parse_str(&r.id)
                .map_err(|e| refinery_common::RefineryError::Database(e.to_string()))?,
            name: r.name,
            channel_type: r.channel_type.parse().unwrap_or(ChannelType::Webhook),
            feed_url: r.feed_url,
            last_polled_at: opt_ms_to_dt(r.last_polled_at),
            success_count: r.success_count.max(0) as u32,
            failure_count: r.failure_count.max(0) as u32,
            status: r.status.parse().unwrap_or(ChannelStatus::Active),
            created_at: ms_to_dt(r.created_at),
        })
    }
}

impl ContentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
            counters: Arc::new(OnceCell::new()),
            signal_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the database and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        // In-memory databases exist per connection; pin those pools to
        // a single connection so every query sees the same schema.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        migrate::migrate(&store.pool).await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn signal_generation(&self) -> u64 {
        self.signal_generation.load(Ordering::Relaxed)
    }

    fn counters(&self) -> Option<&Counters> {
        self.counters.get()
    }

    // --- Content items ---

    /// Insert a content item, deduplicating on `content_hash`. On
    /// conflict the existing id is returned and nothing is written.
    pub async fn upsert_content_item(&self, item: NewContentItem) -> Result<UpsertOutcome> {
        let _gate = self.writer.lock().await;

        let id = Uuid::new_v4();
        let now = Utc::now().timestamp_millis();

        let inserted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO content_items (id, source_id, source_name, raw_text, content_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id.to_string())
        .bind(&item.source_id)
        .bind(&item.source_name)
        .bind(&item.raw_text)
        .bind(&item.content_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            if let Some(c) = self.counters() {
                c.items.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(UpsertOutcome { id, inserted: true });
        }

        let existing: String =
            sqlx::query_scalar("SELECT id FROM content_items WHERE content_hash = ?")
                .bind(&item.content_hash)
                .fetch_one(&self.pool)
                .await?;

        Ok(UpsertOutcome {
            id: Uuid::parse_str(&existing)
                .map_err(|e| refinery_common::RefineryError::Database(e.to_string()))?,
            inserted: false,
        })
    }

    pub async fn exists_by_hash(&self, hash: &str) -> Result<Option<Uuid>> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT id FROM content_items WHERE content_hash = ?")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    pub async fn get_content_item(&self, id: Uuid) -> Result<Option<ContentItem>> {
        let row: Option<ContentItemRow> =
            sqlx::query_as("SELECT * FROM content_items WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(ContentItem::try_from).transpose()
    }

    /// Most recent analysis for a hash whose `last_analyzed_at` falls
    /// within the window, together with the item that carries it.
    pub async fn recent_analysis_by_hash(
        &self,
        hash: &str,
        within_ms: i64,
    ) -> Result<Option<(Uuid, serde_json::Value)>> {
        let cutoff = Utc::now().timestamp_millis() - within_ms;
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, processed_json FROM content_items
            WHERE content_hash = ? AND processed_json IS NOT NULL AND last_analyzed_at >= ?
            ORDER BY last_analyzed_at DESC
            LIMIT 1
            "#,
        )
        .bind(hash)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(id, json)| {
            let id = Uuid::parse_str(&id).ok()?;
            let value = serde_json::from_str(&json).ok()?;
            Some((id, value))
        }))
    }

    /// Up to `limit` unanalyzed items, oldest first. Non-destructive;
    /// the analyzer writes results back.
    pub async fn take_pending_batch(
        &self,
        limit: u32,
        max_retries: u32,
    ) -> Result<Vec<ContentItem>> {
        let rows: Vec<ContentItemRow> = sqlx::query_as(
            r#"
            SELECT * FROM content_items
            WHERE processed_json IS NULL AND retry_count < ? AND is_signal = 0
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(max_retries as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ContentItem::try_from).collect()
    }

    pub async fn pending_count(&self, max_retries: u32) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM content_items
             WHERE processed_json IS NULL AND retry_count < ? AND is_signal = 0",
        )
        .bind(max_retries as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Attach the LLM output to an item. `state` is applied through the
    /// guarded promotion path so the promoted-implies-analyzed invariant
    /// holds.
    pub async fn write_analysis(
        &self,
        item_id: Uuid,
        processed: &serde_json::Value,
        state: SignalState,
        analyzed_at: DateTime<Utc>,
    ) -> Result<()> {
        {
            let _gate = self.writer.lock().await;
            sqlx::query(
                "UPDATE content_items SET processed_json = ?, last_analyzed_at = ? WHERE id = ?",
            )
            .bind(processed.to_string())
            .bind(analyzed_at.timestamp_millis())
            .bind(item_id.to_string())
            .execute(&self.pool)
            .await?;
        }

        if state == SignalState::Promoted {
            self.mark_promoted(item_id).await?;
        }
        Ok(())
    }

    /// Transition an item to promoted. Only analyzed items qualify, and
    /// an already-promoted item is left alone. Returns whether the
    /// transition happened.
    pub async fn mark_promoted(&self, item_id: Uuid) -> Result<bool> {
        let _gate = self.writer.lock().await;
        let result = sqlx::query(
            "UPDATE content_items SET is_signal = 1
             WHERE id = ? AND is_signal != 1 AND processed_json IS NOT NULL",
        )
        .bind(item_id.to_string())
        .execute(&self.pool)
        .await?;

        let transitioned = result.rows_affected() > 0;
        if transitioned {
            if let Some(c) = self.counters() {
                c.signals.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(transitioned)
    }

    /// Increment the retry counter, recording the error. At the cap the
    /// item is moved to the terminal failed state and never picked up
    /// again. Returns the new retry count.
    pub async fn bump_retry(&self, item_id: Uuid, error: &str, max_retries: u32) -> Result<u32> {
        let _gate = self.writer.lock().await;

        let count: i64 = sqlx::query_scalar(
            "UPDATE content_items SET retry_count = retry_count + 1, last_error = ?
             WHERE id = ?
             RETURNING retry_count",
        )
        .bind(error)
        .bind(item_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        if count >= max_retries as i64 {
            sqlx::query("UPDATE content_items SET is_signal = -1 WHERE id = ? AND is_signal = 0")
                .bind(item_id.to_string())
                .execute(&self.pool)
                .await?;
        }

        Ok(count.max(0) as u32)
    }

    /// Analyzed items from the window that produced no signal, for
    /// digest synthesis. Pending and retrying items are left to the
    /// regular analyzer.
    pub async fn items_without_signal_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ContentItem>> {
        let rows: Vec<ContentItemRow> = sqlx::query_as(
            r#"
            SELECT * FROM content_items
            WHERE created_at >= ? AND is_signal = 0 AND processed_json IS NOT NULL
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(since.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ContentItem::try_from).collect()
    }

    // --- Signals ---

    pub async fn save_signal(&self, signal: &Signal) -> Result<()> {
        let _gate = self.writer.lock().await;

        let ids: Vec<String> = signal.source_item_ids.iter().map(|u| u.to_string()).collect();
        sqlx::query(
            r#"
            INSERT INTO signals
                (id, source_item_ids, summary, analysis, fact_check, sentiment,
                 relevance_score, urgent, tickers, tags, source_name, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(signal.id.to_string())
        .bind(serde_json::to_string(&ids)?)
        .bind(&signal.summary)
        .bind(&signal.analysis)
        .bind(&signal.fact_check)
        .bind(signal.sentiment.to_string())
        .bind(signal.relevance_score)
        .bind(signal.urgent)
        .bind(serde_json::to_string(&signal.tickers)?)
        .bind(serde_json::to_string(&signal.tags)?)
        .bind(&signal.source_name)
        .bind(signal.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        self.signal_generation.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Whether a signal with the same `(source_item_ids, summary)`
    /// fingerprint landed within the suppression window.
    pub async fn recent_duplicate_signal(
        &self,
        source_item_ids: &[Uuid],
        summary: &str,
        within: Duration,
    ) -> Result<bool> {
        let ids: Vec<String> = source_item_ids.iter().map(|u| u.to_string()).collect();
        let cutoff = (Utc::now() - within).timestamp_millis();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM signals
             WHERE summary = ? AND source_item_ids = ? AND created_at >= ?",
        )
        .bind(summary)
        .bind(serde_json::to_string(&ids)?)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn list_signals(
        &self,
        filters: &SignalFilters,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Signal>, i64)> {
        let mut count_qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM signals WHERE 1=1");
        push_signal_filters(&mut count_qb, filters);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM signals WHERE 1=1");
        push_signal_filters(&mut qb, filters);
        qb.push(" ORDER BY created_at DESC LIMIT ");
        qb.push_bind(limit as i64);
        qb.push(" OFFSET ");
        qb.push_bind(offset as i64);

        let rows: Vec<SignalRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let signals = rows
            .into_iter()
            .map(Signal::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((signals, total))
    }

    pub async fn distinct_signal_sources(&self) -> Result<Vec<String>> {
        let sources: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT source_name FROM signals WHERE source_name != '' ORDER BY source_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    // --- Channels ---

    /// Register a channel on first sighting; an existing channel with
    /// the same name is reused untouched.
    pub async fn upsert_channel(
        &self,
        name: &str,
        channel_type: ChannelType,
        feed_url: Option<&str>,
    ) -> Result<UpsertOutcome> {
        let _gate = self.writer.lock().await;

        let id = Uuid::new_v4();
        let now = Utc::now().timestamp_millis();
        let inserted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO channels (id, name, channel_type, feed_url, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id.to_string())
        .bind(name)
        .bind(channel_type.to_string())
        .bind(feed_url)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            if let Some(c) = self.counters() {
                c.channels.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(UpsertOutcome { id, inserted: true });
        }

        let existing: String = sqlx::query_scalar("SELECT id FROM channels WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(UpsertOutcome {
            id: Uuid::parse_str(&existing)
                .map_err(|e| refinery_common::RefineryError::Database(e.to_string()))?,
            inserted: false,
        })
    }

    pub async fn get_channel(&self, id: Uuid) -> Result<Option<Channel>> {
        let row: Option<ChannelRow> = sqlx::query_as("SELECT * FROM channels WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Channel::try_from).transpose()
    }

    pub async fn list_channels(&self, channel_type: Option<ChannelType>) -> Result<Vec<Channel>> {
        let rows: Vec<ChannelRow> = match channel_type {
            Some(t) => {
                sqlx::query_as("SELECT * FROM channels WHERE channel_type = ? ORDER BY name")
                    .bind(t.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM channels ORDER BY name")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(Channel::try_from).collect()
    }

    pub async fn set_channel_status(&self, id: Uuid, status: ChannelStatus) -> Result<bool> {
        let _gate = self.writer.lock().await;
        let result = sqlx::query("UPDATE channels SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_channel(
        &self,
        id: Uuid,
        success_delta: u32,
        failure_delta: u32,
        last_polled_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let _gate = self.writer.lock().await;
        sqlx::query(
            "UPDATE channels SET
                 success_count = success_count + ?,
                 failure_count = failure_count + ?,
                 last_polled_at = COALESCE(?, last_polled_at)
             WHERE id = ?",
        )
        .bind(success_delta as i64)
        .bind(failure_delta as i64)
        .bind(last_polled_at.map(|t| t.timestamp_millis()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Feed channels due for polling: active, never polled or stale.
    pub async fn feeds_due(&self, older_than: DateTime<Utc>) -> Result<Vec<Channel>> {
        let rows: Vec<ChannelRow> = sqlx::query_as(
            r#"
            SELECT * FROM channels
            WHERE channel_type = 'feed' AND status = 'active'
              AND (last_polled_at IS NULL OR last_polled_at < ?)
            ORDER BY name
            "#,
        )
        .bind(older_than.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Channel::try_from).collect()
    }

    // --- Internal logs ---

    /// Record an operational breadcrumb. A failed log write warns and
    /// moves on rather than failing the caller.
    pub async fn log_state(&self, module: &str, message: &str, context: Option<serde_json::Value>) {
        let _gate = self.writer.lock().await;
        let result = sqlx::query(
            "INSERT INTO internal_logs (module, message, context, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(module)
        .bind(message)
        .bind(context.map(|c| c.to_string()))
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(module, error = %e, "Failed to write internal log");
        }
    }

    pub async fn prune_internal_logs_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let _gate = self.writer.lock().await;
        let result = sqlx::query("DELETE FROM internal_logs WHERE created_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // --- Settings ---

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let _gate = self.writer.lock().await;
        sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_setting_i64(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.get_setting(key).await?.and_then(|v| v.parse().ok()))
    }

    pub async fn put_setting_i64(&self, key: &str, value: i64) -> Result<()> {
        self.put_setting(key, &value.to_string()).await
    }

    // --- Stats ---

    /// O(1) counters, materialized from the tables on first call and
    /// kept consistent by the write paths afterwards.
    pub async fn stats(&self) -> Result<Stats> {
        let counters = self
            .counters
            .get_or_try_init(|| async {
                let items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_items")
                    .fetch_one(&self.pool)
                    .await?;
                let signals: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM content_items WHERE is_signal = 1")
                        .fetch_one(&self.pool)
                        .await?;
                let channels: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM channels")
                    .fetch_one(&self.pool)
                    .await?;
                Ok::<_, refinery_common::RefineryError>(Counters {
                    items: AtomicI64::new(items),
                    signals: AtomicI64::new(signals),
                    channels: AtomicI64::new(channels),
                })
            })
            .await?;

        Ok(Stats {
            items: counters.items.load(Ordering::Relaxed),
            signals: counters.signals.load(Ordering::Relaxed),
            channels: counters.channels.load(Ordering::Relaxed),
        })
    }
}

fn push_signal_filters(qb: &mut QueryBuilder<Sqlite>, f: &SignalFilters) {
    if let Some(source) = &f.source {
        qb.push(" AND source_name = ");
        qb.push_bind(source.clone());
    }
    if let Some(sentiment) = f.sentiment {
        qb.push(" AND sentiment = ");
        qb.push_bind(sentiment.to_string());
    }
    if let Some(urgent) = f.urgent {
        qb.push(" AND urgent = ");
        qb.push_bind(urgent);
    }
    if let Some(from) = f.from {
        qb.push(" AND created_at >= ");
        qb.push_bind(from.timestamp_millis());
    }
    if let Some(to) = f.to {
        qb.push(" AND created_at <= ");
        qb.push_bind(to.timestamp_millis());
    }
    if let Some(q) = &f.q {
        let pattern = format!("%{}%", q.replace('%', "\\%").replace('_', "\\_"));
        qb.push(" AND (summary LIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" ESCAPE '\\' OR analysis LIKE ");
        qb.push_bind(pattern);
        qb.push(" ESCAPE '\\')");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> ContentStore {
        ContentStore::connect("sqlite::memory:").await.unwrap()
    }

    fn new_item(text: &str) -> NewContentItem {
        NewContentItem {
            source_id: "c1".to_string(),
            source_name: "News".to_string(),
            raw_text: text.to_string(),
            content_hash: refinery_common::content_hash(text),
        }
    }

    fn make_signal(item_id: Uuid, summary: &str, score: i64) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            source_item_ids: vec![item_id],
            summary: summary.to_string(),
            analysis: "because".to_string(),
            fact_check: None,
            sentiment: Sentiment::Neutral,
            relevance_score: score,
            urgent: false,
            tickers: vec!["SPY".to_string()],
            tags: vec!["macro".to_string()],
            source_name: "News".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_dedupes_on_hash() {
        let store = test_store().await;
        let first = store.upsert_content_item(new_item("same text")).await.unwrap();
        assert!(first.inserted);

        let second = store.upsert_content_item(new_item("same text")).await.unwrap();
        assert!(!second.inserted);
        assert_eq!(first.id, second.id);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_items")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn exists_by_hash_finds_the_row() {
        let store = test_store().await;
        let hash = refinery_common::content_hash("findable");
        assert!(store.exists_by_hash(&hash).await.unwrap().is_none());

        let outcome = store.upsert_content_item(new_item("findable")).await.unwrap();
        assert_eq!(store.exists_by_hash(&hash).await.unwrap(), Some(outcome.id));
    }

    #[tokio::test]
    async fn stats_counters_track_writes() {
        let store = test_store().await;

        // Materialize counters before any rows exist.
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.items, 0);

        let outcome = store.upsert_content_item(new_item("a")).await.unwrap();
        store.upsert_content_item(new_item("b")).await.unwrap();
        // Duplicate insert must not move the counter.
        store.upsert_content_item(new_item("a")).await.unwrap();
        store.upsert_channel("feed-one", ChannelType::Feed, None).await.unwrap();

        store
            .write_analysis(outcome.id, &serde_json::json!({"entries": []}), SignalState::Promoted, Utc::now())
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.items, 2);
        assert_eq!(stats.signals, 1);
        assert_eq!(stats.channels, 1);

        // Counters must equal a fresh COUNT(*).
        let items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_items")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let signals: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM content_items WHERE is_signal = 1")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(stats.items, items);
        assert_eq!(stats.signals, signals);
    }

    #[tokio::test]
    async fn counters_lazily_materialize_existing_rows() {
        let store = test_store().await;
        store.upsert_content_item(new_item("pre-existing")).await.unwrap();

        // First stats() call happens after rows already exist.
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.items, 1);
    }

    #[tokio::test]
    async fn pending_batch_is_oldest_first_and_skips_done() {
        let store = test_store().await;
        let a = store.upsert_content_item(new_item("first")).await.unwrap();
        let b = store.upsert_content_item(new_item("second")).await.unwrap();
        let c = store.upsert_content_item(new_item("third")).await.unwrap();

        // Spread the timestamps; same-millisecond inserts would leave
        // the order to the database.
        for (item, minutes_ago) in [(&a, 3i64), (&b, 2), (&c, 1)] {
            sqlx::query("UPDATE content_items SET created_at = ? WHERE id = ?")
                .bind((Utc::now() - Duration::minutes(minutes_ago)).timestamp_millis())
                .bind(item.id.to_string())
                .execute(store.pool())
                .await
                .unwrap();
        }

        store
            .write_analysis(b.id, &serde_json::json!({"entries": []}), SignalState::Pending, Utc::now())
            .await
            .unwrap();

        let batch = store.take_pending_batch(10, 5).await.unwrap();
        let ids: Vec<Uuid> = batch.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[tokio::test]
    async fn retry_cap_moves_item_to_failed() {
        let store = test_store().await;
        let item = store.upsert_content_item(new_item("flaky")).await.unwrap();

        for i in 1..=5u32 {
            let count = store.bump_retry(item.id, "llm 500", 5).await.unwrap();
            assert_eq!(count, i);
        }

        let loaded = store.get_content_item(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.retry_count, 5);
        assert_eq!(loaded.is_signal, SignalState::Failed);
        assert_eq!(loaded.last_error.as_deref(), Some("llm 500"));

        // Failed items never reappear in the pending batch.
        let batch = store.take_pending_batch(10, 5).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn promotion_requires_analysis() {
        let store = test_store().await;
        let item = store.upsert_content_item(new_item("raw")).await.unwrap();

        // Not yet analyzed: promotion is refused.
        assert!(!store.mark_promoted(item.id).await.unwrap());

        store
            .write_analysis(item.id, &serde_json::json!({"entries": []}), SignalState::Pending, Utc::now())
            .await
            .unwrap();
        assert!(store.mark_promoted(item.id).await.unwrap());
        // Second promotion is a no-op.
        assert!(!store.mark_promoted(item.id).await.unwrap());
    }

    #[tokio::test]
    async fn recent_analysis_respects_window() {
        let store = test_store().await;
        let item = store.upsert_content_item(new_item("cached")).await.unwrap();
        let hash = refinery_common::content_hash("cached");

        assert!(store.recent_analysis_by_hash(&hash, 86_400_000).await.unwrap().is_none());

        store
            .write_analysis(item.id, &serde_json::json!({"entries": [1]}), SignalState::Pending, Utc::now())
            .await
            .unwrap();

        let hit = store.recent_analysis_by_hash(&hash, 86_400_000).await.unwrap();
        assert_eq!(hit.map(|(id, _)| id), Some(item.id));

        // A zero-width window excludes everything.
        let miss = store.recent_analysis_by_hash(&hash, -1).await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn signal_filters_and_pagination() {
        let store = test_store().await;
        let item = store.upsert_content_item(new_item("seed")).await.unwrap();

        let mut bearish = make_signal(item.id, "rates up", 85);
        bearish.sentiment = Sentiment::Bearish;
        bearish.urgent = true;
        store.save_signal(&bearish).await.unwrap();
        store.save_signal(&make_signal(item.id, "calm markets", 50)).await.unwrap();

        let (all, total) = store.list_signals(&SignalFilters::default(), 10, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(all.len(), 2);

        let (only_bearish, total) = store
            .list_signals(
                &SignalFilters { sentiment: Some(Sentiment::Bearish), ..Default::default() },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(only_bearish[0].summary, "rates up");
        assert_eq!(only_bearish[0].source_item_ids, vec![item.id]);

        let (searched, _) = store
            .list_signals(
                &SignalFilters { q: Some("calm".to_string()), ..Default::default() },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(searched.len(), 1);
        assert_eq!(searched[0].summary, "calm markets");

        let (page, total) = store.list_signals(&SignalFilters::default(), 1, 1).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_signal_fingerprint_detected() {
        let store = test_store().await;
        let item = store.upsert_content_item(new_item("seed")).await.unwrap();
        let signal = make_signal(item.id, "rates up", 85);
        store.save_signal(&signal).await.unwrap();

        assert!(store
            .recent_duplicate_signal(&[item.id], "rates up", Duration::hours(6))
            .await
            .unwrap());
        assert!(!store
            .recent_duplicate_signal(&[item.id], "different summary", Duration::hours(6))
            .await
            .unwrap());
        assert!(!store
            .recent_duplicate_signal(&[Uuid::new_v4()], "rates up", Duration::hours(6))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn channel_upsert_and_touch() {
        let store = test_store().await;
        let first = store
            .upsert_channel("Macro Feed", ChannelType::Feed, Some("https://example.com/rss"))
            .await
            .unwrap();
        assert!(first.inserted);

        let again = store.upsert_channel("Macro Feed", ChannelType::Feed, None).await.unwrap();
        assert!(!again.inserted);
        assert_eq!(first.id, again.id);

        let polled_at = Utc::now();
        store.touch_channel(first.id, 1, 0, Some(polled_at)).await.unwrap();

        let loaded = store.get_channel(first.id).await.unwrap().unwrap();
        assert_eq!(loaded.success_count, 1);
        assert_eq!(loaded.failure_count, 0);
        assert_eq!(
            loaded.last_polled_at.map(|t| t.timestamp_millis()),
            Some(polled_at.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn feeds_due_excludes_fresh_and_ignored() {
        let store = test_store().await;
        let stale = store.upsert_channel("stale", ChannelType::Feed, Some("u1")).await.unwrap();
        let fresh = store.upsert_channel("fresh", ChannelType::Feed, Some("u2")).await.unwrap();
        let ignored = store.upsert_channel("ignored", ChannelType::Feed, Some("u3")).await.unwrap();
        store.upsert_channel("chatty", ChannelType::Chat, None).await.unwrap();

        let now = Utc::now();
        store.touch_channel(stale.id, 0, 0, Some(now - Duration::hours(1))).await.unwrap();
        store.touch_channel(fresh.id, 0, 0, Some(now)).await.unwrap();
        store.set_channel_status(ignored.id, ChannelStatus::Ignored).await.unwrap();

        let due = store.feeds_due(now - Duration::minutes(15)).await.unwrap();
        let names: Vec<&str> = due.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["stale"]);
    }

    #[tokio::test]
    async fn internal_logs_prune() {
        let store = test_store().await;
        store.log_state("analyzer", "batch failed", Some(serde_json::json!({"n": 3}))).await;
        store.log_state("poller", "ok", None).await;

        // Nothing is old enough to prune yet.
        let pruned = store
            .prune_internal_logs_older_than(Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(pruned, 0);

        let pruned = store
            .prune_internal_logs_older_than(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 2);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let store = test_store().await;
        assert!(store.get_setting_i64("next_interval_ms").await.unwrap().is_none());

        store.put_setting_i64("next_interval_ms", 300_000).await.unwrap();
        assert_eq!(store.get_setting_i64("next_interval_ms").await.unwrap(), Some(300_000));

        store.put_setting_i64("next_interval_ms", 600_000).await.unwrap();
        assert_eq!(store.get_setting_i64("next_interval_ms").await.unwrap(), Some(600_000));
    }

    #[tokio::test]
    async fn migration_is_idempotent() {
        let store = test_store().await;
        migrate::migrate(store.pool()).await.unwrap();
        migrate::migrate(store.pool()).await.unwrap();
    }
}
