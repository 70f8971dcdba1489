// The coordinator: single entry point owning the store handle. Routes
// inbound traffic, runs heartbeat ticks, serializes mutations through
// the store's write gate, and drains on shutdown.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use llm_client::Llm;
use tracing::{debug, error, info, warn};

use refinery_common::{Config, IngestRecord, Result};

use crate::analyzer::Analyzer;
use crate::callbacks;
use crate::collectors::feed::{self, FeedPoller};
use crate::commands::{self, CommandOutcome};
use crate::heartbeat::{
    self, TickOutcome, WakeHandle, FEED_STALENESS_MINUTES, LOG_RETENTION_DAYS,
    MAINTENANCE_CADENCE_MS, SETTING_LAST_DIGEST, SETTING_LAST_JANITOR, SETTING_NEXT_INTERVAL,
};
use crate::mirror::{Mirror, Sender};
use crate::pipeline::{IngestOutcome, Pipeline};
use crate::store::ContentStore;

const SHUTDOWN_GRACE: StdDuration = StdDuration::from_secs(5);

pub struct Coordinator {
    store: ContentStore,
    config: Config,
    llm: Arc<dyn Llm>,
    mirror: Arc<Mirror>,
    pipeline: Pipeline,
    analyzer: Analyzer,
    poller: FeedPoller,
    wake: WakeHandle,
    /// Held for the duration of a tick; shutdown waits on it.
    tick_gate: tokio::sync::Mutex<()>,
}

impl Coordinator {
    pub fn new(
        store: ContentStore,
        config: Config,
        llm: Arc<dyn Llm>,
        sender: Arc<dyn Sender>,
    ) -> Self {
        let mirror = Arc::new(Mirror::new(sender, &config));
        Self::with_mirror(store, config, llm, mirror)
    }

    /// Assemble around a pre-built mirror (tests shrink its backoff).
    pub fn with_mirror(
        store: ContentStore,
        config: Config,
        llm: Arc<dyn Llm>,
        mirror: Arc<Mirror>,
    ) -> Self {
        let wake = WakeHandle::new();
        let pipeline = Pipeline::new(
            store.clone(),
            llm.clone(),
            mirror.clone(),
            wake.clone(),
            config.clone(),
        );
        let analyzer = Analyzer::new(store.clone(), llm.clone(), mirror.clone(), &config);
        Self {
            store,
            config,
            llm,
            mirror,
            pipeline,
            analyzer,
            poller: FeedPoller::new(),
            wake,
            tick_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn wake(&self) -> &WakeHandle {
        &self.wake
    }

    /// Inbound chat traffic. First match wins: command, callback,
    /// ingest. Errors never propagate to the webhook caller.
    pub async fn on_webhook(&self, record: IngestRecord) {
        let text = record.text.trim().to_string();

        if text.starts_with('/') {
            let outcome = commands::dispatch(&self.store, &text).await;
            if let CommandOutcome::Internal(e) = &outcome {
                error!(error = %e, "Command failed internally");
                self.store
                    .log_state(
                        "commands",
                        "command failed",
                        Some(serde_json::json!({ "error": e.to_string() })),
                    )
                    .await;
            }
            self.mirror.reply(&record.chat_id, &outcome.reply_text()).await;
            return;
        }

        if let Some((kind, item_id)) = callbacks::parse(&text) {
            callbacks::handle(&self.store, &self.llm, &self.mirror, &record.chat_id, kind, &item_id)
                .await;
            return;
        }

        match self.pipeline.ingest(record).await {
            Ok(outcome) => debug!(?outcome, "Webhook ingested"),
            Err(e) => {
                error!(error = %e, "Webhook ingest failed");
                self.store
                    .log_state(
                        "pipeline",
                        "ingest failed",
                        Some(serde_json::json!({ "error": e.to_string() })),
                    )
                    .await;
            }
        }
    }

    /// Direct ingest for the HTTP API; the caller gets the outcome.
    pub async fn ingest_direct(&self, record: IngestRecord) -> Result<IngestOutcome> {
        self.pipeline.ingest(record).await
    }

    /// One heartbeat tick: poll due feeds, analyze, digest and janitor
    /// on their cadence, then compute and persist the next interval.
    pub async fn on_heartbeat(&self) -> Result<TickOutcome> {
        let _tick = self.tick_gate.lock().await;
        let now = Utc::now();

        let polled_new = self.poll_due_feeds(now).await;

        let analysis = self.analyzer.run_batch().await?;

        let mut digest_signals = 0;
        if self.maintenance_due(SETTING_LAST_DIGEST, now).await? {
            match self.analyzer.run_digest().await {
                Ok(emitted) => digest_signals = emitted,
                Err(e) => {
                    warn!(error = %e, "Digest synthesis failed");
                    self.store
                        .log_state(
                            "digest",
                            "digest synthesis failed",
                            Some(serde_json::json!({ "error": e.to_string() })),
                        )
                        .await;
                }
            }
            self.store
                .put_setting_i64(SETTING_LAST_DIGEST, now.timestamp_millis())
                .await?;
        }

        if self.maintenance_due(SETTING_LAST_JANITOR, now).await? {
            let cutoff = now - Duration::days(LOG_RETENTION_DAYS);
            let pruned = self.store.prune_internal_logs_older_than(cutoff).await?;
            if pruned > 0 {
                info!(pruned, "Janitor pruned internal logs");
            }
            self.store
                .put_setting_i64(SETTING_LAST_JANITOR, now.timestamp_millis())
                .await?;
        }

        let active = polled_new > 0 || analysis.signals_emitted > 0 || digest_signals > 0;
        let previous = self
            .store
            .get_setting_i64(SETTING_NEXT_INTERVAL)
            .await?
            .unwrap_or(self.config.base_heartbeat_ms);
        let next = heartbeat::next_interval_ms(previous, active, &self.config);
        self.store.put_setting_i64(SETTING_NEXT_INTERVAL, next).await?;

        debug!(
            active,
            polled_new,
            analyzed = analysis.analyzed,
            signals = analysis.signals_emitted + digest_signals,
            next_interval_ms = next,
            "Tick complete"
        );

        Ok(TickOutcome {
            active,
            next_interval_ms: next,
            pending_remaining: analysis.pending_remaining > 0,
        })
    }

    /// Poll every feed channel that has gone stale. Returns how many
    /// new items were ingested; per-channel failures are counted and
    /// logged, never fatal to the tick.
    async fn poll_due_feeds(&self, now: chrono::DateTime<Utc>) -> usize {
        let stale = now - Duration::minutes(FEED_STALENESS_MINUTES);
        let due = match self.store.feeds_due(stale).await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "Failed to list due feeds");
                return 0;
            }
        };

        let mut polled_new = 0;
        for channel in due {
            let Some(url) = channel.feed_url.clone() else {
                warn!(channel = %channel.name, "Feed channel without a url, skipping");
                continue;
            };

            match self.poller.fetch(&url).await {
                Ok(entries) => {
                    let mut inserted = 0;
                    for entry in &entries {
                        let record = feed::entry_to_record(&channel, entry);
                        match self.pipeline.ingest(record).await {
                            Ok(IngestOutcome::Inserted { .. }) => inserted += 1,
                            Ok(_) => {}
                            Err(e) => {
                                warn!(channel = %channel.name, error = %e, "Feed item ingest failed")
                            }
                        }
                    }
                    polled_new += inserted;
                    if let Err(e) = self.store.touch_channel(channel.id, 1, 0, Some(now)).await {
                        warn!(channel = %channel.name, error = %e, "Failed to touch channel");
                    }
                    debug!(channel = %channel.name, entries = entries.len(), inserted, "Feed polled");
                }
                Err(e) => {
                    warn!(channel = %channel.name, error = %e, "Feed poll failed");
                    self.store
                        .log_state(
                            "poller",
                            "feed poll failed",
                            Some(serde_json::json!({ "channel": channel.name, "error": e.to_string() })),
                        )
                        .await;
                    if let Err(e) = self.store.touch_channel(channel.id, 0, 1, Some(now)).await {
                        warn!(channel = %channel.name, error = %e, "Failed to touch channel");
                    }
                }
            }
        }
        polled_new
    }

    async fn maintenance_due(&self, key: &str, now: chrono::DateTime<Utc>) -> Result<bool> {
        let last = self.store.get_setting_i64(key).await?.unwrap_or(0);
        Ok(now.timestamp_millis() - last >= MAINTENANCE_CADENCE_MS)
    }

    /// Interval to sleep before the first tick after startup: whatever
    /// the last run persisted, clamped to the configured bounds.
    pub async fn initial_interval_ms(&self) -> i64 {
        self.store
            .get_setting_i64(SETTING_NEXT_INTERVAL)
            .await
            .ok()
            .flatten()
            .unwrap_or(self.config.base_heartbeat_ms)
            .clamp(self.config.min_heartbeat_ms, self.config.max_heartbeat_ms)
    }

    /// Bounded drain: wait for an in-flight tick up to the grace
    /// period. Partial work is safe; the store is the only truth.
    pub async fn shutdown(&self) {
        match tokio::time::timeout(SHUTDOWN_GRACE, self.tick_gate.lock()).await {
            Ok(_guard) => info!("Coordinator drained"),
            Err(_) => warn!("Shutdown grace expired with a tick in flight"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{entry, test_config, MockLlm, MockSender};

    struct Fixture {
        coordinator: Coordinator,
        store: ContentStore,
        llm: Arc<MockLlm>,
        sender: Arc<MockSender>,
    }

    async fn fixture() -> Fixture {
        let store = ContentStore::connect("sqlite::memory:").await.unwrap();
        let llm: Arc<MockLlm> = Arc::new(MockLlm::default());
        let sender: Arc<MockSender> = Arc::new(MockSender::default());
        let config = test_config();
        let mirror = Arc::new(
            Mirror::new(sender.clone(), &config).with_retry_base(StdDuration::ZERO),
        );
        let coordinator =
            Coordinator::with_mirror(store.clone(), config, llm.clone(), mirror);
        Fixture { coordinator, store, llm, sender }
    }

    fn record(chat_id: &str, text: &str) -> IngestRecord {
        IngestRecord {
            chat_id: chat_id.to_string(),
            message_id: None,
            title: "News".to_string(),
            text: text.to_string(),
            media: None,
        }
    }

    #[tokio::test]
    async fn command_routes_to_dispatcher_not_ingest() {
        let f = fixture().await;
        f.coordinator.on_webhook(record("admin", "/status")).await;

        assert_eq!(f.store.stats().await.unwrap().items, 0);
        assert_eq!(f.llm.analyze_calls(), 0);

        let sent = f.sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "admin");
        assert!(sent[0].text.contains("items=0"));
    }

    #[tokio::test]
    async fn callback_routes_to_callback_dispatcher() {
        let f = fixture().await;
        f.coordinator
            .on_webhook(record("user-1", &format!("CALLBACK:chk:{}", uuid::Uuid::new_v4())))
            .await;

        // "not found" reply, no content item created.
        assert_eq!(f.store.stats().await.unwrap().items, 0);
        assert_eq!(f.sender.texts(), vec!["Signal not found or expired.".to_string()]);
    }

    #[tokio::test]
    async fn plain_text_is_ingested() {
        let f = fixture().await;
        f.coordinator
            .on_webhook(record("c1", "Central bank hikes rates 25bp."))
            .await;
        assert_eq!(f.store.stats().await.unwrap().items, 1);
    }

    #[tokio::test]
    async fn tick_analyzes_and_backs_off_when_idle() {
        let f = fixture().await;

        // Ingest resets the interval to base and queues one item.
        f.coordinator
            .on_webhook(record("c1", "Central bank hikes rates 25bp."))
            .await;
        assert_eq!(f.store.stats().await.unwrap().items, 1);

        // The tick's batch pass promotes; active resets to base.
        let ids: Vec<String> = vec![];
        f.llm.push_entries(vec![entry("Rate hike 25bp", 85, ids)]);
        let outcome = f.coordinator.on_heartbeat().await.unwrap();
        assert!(outcome.active);
        assert_eq!(outcome.next_interval_ms, 300_000);

        // Two idle ticks double toward the cap.
        let second = f.coordinator.on_heartbeat().await.unwrap();
        assert!(!second.active);
        assert_eq!(second.next_interval_ms, 600_000);

        let third = f.coordinator.on_heartbeat().await.unwrap();
        assert_eq!(third.next_interval_ms, 1_200_000);

        // A fresh ingest preempts the stored backoff.
        f.coordinator.on_webhook(record("c1", "Another story entirely.")).await;
        assert_eq!(
            f.store.get_setting_i64(SETTING_NEXT_INTERVAL).await.unwrap(),
            Some(300_000)
        );
    }

    #[tokio::test]
    async fn initial_interval_is_clamped_to_bounds() {
        let f = fixture().await;
        f.store.put_setting_i64(SETTING_NEXT_INTERVAL, 10_000_000).await.unwrap();
        assert_eq!(f.coordinator.initial_interval_ms().await, 3_600_000);

        f.store.put_setting_i64(SETTING_NEXT_INTERVAL, 1).await.unwrap();
        assert_eq!(f.coordinator.initial_interval_ms().await, 5_000);
    }

    #[tokio::test]
    async fn janitor_prunes_on_cadence() {
        let f = fixture().await;
        f.store.log_state("analyzer", "old breadcrumb", None).await;

        // Backdate both the log row and the janitor watermark.
        sqlx::query("UPDATE internal_logs SET created_at = ?")
            .bind((Utc::now() - Duration::days(8)).timestamp_millis())
            .execute(f.store.pool())
            .await
            .unwrap();

        f.coordinator.on_heartbeat().await.unwrap();

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM internal_logs")
            .fetch_one(f.store.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 0);

        // The watermark now blocks the next janitor pass.
        assert!(f
            .store
            .get_setting_i64(SETTING_LAST_JANITOR)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn shutdown_completes_when_idle() {
        let f = fixture().await;
        f.coordinator.shutdown().await;
    }
}
