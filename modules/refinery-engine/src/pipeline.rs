// The ingest pipeline: normalize → scrub → enrich → fingerprint →
// dedupe → enqueue. Everything inbound that is not a command or a
// callback lands here.

use std::sync::Arc;

use llm_client::Llm;
use tracing::{debug, info, warn};
use uuid::Uuid;

use refinery_common::{content_hash, scrub_pii, Config, IngestRecord, Result};

use crate::analyzer;
use crate::collectors::media::MediaCollector;
use crate::heartbeat::{WakeHandle, SETTING_NEXT_INTERVAL};
use crate::mirror::Mirror;
use crate::store::{ContentStore, NewContentItem};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Output-loop guard or scrubber veto; nothing stored.
    Dropped,
    /// Scrubbed text was empty.
    NoContent,
    /// A fresh analysis for this hash existed; signals were re-derived
    /// from it without an LLM call.
    Reused { item_id: Uuid, signals_created: usize },
    /// An item with this hash already existed.
    Deduped { item_id: Uuid },
    /// A new item was stored and queued for analysis.
    Inserted { item_id: Uuid },
}

impl IngestOutcome {
    pub fn item_id(&self) -> Option<Uuid> {
        match self {
            IngestOutcome::Reused { item_id, .. }
            | IngestOutcome::Deduped { item_id }
            | IngestOutcome::Inserted { item_id } => Some(*item_id),
            _ => None,
        }
    }
}

pub struct Pipeline {
    store: ContentStore,
    media: MediaCollector,
    llm: Arc<dyn Llm>,
    mirror: Arc<Mirror>,
    wake: WakeHandle,
    config: Config,
}

impl Pipeline {
    pub fn new(
        store: ContentStore,
        llm: Arc<dyn Llm>,
        mirror: Arc<Mirror>,
        wake: WakeHandle,
        config: Config,
    ) -> Self {
        Self {
            store,
            media: MediaCollector::new(),
            llm,
            mirror,
            wake,
            config,
        }
    }

    pub async fn ingest(&self, record: IngestRecord) -> Result<IngestOutcome> {
        // Our own mirrored output must not re-enter.
        let title = record.title.trim();
        if self
            .config
            .outbound_channel_labels
            .iter()
            .any(|label| label.eq_ignore_ascii_case(title))
        {
            debug!(title, "Dropping message from an outbound channel");
            return Ok(IngestOutcome::Dropped);
        }

        let Some(mut text) = scrub_pii(&record.text) else {
            debug!("Scrubber vetoed inbound text");
            return Ok(IngestOutcome::Dropped);
        };

        if let Some(media) = &record.media {
            match self.media.enrich(media, self.llm.as_ref()).await {
                Ok(Some(extracted)) => {
                    // Media-derived text goes through the same scrub.
                    if let Some(extracted) = scrub_pii(&extracted) {
                        let extracted = extracted.trim();
                        if !extracted.is_empty() {
                            if !text.trim().is_empty() {
                                text.push_str("\n\n");
                            }
                            text.push_str(extracted);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(url = %media.url, error = %e, "Media enrichment failed, ingesting text only");
                    self.store
                        .log_state(
                            "pipeline",
                            "media enrichment failed",
                            Some(serde_json::json!({ "url": media.url, "error": e.to_string() })),
                        )
                        .await;
                }
            }
        }

        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(IngestOutcome::NoContent);
        }

        let hash = content_hash(&text);

        // A fresh analysis of identical text binds without a model call.
        if let Some((item_id, cached)) = self
            .store
            .recent_analysis_by_hash(&hash, self.config.analysis_reuse_window_ms)
            .await?
        {
            let signals_created = self.promote_cached(item_id, &record, &cached).await?;
            info!(%item_id, signals_created, "Reused cached analysis");
            return Ok(IngestOutcome::Reused { item_id, signals_created });
        }

        let outcome = self
            .store
            .upsert_content_item(NewContentItem {
                source_id: record.chat_id.clone(),
                source_name: record.title.clone(),
                raw_text: text,
                content_hash: hash,
            })
            .await?;

        if !outcome.inserted {
            debug!(item_id = %outcome.id, "Duplicate ingest, reusing existing item");
            return Ok(IngestOutcome::Deduped { item_id: outcome.id });
        }

        // Make sure the analyzer runs promptly: reset the backoff and
        // pull the next tick forward.
        self.store
            .put_setting_i64(SETTING_NEXT_INTERVAL, self.config.base_heartbeat_ms)
            .await?;
        self.wake.wake();

        Ok(IngestOutcome::Inserted { item_id: outcome.id })
    }

    /// Re-derive signals from a cached analysis, binding them to the
    /// already-stored item. The analyzer's duplicate suppression does
    /// not apply here: a deliberate re-ingest gets its signal.
    async fn promote_cached(
        &self,
        item_id: Uuid,
        record: &IngestRecord,
        cached: &serde_json::Value,
    ) -> Result<usize> {
        let entries: Vec<llm_client::AnalysisEntry> = cached
            .get("entries")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let ids = vec![item_id];
        let mut created = 0;
        for entry in &entries {
            if entry.relevance_score <= analyzer::PROMOTE_THRESHOLD
                || entry.summary.trim().is_empty()
            {
                continue;
            }
            let signal = analyzer::signal_from_entry(entry, &ids, &record.title);
            self.store.save_signal(&signal).await?;
            self.store.mark_promoted(item_id).await?;
            self.mirror.dispatch(&signal).await;
            created += 1;
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat;
    use crate::testing::{entry, test_config, MockLlm, MockSender};
    use refinery_common::{MediaRef, SignalState};

    struct Fixture {
        store: ContentStore,
        llm: Arc<MockLlm>,
        sender: Arc<MockSender>,
        pipeline: Pipeline,
    }

    async fn fixture() -> Fixture {
        let store = ContentStore::connect("sqlite::memory:").await.unwrap();
        let llm: Arc<MockLlm> = Arc::new(MockLlm::default());
        let sender: Arc<MockSender> = Arc::new(MockSender::default());
        let config = test_config();
        let mirror = Arc::new(
            Mirror::new(sender.clone(), &config).with_retry_base(std::time::Duration::ZERO),
        );
        let pipeline = Pipeline::new(
            store.clone(),
            llm.clone(),
            mirror,
            WakeHandle::new(),
            config,
        );
        Fixture { store, llm, sender, pipeline }
    }

    fn record(text: &str) -> IngestRecord {
        IngestRecord {
            chat_id: "c1".to_string(),
            message_id: None,
            title: "News".to_string(),
            text: text.to_string(),
            media: None,
        }
    }

    #[tokio::test]
    async fn outbound_label_is_dropped_case_insensitively() {
        let f = fixture().await;
        let mut r = record("anything");
        r.title = "refinery signals".to_string();
        assert_eq!(f.pipeline.ingest(r).await.unwrap(), IngestOutcome::Dropped);
        assert_eq!(f.store.stats().await.unwrap().items, 0);
    }

    #[tokio::test]
    async fn pii_is_scrubbed_before_storage() {
        let f = fixture().await;
        let outcome = f
            .pipeline
            .ingest(record("leak to tips@example.com and card 4111-1111-1111-1111"))
            .await
            .unwrap();
        let item_id = outcome.item_id().unwrap();
        let item = f.store.get_content_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.raw_text, "leak to [EMAIL] and card [CREDIT_CARD]");
        assert_eq!(item.content_hash, content_hash(&item.raw_text));
    }

    #[tokio::test]
    async fn empty_text_is_no_content() {
        let f = fixture().await;
        assert_eq!(f.pipeline.ingest(record("   ")).await.unwrap(), IngestOutcome::NoContent);
    }

    #[tokio::test]
    async fn second_ingest_dedupes_to_same_item() {
        let f = fixture().await;
        let first = f.pipeline.ingest(record("identical body")).await.unwrap();
        let IngestOutcome::Inserted { item_id } = first else {
            panic!("expected insert");
        };

        let second = f.pipeline.ingest(record("identical body")).await.unwrap();
        assert_eq!(second, IngestOutcome::Deduped { item_id });
        assert_eq!(f.store.stats().await.unwrap().items, 1);
        assert_eq!(f.llm.analyze_calls(), 0);
    }

    #[tokio::test]
    async fn insert_tickles_heartbeat_to_base() {
        let f = fixture().await;
        f.store
            .put_setting_i64(heartbeat::SETTING_NEXT_INTERVAL, 1_200_000)
            .await
            .unwrap();

        f.pipeline.ingest(record("fresh content")).await.unwrap();

        assert_eq!(
            f.store
                .get_setting_i64(heartbeat::SETTING_NEXT_INTERVAL)
                .await
                .unwrap(),
            Some(300_000)
        );
    }

    #[tokio::test]
    async fn cached_analysis_is_reused_without_llm_call() {
        let f = fixture().await;
        let inserted = f.pipeline.ingest(record("reusable story")).await.unwrap();
        let item_id = inserted.item_id().unwrap();

        // Simulate a completed analysis on the stored item.
        let processed = serde_json::json!({
            "entries": [entry("Reusable story matters", 85, vec![item_id.to_string()])],
        });
        f.store
            .write_analysis(item_id, &processed, SignalState::Promoted, chrono::Utc::now())
            .await
            .unwrap();

        let again = f.pipeline.ingest(record("reusable story")).await.unwrap();
        assert_eq!(again, IngestOutcome::Reused { item_id, signals_created: 1 });
        assert_eq!(f.llm.analyze_calls(), 0);

        // The re-derived signal references the original item and was mirrored.
        let (signals, _) = f
            .store
            .list_signals(&crate::store::SignalFilters::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].source_item_ids, vec![item_id]);
        assert_eq!(f.sender.channels(), vec!["primary-1".to_string()]);
    }

    #[tokio::test]
    async fn low_scoring_cached_analysis_creates_no_signal() {
        let f = fixture().await;
        let inserted = f.pipeline.ingest(record("weak story")).await.unwrap();
        let item_id = inserted.item_id().unwrap();

        let processed = serde_json::json!({
            "entries": [entry("Weak story", 30, vec![item_id.to_string()])],
        });
        f.store
            .write_analysis(item_id, &processed, SignalState::Pending, chrono::Utc::now())
            .await
            .unwrap();

        let again = f.pipeline.ingest(record("weak story")).await.unwrap();
        assert_eq!(again, IngestOutcome::Reused { item_id, signals_created: 0 });
        assert!(f.sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pdf_media_appends_sentinel() {
        let f = fixture().await;
        let mut r = record("quarterly report attached");
        r.media = Some(MediaRef {
            url: "http://media.invalid/q3.pdf".to_string(),
            mime_type: Some("application/pdf".to_string()),
        });

        let outcome = f.pipeline.ingest(r).await.unwrap();
        let item = f
            .store
            .get_content_item(outcome.item_id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.raw_text, "quarterly report attached\n\n[PDF DOCUMENT]");
    }
}
