// Batch analysis: pending items in, signals out. One LLM call per
// source group; failures bump retries and never reach the ingester.

use std::sync::Arc;

use chrono::{Duration, Utc};
use llm_client::{AnalysisEntry, Llm};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use refinery_common::{Config, ContentItem, RefineryError, Result, Sentiment, Signal, SignalState};

use crate::mirror::Mirror;
use crate::prompts;
use crate::store::ContentStore;

/// Entries scoring strictly above this become signals.
pub(crate) const PROMOTE_THRESHOLD: i64 = 40;

/// A signal with the same `(source_item_ids, summary)` fingerprint
/// within this window is suppressed. Tuning knob.
const DUPLICATE_SUPPRESS_HOURS: i64 = 6;

const DIGEST_BATCH_LIMIT: u32 = 50;

#[derive(Debug, Default, Clone, Copy)]
pub struct AnalyzerOutcome {
    /// Items that received an analysis this pass.
    pub analyzed: usize,
    pub signals_emitted: usize,
    /// Items still waiting after this pass (new arrivals or retried failures).
    pub pending_remaining: i64,
}

pub struct Analyzer {
    store: ContentStore,
    llm: Arc<dyn Llm>,
    mirror: Arc<Mirror>,
    batch_max: u32,
    max_retries: u32,
}

impl Analyzer {
    pub fn new(store: ContentStore, llm: Arc<dyn Llm>, mirror: Arc<Mirror>, config: &Config) -> Self {
        Self {
            store,
            llm,
            mirror,
            batch_max: config.batch_max,
            max_retries: config.max_retries,
        }
    }

    /// One invocation: take a pending batch, analyze each source group
    /// independently, write everything back. Never called concurrently
    /// with itself; the coordinator's tick gate guarantees that.
    pub async fn run_batch(&self) -> Result<AnalyzerOutcome> {
        let items = self
            .store
            .take_pending_batch(self.batch_max, self.max_retries)
            .await?;

        let mut outcome = AnalyzerOutcome::default();
        if items.is_empty() {
            return Ok(outcome);
        }

        for (source_id, group) in group_by_source(items) {
            match self.analyze_group(&group, prompts::BATCH_ANALYSIS).await {
                Ok(emitted) => {
                    outcome.analyzed += group.len();
                    outcome.signals_emitted += emitted;
                }
                Err(e) => {
                    warn!(source_id, error = %e, items = group.len(), "Batch analysis failed");
                    self.fail_group(&group, &e).await;
                }
            }
        }

        outcome.pending_remaining = self.store.pending_count(self.max_retries).await?;
        Ok(outcome)
    }

    /// Digest synthesis over signal-less items from the last day: one
    /// batch, the digest prompt variant, the usual promotion rules.
    pub async fn run_digest(&self) -> Result<usize> {
        let since = Utc::now() - Duration::hours(24);
        let items = self
            .store
            .items_without_signal_since(since, DIGEST_BATCH_LIMIT)
            .await?;
        if items.is_empty() {
            return Ok(0);
        }

        let emitted = self.analyze_group(&items, prompts::DIGEST_SYNTHESIS).await?;
        info!(items = items.len(), emitted, "Digest synthesis complete");
        Ok(emitted)
    }

    /// Analyze one group with the given prompt and promote qualifying
    /// entries. The LLM call happens before any store write; the write
    /// gate is never held across it.
    async fn analyze_group(&self, group: &[ContentItem], system_prompt: &str) -> Result<usize> {
        let batch_text = group
            .iter()
            .map(|item| format!("[ID: {}] {}", item.id, item.raw_text))
            .collect::<Vec<_>>()
            .join("\n---\n");

        let entries = self
            .llm
            .analyze(&batch_text, system_prompt)
            .await
            .map_err(|e| RefineryError::Llm(e.to_string()))?;

        let analyzed_at = Utc::now();
        let processed = json!({
            "entries": entries,
            "batch_item_ids": group.iter().map(|i| i.id.to_string()).collect::<Vec<_>>(),
            "analyzed_at": analyzed_at.timestamp_millis(),
        });

        // Every group item gets the full array. That is what marks it
        // done and what the reuse path replays.
        for item in group {
            if item.processed_json.is_none() {
                self.store
                    .write_analysis(item.id, &processed, SignalState::Pending, analyzed_at)
                    .await?;
            }
        }

        let mut emitted = 0;
        for entry in &entries {
            if entry.relevance_score <= PROMOTE_THRESHOLD || entry.summary.trim().is_empty() {
                continue;
            }

            let source_ids = resolve_source_ids(entry, group);
            if self
                .store
                .recent_duplicate_signal(
                    &source_ids,
                    entry.summary.trim(),
                    Duration::hours(DUPLICATE_SUPPRESS_HOURS),
                )
                .await?
            {
                info!(summary = %entry.summary, "Duplicate signal suppressed");
                continue;
            }

            let signal = signal_from_entry(entry, &source_ids, &group[0].source_name);
            self.store.save_signal(&signal).await?;
            for id in &source_ids {
                self.store.mark_promoted(*id).await?;
            }

            // Mirror only after the row is durable.
            self.mirror.dispatch(&signal).await;
            emitted += 1;
        }

        Ok(emitted)
    }

    async fn fail_group(&self, group: &[ContentItem], error: &RefineryError) {
        for item in group {
            match self
                .store
                .bump_retry(item.id, &error.to_string(), self.max_retries)
                .await
            {
                Ok(count) if count >= self.max_retries => {
                    info!(item = %item.id, "Item abandoned at retry cap");
                }
                Ok(_) => {}
                Err(e) => warn!(item = %item.id, error = %e, "Failed to record retry"),
            }
        }

        self.store
            .log_state(
                "analyzer",
                "batch analysis failed",
                Some(json!({ "error": error.to_string(), "items": group.len() })),
            )
            .await;

        self.mirror
            .notify_admin(&format!(
                "Analyzer: batch of {} items failed ({error})",
                group.len()
            ))
            .await;
    }
}

/// Group by `source_id`, preserving the created_at order the store
/// returned both across and within groups.
fn group_by_source(items: Vec<ContentItem>) -> Vec<(String, Vec<ContentItem>)> {
    let mut groups: Vec<(String, Vec<ContentItem>)> = Vec::new();
    for item in items {
        match groups.iter_mut().find(|(source, _)| *source == item.source_id) {
            Some((_, group)) => group.push(item),
            None => groups.push((item.source_id.clone(), vec![item])),
        }
    }
    groups
}

/// Item ids this entry draws on: the ids the model echoed back,
/// restricted to the group; the whole group when it names none.
fn resolve_source_ids(entry: &AnalysisEntry, group: &[ContentItem]) -> Vec<Uuid> {
    let named: Vec<Uuid> = entry
        .source_ids
        .iter()
        .filter_map(|s| Uuid::parse_str(s).ok())
        .filter(|id| group.iter().any(|item| item.id == *id))
        .collect();

    if named.is_empty() {
        group.iter().map(|item| item.id).collect()
    } else {
        named
    }
}

/// Build the durable signal for one analysis entry.
pub(crate) fn signal_from_entry(
    entry: &AnalysisEntry,
    source_ids: &[Uuid],
    source_name: &str,
) -> Signal {
    let mut tickers: Vec<String> = entry
        .tickers
        .iter()
        .map(|t| t.trim().to_ascii_uppercase())
        .filter(|t| !t.is_empty())
        .collect();
    tickers.dedup();

    Signal {
        id: Uuid::new_v4(),
        source_item_ids: source_ids.to_vec(),
        summary: entry.summary.trim().to_string(),
        analysis: entry.analysis.trim().to_string(),
        fact_check: entry.fact_check.clone().filter(|f| !f.trim().is_empty()),
        sentiment: entry
            .sentiment
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Sentiment::Neutral),
        relevance_score: entry.relevance_score.clamp(0, 100),
        urgent: entry.is_urgent,
        tickers,
        tags: entry.tags.clone(),
        source_name: source_name.to_string(),
        created_at: Utc::now(),
    }
}
