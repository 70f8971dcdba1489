//! Shared test doubles, compiled for unit tests and behind the
//! `test-support` feature for the integration suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use llm_client::types::AnalysisEntry;
use llm_client::Llm;
use refinery_common::Config;

use crate::mirror::{SendError, Sender};

// --- Sender double ---

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub channel: String,
    pub text: String,
    pub reply_markup: Option<serde_json::Value>,
}

/// Captures outbound messages; can be told to fail the next N sends
/// with a retryable error.
#[derive(Default)]
pub struct MockSender {
    pub sent: Mutex<Vec<SentMessage>>,
    fail_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl MockSender {
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|m| m.text.clone()).collect()
    }

    pub fn channels(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|m| m.channel.clone()).collect()
    }
}

#[async_trait]
impl Sender for MockSender {
    async fn send(
        &self,
        channel_id: &str,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<(), SendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_remaining.load(Ordering::SeqCst) > 0 {
            self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(SendError::Retryable("mock network error".to_string()));
        }
        self.sent.lock().unwrap().push(SentMessage {
            channel: channel_id.to_string(),
            text: text.to_string(),
            reply_markup,
        });
        Ok(())
    }
}

// --- LLM double ---

enum Scripted {
    Entries(Vec<AnalysisEntry>),
    Error(String),
}

/// Scripted model: queued analyze responses, counted calls. An empty
/// queue answers with an empty entry array.
#[derive(Default)]
pub struct MockLlm {
    script: Mutex<VecDeque<Scripted>>,
    analyze_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    transcribe_calls: AtomicUsize,
    generate_response: Mutex<Option<String>>,
    transcribe_response: Mutex<Option<String>>,
}

impl MockLlm {
    pub fn push_entries(&self, entries: Vec<AnalysisEntry>) {
        self.script.lock().unwrap().push_back(Scripted::Entries(entries));
    }

    pub fn push_error(&self, message: &str) {
        self.script.lock().unwrap().push_back(Scripted::Error(message.to_string()));
    }

    pub fn set_generate_response(&self, text: &str) {
        *self.generate_response.lock().unwrap() = Some(text.to_string());
    }

    pub fn set_transcribe_response(&self, text: &str) {
        *self.transcribe_response.lock().unwrap() = Some(text.to_string());
    }

    pub fn analyze_calls(&self) -> usize {
        self.analyze_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn transcribe_calls(&self) -> usize {
        self.transcribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Llm for MockLlm {
    async fn analyze(
        &self,
        _batch_text: &str,
        _system_prompt: &str,
    ) -> anyhow::Result<Vec<AnalysisEntry>> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Entries(entries)) => Ok(entries),
            Some(Scripted::Error(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(Vec::new()),
        }
    }

    async fn generate(&self, _input: &str, _system_prompt: &str) -> anyhow::Result<String> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .generate_response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "mock generation".to_string()))
    }

    async fn transcribe(
        &self,
        _mime_type: &str,
        _data: &[u8],
        _instruction: &str,
    ) -> anyhow::Result<String> {
        self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .transcribe_response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "mock transcript".to_string()))
    }
}

// --- Config ---

/// A fully-populated config that touches no environment variables.
pub fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        llm_api_key: "test-key".to_string(),
        llm_endpoint: "http://llm.test/generate".to_string(),
        chat_send_token: "test-token".to_string(),
        chat_send_endpoint: "http://chat.test/send".to_string(),
        primary_channel_id: "primary-1".to_string(),
        secondary_channel_id: Some("secondary-1".to_string()),
        admin_channel_id: Some("admin-1".to_string()),
        outbound_channel_labels: vec!["Refinery Signals".to_string()],
        web_host: "127.0.0.1".to_string(),
        web_port: 0,
        base_heartbeat_ms: 300_000,
        max_heartbeat_ms: 3_600_000,
        min_heartbeat_ms: 5_000,
        analysis_reuse_window_ms: 86_400_000,
        batch_max: 20,
        max_retries: 5,
        relevance_primary_threshold: 80,
        relevance_secondary_threshold: 60,
    }
}

/// Build an [`AnalysisEntry`] for tests without spelling every field.
pub fn entry(summary: &str, score: i64, source_ids: Vec<String>) -> AnalysisEntry {
    AnalysisEntry {
        summary: summary.to_string(),
        analysis: "test analysis".to_string(),
        fact_check: None,
        relevance_score: score,
        sentiment: Some("neutral".to_string()),
        tickers: vec!["spy".to_string()],
        tags: vec!["macro".to_string()],
        source_ids,
        is_urgent: false,
    }
}
