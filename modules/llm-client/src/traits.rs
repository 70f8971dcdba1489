use anyhow::Result;
use async_trait::async_trait;

use crate::types::AnalysisEntry;

/// The model surface the engine depends on. Production uses
/// [`crate::LlmClient`]; tests swap in counting mocks.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Batched analysis: send concatenated item text under a fixed system
    /// prompt, get back parsed JSON entries.
    async fn analyze(&self, batch_text: &str, system_prompt: &str) -> Result<Vec<AnalysisEntry>>;

    /// Free-text generation for user-initiated deep dives.
    async fn generate(&self, input: &str, system_prompt: &str) -> Result<String>;

    /// OCR an image or transcribe audio by inlining the blob as a
    /// multimodal part.
    async fn transcribe(&self, mime_type: &str, data: &[u8], instruction: &str) -> Result<String>;
}
