// Media enrichment: download an attached blob and turn it into text the
// pipeline can use. PDFs are marked for forced re-analysis rather than
// parsed here; images and audio go through the model.

use std::time::Duration;

use llm_client::Llm;
use tracing::info;

use refinery_common::{MediaKind, MediaRef, RefineryError, Result};

use crate::prompts;

const MEDIA_TIMEOUT: Duration = Duration::from_secs(20);
const MEDIA_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Sentinel appended for PDF attachments; a later pass re-analyzes the
/// item with the document in hand.
pub const PDF_SENTINEL: &str = "[PDF DOCUMENT]";

pub struct MediaCollector {
    http: reqwest::Client,
}

impl MediaCollector {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(MEDIA_TIMEOUT)
            .build()
            .expect("Failed to build media HTTP client");
        Self { http }
    }

    /// Resolve a media reference to text: the PDF sentinel, an OCR
    /// result, a transcript, or nothing for unusable blobs.
    pub async fn enrich(&self, media: &MediaRef, llm: &dyn Llm) -> Result<Option<String>> {
        // A declared PDF never needs the bytes.
        if classify(media.mime_type.as_deref(), &media.url) == MediaKind::Pdf {
            return Ok(Some(PDF_SENTINEL.to_string()));
        }

        let response = self
            .http
            .get(&media.url)
            .send()
            .await
            .map_err(|e| RefineryError::Media(e.to_string()))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RefineryError::Media(e.to_string()))?;
        if bytes.len() > MEDIA_MAX_BYTES {
            return Err(RefineryError::Media(format!(
                "blob too large: {} bytes",
                bytes.len()
            )));
        }

        let mime = media
            .mime_type
            .clone()
            .or(content_type)
            .unwrap_or_else(|| "application/octet-stream".to_string());

        match classify(Some(&mime), &media.url) {
            MediaKind::Pdf => Ok(Some(PDF_SENTINEL.to_string())),
            MediaKind::Image => {
                let text = llm
                    .transcribe(&mime, &bytes, prompts::TRANSCRIBE_IMAGE)
                    .await
                    .map_err(|e| RefineryError::Media(e.to_string()))?;
                info!(url = %media.url, chars = text.len(), "Image OCR complete");
                Ok(Some(text))
            }
            MediaKind::Audio => {
                let text = llm
                    .transcribe(&mime, &bytes, prompts::TRANSCRIBE_AUDIO)
                    .await
                    .map_err(|e| RefineryError::Media(e.to_string()))?;
                info!(url = %media.url, chars = text.len(), "Audio transcription complete");
                Ok(Some(text))
            }
            MediaKind::Other => Ok(None),
        }
    }
}

impl Default for MediaCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify from the declared mime type, falling back to the URL
/// extension.
pub fn classify(mime_type: Option<&str>, url: &str) -> MediaKind {
    if let Some(mime) = mime_type {
        let mime = mime.to_ascii_lowercase();
        if mime.contains("pdf") {
            return MediaKind::Pdf;
        }
        if mime.starts_with("image/") {
            return MediaKind::Image;
        }
        if mime.starts_with("audio/") {
            return MediaKind::Audio;
        }
        if !mime.is_empty() && mime != "application/octet-stream" {
            return MediaKind::Other;
        }
    }

    let path = url.split('?').next().unwrap_or(url).to_ascii_lowercase();
    match path.rsplit('.').next() {
        Some("pdf") => MediaKind::Pdf,
        Some("png" | "jpg" | "jpeg" | "gif" | "webp") => MediaKind::Image,
        Some("mp3" | "ogg" | "wav" | "m4a" | "oga") => MediaKind::Audio,
        _ => MediaKind::Other,
    }
}
