use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use tracing::debug;

use crate::traits::Llm;
use crate::types::{parse_entries, AnalysisEntry, GenerateRequest, GenerateResponse, InlineData, Part};

const LLM_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-over-HTTPS client for the analysis model.
pub struct LlmClient {
    api_key: String,
    endpoint: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: &str, endpoint: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(LLM_TIMEOUT)
            .build()
            .expect("Failed to build LLM HTTP client");
        Self {
            api_key: api_key.to_string(),
            endpoint: endpoint.to_string(),
            http,
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&self.api_key)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    pub async fn generate_raw(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        debug!(contents = request.contents.len(), "LLM generate request");

        let response = self
            .http
            .post(&self.endpoint)
            .headers(self.headers()?)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("LLM API error ({}): {}", status, error_text));
        }

        Ok(response.json().await?)
    }

    async fn text_of(&self, request: &GenerateRequest) -> Result<String> {
        let response = self.generate_raw(request).await?;
        response
            .text()
            .map(|t| t.to_string())
            .ok_or_else(|| anyhow!("LLM response carried no text part"))
    }
}

#[async_trait]
impl Llm for LlmClient {
    async fn analyze(&self, batch_text: &str, system_prompt: &str) -> Result<Vec<AnalysisEntry>> {
        let request = GenerateRequest::new()
            .system(system_prompt)
            .user_text(batch_text)
            .temperature(0.2)
            .json_response();

        let text = self.text_of(&request).await?;
        parse_entries(&text)
    }

    async fn generate(&self, input: &str, system_prompt: &str) -> Result<String> {
        let request = GenerateRequest::new()
            .system(system_prompt)
            .user_text(input)
            .temperature(0.3);

        self.text_of(&request).await
    }

    async fn transcribe(&self, mime_type: &str, data: &[u8], instruction: &str) -> Result<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let request = GenerateRequest::new()
            .user_parts(vec![
                Part::Text {
                    text: instruction.to_string(),
                },
                Part::InlineData {
                    inline_data: InlineData {
                        mime_type: mime_type.to_string(),
                        data: encoded,
                    },
                },
            ])
            .temperature(0.0);

        self.text_of(&request).await
    }
}
