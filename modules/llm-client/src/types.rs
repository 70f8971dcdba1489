use serde::{Deserialize, Serialize};

// =============================================================================
// Request
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineData {
    pub mime_type: String,
    /// Base64-encoded blob bytes.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

impl GenerateRequest {
    pub fn new() -> Self {
        Self {
            contents: Vec::new(),
            system_instruction: None,
            generation_config: None,
        }
    }

    pub fn system(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = Some(Content {
            role: None,
            parts: vec![Part::Text { text: text.into() }],
        });
        self
    }

    pub fn user_text(mut self, text: impl Into<String>) -> Self {
        self.contents.push(Content {
            role: Some("user".to_string()),
            parts: vec![Part::Text { text: text.into() }],
        });
        self
    }

    /// A single user turn mixing text and inline media parts.
    pub fn user_parts(mut self, parts: Vec<Part>) -> Self {
        self.contents.push(Content {
            role: Some("user".to_string()),
            parts,
        });
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.generation_config
            .get_or_insert_with(|| GenerationConfig {
                temperature: None,
                response_mime_type: None,
            })
            .temperature = Some(temperature);
        self
    }

    pub fn json_response(mut self) -> Self {
        self.generation_config
            .get_or_insert_with(|| GenerationConfig {
                temperature: None,
                response_mime_type: None,
            })
            .response_mime_type = Some("application/json".to_string());
        self
    }
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Response
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Candidate {
    pub content: Option<Content>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl GenerateResponse {
    /// First candidate's first text part.
    pub fn text(&self) -> Option<&str> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .find_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
    }
}

// =============================================================================
// Analysis entries
// =============================================================================

/// One element of the model's JSON-array analysis output. Fields are
/// lenient: a missing score or sentiment downgrades the entry rather
/// than failing the whole batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisEntry {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub fact_check: Option<String>,
    #[serde(default)]
    pub relevance_score: i64,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub tickers: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_ids: Vec<String>,
    #[serde(default)]
    pub is_urgent: bool,
}

/// Parse the model's text output into analysis entries. Tolerates a
/// single-object response by wrapping it, and markdown code fences
/// around the JSON.
pub fn parse_entries(text: &str) -> anyhow::Result<Vec<AnalysisEntry>> {
    let stripped = strip_code_fence(text);
    let value: serde_json::Value = serde_json::from_str(stripped)?;
    let array = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    Ok(serde_json::from_value(serde_json::Value::Array(array))?)
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_response() {
        let entries = parse_entries(
            r#"[{"summary":"Rate hike 25bp","analysis":"tightening","relevance_score":85,
                "sentiment":"bearish","tickers":["SPY"],"tags":["macro"],"source_ids":["abc"]}]"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relevance_score, 85);
        assert_eq!(entries[0].sentiment.as_deref(), Some("bearish"));
    }

    #[test]
    fn wraps_single_object_response() {
        let entries =
            parse_entries(r#"{"summary":"solo","relevance_score":50}"#).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].summary, "solo");
    }

    #[test]
    fn empty_array_is_ok() {
        assert!(parse_entries("[]").unwrap().is_empty());
    }

    #[test]
    fn strips_markdown_fence() {
        let entries = parse_entries("```json\n[{\"summary\":\"fenced\"}]\n```").unwrap();
        assert_eq!(entries[0].summary, "fenced");
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_entries("not json at all").is_err());
    }

    #[test]
    fn request_serializes_wire_shape() {
        let req = GenerateRequest::new()
            .system("You are an analyst.")
            .user_text("hello")
            .temperature(0.2)
            .json_response();
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "You are an analyst.");
        assert_eq!(json["generationConfig"]["response_mime_type"], "application/json");
    }

    #[test]
    fn response_text_reads_first_part() {
        let resp: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"[]"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(resp.text(), Some("[]"));
    }
}
