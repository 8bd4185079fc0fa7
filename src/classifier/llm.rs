//! Chat-completions client for document-type classification.
//!
//! The raw completion is scanned for a JSON envelope rather than parsed
//! directly: models wrap answers in code fences and prose, and crawled page
//! text pasted into the prompt can provoke even noisier output.

use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Hard timeout for one classification call.
const LLM_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model quota exhausted")]
    Quota,
    #[error("model API returned HTTP {0}")]
    Http(u16),
    #[error("model call timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed model response: {0}")]
    Malformed(String),
}

/// The model's verdict for one document.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmVerdict {
    pub document_type: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

const SYSTEM_PROMPT: &str = "You classify manufacturer PDF documents. \
Reply with STRICT JSON only: {\"document_type\": <one of \"Product Data Sheet\", \
\"Specification Sheet\", \"Submittal Sheet\", \"Technical Data Sheet\", \
\"Installation Manual\", \"Operation & Maintenance\", \"Engineering Diagram\", \
\"Marketing\", \"Unknown\">, \"confidence\": <number in [0,1]>}. \
No prose, no markdown.";

pub struct LlmClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_base: &str, api_key: &str, model: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(LLM_TIMEOUT_SECS))
            .build()
            .expect("Failed to build LLM HTTP client");
        LlmClient {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// Ask the model for a document type. The prompt carries the filename
    /// and, when extraction succeeded, the first page of text.
    pub async fn classify(
        &self,
        filename: &str,
        excerpt: Option<&str>,
    ) -> Result<LlmVerdict, LlmError> {
        let user_prompt = match excerpt {
            Some(text) => format!("Filename: {filename}\n\nFirst page:\n{text}"),
            None => format!("Filename: {filename}\n\n(No text could be extracted.)"),
        };

        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt},
            ],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Network(e.to_string())
                }
            })?;

        match response.status().as_u16() {
            200 => {}
            402 => return Err(LlmError::Quota),
            code => return Err(LlmError::Http(code)),
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| LlmError::Malformed("no completion content".to_string()))?;

        let envelope = extract_json_envelope(content)
            .ok_or_else(|| LlmError::Malformed(format!("no JSON envelope in: {content}")))?;

        let mut verdict: LlmVerdict = serde_json::from_value(envelope)
            .map_err(|e| LlmError::Malformed(e.to_string()))?;
        verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
        Ok(verdict)
    }
}

/// Pull a JSON object out of a possibly noisy completion: direct parse
/// first, then code-fence stripping, then a balanced-brace scan that is
/// aware of strings and escapes.
pub fn extract_json_envelope(s: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(s) {
        if v.is_object() {
            return Some(v);
        }
    }

    let fence = Regex::new(r"```(?:json)?\s*([\s\S]*?)```").expect("static regex");
    if let Some(cap) = fence.captures(s) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(cap[1].trim()) {
            if v.is_object() {
                return Some(v);
            }
        }
    }

    scan_balanced_object(s)
}

fn scan_balanced_object(s: &str) -> Option<serde_json::Value> {
    let bytes = s.as_bytes();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if start.is_none() {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &s[start?..=i];
                        if let Ok(v) = serde_json::from_str::<serde_json::Value>(candidate) {
                            if v.is_object() {
                                return Some(v);
                            }
                        }
                        start = None;
                    }
                }
            }
            _ => {}
        }
    }
    None
}
