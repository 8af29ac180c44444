use super::raster::PageImage;
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

pub const EXTRACTION_PROMPT: &str = r#"You analyse pages of scanned tender documents.
For the page image you receive:
1. Detect the page title (highlighted heading at the top) and return it in "titlePage" (empty string if none).
2. Identify every element in reading order. Allowed types: "text", "table", "checkbox-table", "chart", "diagram", "image", "logo", "signature".
3. For every "checkbox-table" read each box and report whether it is checked, without skipping any.
4. For "image", "logo" and "signature" add "coordinates": {"x", "y", "width", "height"} with the position and size on the page.
5. Report "confidence" as a float between 0.0 and 1.0.

Answer with JSON only:
{"titlePage": string, "confidence": float, "elements": [
  {"id": "p<page>_e<n>", "type": string, "position": int, "title": string, "description": string,
   "content": <"text": string | "table": [[cell, ...], ...] | "checkbox-table": [{"label": string, "checked": bool}, ...] | other types: "">,
   "coordinates": {"x": number, "y": number, "width": number, "height": number} or {},
   "metadata": {}}
]}"#;

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("vision request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vision service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("vision service returned no content")]
    EmptyResponse,
    #[error("vision call timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid vision client configuration: {0}")]
    Config(String),
}

/// Raw answer of the vision model for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionResponse {
    pub text: String,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
}

/// Sends a page image to a vision-capable model and returns its raw text answer.
#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn analyze_page(
        &self,
        image: &PageImage,
        page_number: u32,
    ) -> Result<VisionResponse, VisionError>;
}

/// User-turn text sent alongside each page image.
pub fn page_hint(page_number: u32) -> String {
    format!("Page {page_number}: analyse this image.")
}

/// Encode image bytes as a `data:` URI for multimodal chat payloads.
pub fn image_data_uri(data: &[u8], mime_type: &str) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(data);
    format!("data:{};base64,{}", mime_type, b64)
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Clone)]
pub struct OpenAiVisionClient {
    client: Client,
    endpoint: String,
    model: String,
}

impl OpenAiVisionClient {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, VisionError> {
        if api_key.trim().is_empty() {
            return Err(VisionError::Config("missing API key".into()));
        }
        if model.trim().is_empty() {
            return Err(VisionError::Config("missing model name".into()));
        }
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| VisionError::Config("API key is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl VisionClient for OpenAiVisionClient {
    async fn analyze_page(
        &self,
        image: &PageImage,
        page_number: u32,
    ) -> Result<VisionResponse, VisionError> {
        let request = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![
                json!({"role": "system", "content": EXTRACTION_PROMPT}),
                json!({"role": "user", "content": [
                    {"type": "text", "text": page_hint(page_number)},
                    {"type": "image_url", "image_url": {"url": image_data_uri(&image.data, image.mime_type)}}
                ]}),
            ],
        };

        let resp = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(VisionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = resp.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(VisionError::EmptyResponse)?;

        Ok(VisionResponse {
            text,
            tokens_in: parsed.usage.as_ref().map(|u| u.prompt_tokens),
            tokens_out: parsed.usage.as_ref().map(|u| u.completion_tokens),
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
