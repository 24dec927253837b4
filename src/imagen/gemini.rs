use super::{GeneratedImages, GenerationError, ImageGenerator};
use crate::collect::ImageItem;
use crate::config::Settings;
use crate::utils::truncate_str;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
/// Longest API error body echoed back to the user
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Gemini `generateContent` client for image models.
pub struct GeminiImageClient {
    http_client: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiImageClient {
    /// Create a client for `model`.
    ///
    /// # Errors
    ///
    /// Returns [`GenerationError::Client`] if the API key is empty or the HTTP
    /// client cannot be built.
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(GenerationError::Client("missing Gemini API key".to_string()));
        }

        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Client(e.to_string()))?;

        Ok(Self {
            http_client,
            api_key,
            model: model.into(),
            base_url: GEMINI_API_BASE.to_string(),
        })
    }

    /// Create a client from application settings.
    ///
    /// # Errors
    ///
    /// Returns [`GenerationError::Client`] if `GEMINI_API_KEY` is not set or
    /// the HTTP client cannot be built.
    pub fn from_settings(settings: &Settings) -> Result<Self, GenerationError> {
        Self::new(
            settings.gemini_api_key.clone().unwrap_or_default(),
            settings.imagen_model.clone(),
            settings.gemini_http_timeout(),
        )
    }

    /// Point the client at another endpoint, e.g. a proxy.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

#[async_trait]
impl ImageGenerator for GeminiImageClient {
    async fn generate(
        &self,
        prompt: &str,
        images: &[ImageItem],
        candidate_count: u32,
    ) -> Result<GeneratedImages, GenerationError> {
        let body = build_request_body(prompt, images, candidate_count);
        info!(
            model = %self.model,
            images = images.len(),
            candidate_count,
            "Sending generate request"
        );

        let response = self
            .http_client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Request(format!("network error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(%status, "Gemini returned an error");
            return Err(GenerationError::Request(format!(
                "API error: {status} - {}",
                truncate_str(error_text.trim(), MAX_ERROR_BODY_CHARS)
            )));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Request(format!("invalid response: {e}")))?;

        interpret_response(parsed)
    }
}

/// Build the `generateContent` body: the prompt first, then the images to edit.
fn build_request_body(prompt: &str, images: &[ImageItem], candidate_count: u32) -> Value {
    let mut parts = vec![json!({ "text": prompt })];
    parts.extend(images.iter().map(|img| {
        json!({
            "inline_data": {
                "mime_type": img.mime_type,
                "data": BASE64.encode(&img.data),
            }
        })
    }));

    json!({
        "contents": [{
            "role": "user",
            "parts": parts,
        }],
        "generationConfig": {
            "candidateCount": candidate_count,
            "responseModalities": ["TEXT", "IMAGE"],
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
    block_reason_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<Blob>,
}

#[derive(Debug, Deserialize)]
struct Blob {
    data: String,
}

fn interpret_response(response: GenerateContentResponse) -> Result<GeneratedImages, GenerationError> {
    if let Some(feedback) = response.prompt_feedback {
        if let Some(reason) = feedback.block_reason {
            return Err(GenerationError::Blocked(
                feedback.block_reason_message.unwrap_or(reason),
            ));
        }
    }

    if response.candidates.is_empty() {
        return Err(GenerationError::NoCandidates);
    }

    let mut result = GeneratedImages::default();
    for candidate in response.candidates {
        let parts = match candidate.content {
            Some(content) if !content.parts.is_empty() => content.parts,
            _ => {
                return Err(GenerationError::AbnormalFinish {
                    reason: candidate
                        .finish_reason
                        .unwrap_or_else(|| "unknown reason".to_string()),
                    texts: result.texts,
                })
            }
        };

        for part in parts {
            if let Some(text) = part.text.filter(|t| !t.trim().is_empty()) {
                result.texts.push(text);
            } else if let Some(blob) = part.inline_data {
                let image = BASE64
                    .decode(blob.data.as_bytes())
                    .map_err(|e| GenerationError::Request(format!("invalid image data: {e}")))?;
                result.images.push(image);
            } else {
                debug!("Skipping response part without text or image");
            }
        }
    }

    if result.images.is_empty() {
        return Err(GenerationError::NoImages {
            texts: result.texts,
        });
    }
    Ok(result)
}
