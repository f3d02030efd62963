//! OpenAI image generation (DALL-E).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{decode_base64, read_bytes, read_json};
use super::{GenerationRequest, Strategy};
use crate::error::ProviderError;

pub const PROVIDER: &str = "openai";

/// Phrases DALL-E renders better when spelled out.
const PROMPT_REWRITES: [(&str, &str); 3] = [
    ("pixel-art", "pixel art style, 8-bit graphics, retro video game"),
    ("sprite", "clean sprite with transparent background"),
    ("game asset", "video game asset, professional game art"),
];

const QUALITY_SUFFIX: &str = ", high quality, clean design, professional game art";

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Requested generation size (`1024x1024`); output is resized afterwards.
    pub size: String,
    pub quality: String,
}

pub struct OpenAiStrategy {
    http: reqwest::Client,
    settings: OpenAiSettings,
    endpoint: String,
}

#[derive(Serialize)]
struct GenerationBody<'a> {
    model: &'a str,
    prompt: &'a str,
    size: &'a str,
    quality: &'a str,
    n: u8,
}

#[derive(Deserialize)]
struct GenerationReply {
    #[serde(default)]
    data: Vec<GeneratedImage>,
}

#[derive(Deserialize)]
struct GeneratedImage {
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl OpenAiStrategy {
    pub fn new(settings: OpenAiSettings, http: reqwest::Client) -> Self {
        let endpoint = format!(
            "{}/v1/images/generations",
            settings.base_url.trim_end_matches('/')
        );
        Self {
            http,
            settings,
            endpoint,
        }
    }
}

pub fn optimize_prompt(prompt: &str) -> String {
    let lowered = prompt.to_lowercase();
    let mut optimized = prompt.to_string();
    for (phrase, replacement) in PROMPT_REWRITES {
        if lowered.contains(phrase) {
            optimized = optimized.replace(phrase, replacement);
        }
    }
    optimized.push_str(QUALITY_SUFFIX);
    optimized
}

#[async_trait]
impl Strategy for OpenAiStrategy {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, ProviderError> {
        if self.settings.api_key.trim().is_empty() {
            return Err(ProviderError::NotConfigured {
                provider: PROVIDER.to_string(),
                message: "no API key".into(),
            });
        }

        let prompt = optimize_prompt(&request.prompt);
        let body = GenerationBody {
            model: &self.settings.model,
            prompt: &prompt,
            size: &self.settings.size,
            quality: &self.settings.quality,
            n: 1,
        };
        tracing::debug!(provider = PROVIDER, model = %self.settings.model, prompt = %prompt, "requesting image");

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
        let reply: GenerationReply = read_json(PROVIDER, resp).await?;

        let Some(image) = reply.data.into_iter().next() else {
            return Err(ProviderError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: "response contained no images".into(),
            });
        };
        match (image.b64_json, image.url) {
            (Some(encoded), _) => decode_base64(PROVIDER, &encoded),
            (None, Some(url)) => {
                let resp = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
                read_bytes(PROVIDER, resp).await
            }
            (None, None) => Err(ProviderError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: "image has neither b64_json nor url".into(),
            }),
        }
    }
}
