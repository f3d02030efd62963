//! Stable Diffusion through the Automatic1111 web API (`/sdapi/v1/txt2img`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{decode_base64, read_json};
use super::{GenerationRequest, Strategy};
use crate::error::ProviderError;

pub const PROVIDER: &str = "stable-diffusion";

const NEGATIVE_PROMPT: &str = "blurry, low quality, distorted, ugly, bad anatomy";
const STEPS: u32 = 20;
const CFG_SCALE: f32 = 7.0;
const SAMPLER: &str = "DPM++ 2M Karras";

#[derive(Debug, Clone)]
pub struct StableDiffusionSettings {
    pub base_url: String,
    /// Checkpoint override (`sd_model_checkpoint`); server default when unset.
    pub model: Option<String>,
}

pub struct StableDiffusionStrategy {
    http: reqwest::Client,
    settings: StableDiffusionSettings,
    endpoint: String,
}

#[derive(Serialize)]
struct Txt2ImgBody<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    steps: u32,
    cfg_scale: f32,
    width: u32,
    height: u32,
    sampler_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    override_settings: Option<OverrideSettings<'a>>,
}

#[derive(Serialize)]
struct OverrideSettings<'a> {
    sd_model_checkpoint: &'a str,
}

#[derive(Deserialize)]
struct Txt2ImgReply {
    #[serde(default)]
    images: Vec<String>,
}

impl StableDiffusionStrategy {
    pub fn new(settings: StableDiffusionSettings, http: reqwest::Client) -> Self {
        let endpoint = format!(
            "{}/sdapi/v1/txt2img",
            settings.base_url.trim_end_matches('/')
        );
        Self {
            http,
            settings,
            endpoint,
        }
    }
}

#[async_trait]
impl Strategy for StableDiffusionStrategy {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, ProviderError> {
        let body = Txt2ImgBody {
            prompt: &request.prompt,
            negative_prompt: NEGATIVE_PROMPT,
            steps: STEPS,
            cfg_scale: CFG_SCALE,
            width: request.width,
            height: request.height,
            sampler_name: SAMPLER,
            override_settings: self
                .settings
                .model
                .as_deref()
                .map(|sd_model_checkpoint| OverrideSettings { sd_model_checkpoint }),
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
        let reply: Txt2ImgReply = read_json(PROVIDER, resp).await?;

        match reply.images.first() {
            Some(encoded) => decode_base64(PROVIDER, encoded),
            None => Err(ProviderError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: "response contained no images".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "pixel-art game icon, apple".into(),
            width: 32,
            height: 32,
        }
    }

    #[tokio::test]
    async fn sends_txt2img_payload() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/sdapi/v1/txt2img")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "prompt": "pixel-art game icon, apple",
                "negative_prompt": NEGATIVE_PROMPT,
                "steps": 20,
                "width": 32,
                "height": 32,
                "sampler_name": "DPM++ 2M Karras",
                "override_settings": {"sd_model_checkpoint": "pixel-v1"}
            })))
            .with_status(200)
            .with_body(r#"{"images":["aGk="],"parameters":{}}"#)
            .create_async()
            .await;

        let strategy = StableDiffusionStrategy::new(
            StableDiffusionSettings {
                base_url: format!("{}/", server.url()),
                model: Some("pixel-v1".into()),
            },
            reqwest::Client::new(),
        );
        assert_eq!(strategy.generate(&request()).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn empty_image_list_is_malformed() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/sdapi/v1/txt2img")
            .with_status(200)
            .with_body(r#"{"images":[]}"#)
            .create_async()
            .await;

        let strategy = StableDiffusionStrategy::new(
            StableDiffusionSettings {
                base_url: server.url(),
                model: None,
            },
            reqwest::Client::new(),
        );
        let err = strategy.generate(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse { .. }));
    }
}
