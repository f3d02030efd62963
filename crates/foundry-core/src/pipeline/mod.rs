//! Fallback Pipeline - payload in, one normalised image per request out.
//!
//! # Design
//! - Requests are derived from the payload (`request`).
//! - For each request the configured strategies are tried in order. Every
//!   call is bounded by `call_timeout`; any `ProviderError` (including an
//!   undecodable image) moves on to the next strategy.
//! - When every strategy failed the placeholder fills in. It cannot fail, so
//!   once derivation succeeded the pipeline always yields a full set of
//!   assets.

pub mod http;
pub mod normalize;
pub mod openai;
pub mod placeholder;
pub mod request;
pub mod stable_diffusion;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::RgbaImage;

use crate::domain::{AssetRequest, Payload, PipelineOutcome};
use crate::error::{PipelineError, ProviderError};

pub use self::openai::{OpenAiSettings, OpenAiStrategy};
pub use self::request::{MAX_REQUESTS, derive_requests};
pub use self::stable_diffusion::{StableDiffusionSettings, StableDiffusionStrategy};

/// What a strategy is asked to draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
}

/// One image source (remote API, local model, ...).
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Provider label recorded in asset descriptors and logs.
    fn name(&self) -> &str;

    /// Raw encoded image bytes (PNG, JPEG, ...).
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GeneratedAsset {
    pub request: AssetRequest,
    pub provider: String,
    pub image: RgbaImage,
}

impl GeneratedAsset {
    pub fn is_placeholder(&self) -> bool {
        self.provider == placeholder::PROVIDER
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub assets: Vec<GeneratedAsset>,
    pub outcome: PipelineOutcome,
    pub duration: Duration,
}

pub struct FallbackPipeline {
    strategies: Vec<Arc<dyn Strategy>>,
    call_timeout: Duration,
    style: String,
}

impl FallbackPipeline {
    pub fn new(
        strategies: Vec<Arc<dyn Strategy>>,
        call_timeout: Duration,
        style: impl Into<String>,
    ) -> Self {
        Self {
            strategies,
            call_timeout,
            style: style.into(),
        }
    }

    /// Placeholder-only pipeline.
    pub fn placeholder_only(style: impl Into<String>) -> Self {
        Self::new(Vec::new(), Duration::from_secs(1), style)
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, payload: &Payload) -> Result<PipelineOutput, PipelineError> {
        let started = Instant::now();
        let requests = derive_requests(payload, &self.style)?;

        let mut assets = Vec::with_capacity(requests.len());
        for request in requests {
            assets.push(self.produce(request).await);
        }

        let placeholders = assets.iter().filter(|a| a.is_placeholder()).count();
        let outcome = if placeholders == 0 {
            PipelineOutcome::Full
        } else if placeholders == assets.len() {
            PipelineOutcome::Placeholder
        } else {
            PipelineOutcome::Partial
        };

        Ok(PipelineOutput {
            assets,
            outcome,
            duration: started.elapsed(),
        })
    }

    async fn produce(&self, request: AssetRequest) -> GeneratedAsset {
        let call = GenerationRequest {
            prompt: request.prompt.clone(),
            width: request.size.width,
            height: request.size.height,
        };

        for strategy in &self.strategies {
            let provider = strategy.name();
            let generated = match tokio::time::timeout(self.call_timeout, strategy.generate(&call)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    provider: provider.to_string(),
                }),
            };
            match generated.and_then(|bytes| normalize::normalize(&bytes, request.size, provider)) {
                Ok(image) => {
                    tracing::info!(provider, kind = %request.kind, size = %request.size, "asset generated");
                    return GeneratedAsset {
                        provider: provider.to_string(),
                        request,
                        image,
                    };
                }
                Err(e) => {
                    tracing::warn!(provider, kind = %request.kind, error_kind = e.kind(), error = %e, "strategy failed");
                }
            }
        }

        tracing::info!(kind = %request.kind, "using placeholder");
        GeneratedAsset {
            image: placeholder::render(request.kind, request.size),
            provider: placeholder::PROVIDER.to_string(),
            request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AssetKind;
    use image::Rgba;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted strategy.
    struct Fake {
        name: &'static str,
        reply: fn() -> Result<Vec<u8>, ProviderError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Fake {
        fn new(name: &'static str, reply: fn() -> Result<Vec<u8>, ProviderError>) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Strategy for Fake {
        fn name(&self) -> &str {
            self.name
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<Vec<u8>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            (self.reply)()
        }
    }

    fn red_png() -> Result<Vec<u8>, ProviderError> {
        Ok(normalize::encode_png(&RgbaImage::from_pixel(128, 128, Rgba([255, 0, 0, 255]))).unwrap())
    }

    fn outage() -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::Http {
            provider: "down".into(),
            status: 503,
            body: "unavailable".into(),
        })
    }

    fn garbage() -> Result<Vec<u8>, ProviderError> {
        Ok(b"not an image".to_vec())
    }

    fn snake() -> Payload {
        Payload::new("Snake Sprite", "green pixel-art snake")
    }

    #[tokio::test]
    async fn first_working_strategy_wins() {
        let down = Fake::new("down", outage);
        let good = Fake::new("good", red_png);
        let never = Fake::new("never", red_png);
        let pipeline = FallbackPipeline::new(
            vec![
                down.clone() as Arc<dyn Strategy>,
                good.clone() as Arc<dyn Strategy>,
                never.clone() as Arc<dyn Strategy>,
            ],
            Duration::from_secs(5),
            "pixel-art",
        );

        let out = pipeline.run(&snake()).await.unwrap();

        assert_eq!(out.outcome, PipelineOutcome::Full);
        assert_eq!(out.assets.len(), 1);
        assert_eq!(out.assets[0].provider, "good");
        assert_eq!(out.assets[0].image.dimensions(), (64, 64));
        assert_eq!(down.calls.load(Ordering::SeqCst), 1);
        assert_eq!(never.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn total_outage_falls_back_to_placeholder() {
        let pipeline = FallbackPipeline::new(
            vec![
                Fake::new("a", outage) as Arc<dyn Strategy>,
                Fake::new("b", garbage) as Arc<dyn Strategy>,
            ],
            Duration::from_secs(5),
            "pixel-art",
        );

        let out = pipeline.run(&snake()).await.unwrap();

        assert_eq!(out.outcome, PipelineOutcome::Placeholder);
        let asset = &out.assets[0];
        assert!(asset.is_placeholder());
        assert_eq!(asset.request.kind, AssetKind::Character);
        assert_eq!(asset.image.dimensions(), (64, 64));
        assert_eq!(asset.image.get_pixel(0, 0), &Rgba([100, 149, 237, 255]));
    }

    #[tokio::test]
    async fn slow_strategy_is_cut_off() {
        let slow = Arc::new(Fake {
            name: "slow",
            reply: red_png,
            delay: Duration::from_secs(30),
            calls: AtomicUsize::new(0),
        });
        let pipeline = FallbackPipeline::new(vec![slow as Arc<dyn Strategy>], Duration::from_millis(20), "pixel-art");

        let started = Instant::now();
        let out = pipeline.run(&snake()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(out.outcome, PipelineOutcome::Placeholder);
    }

    #[tokio::test]
    async fn mixed_results_are_partial() {
        // Serves the first call only.
        struct Once(AtomicUsize);

        #[async_trait]
        impl Strategy for Once {
            fn name(&self) -> &str {
                "once"
            }

            async fn generate(&self, _request: &GenerationRequest) -> Result<Vec<u8>, ProviderError> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    red_png()
                } else {
                    outage()
                }
            }
        }

        let pipeline = FallbackPipeline::new(
            vec![Arc::new(Once(AtomicUsize::new(0))) as Arc<dyn Strategy>],
            Duration::from_secs(5),
            "pixel-art",
        );
        let out = pipeline
            .run(&Payload::new("Snake", "snake on a map"))
            .await
            .unwrap();

        assert_eq!(out.assets.len(), 2);
        assert_eq!(out.outcome, PipelineOutcome::Partial);
    }

    #[tokio::test]
    async fn no_strategies_still_produces_assets() {
        let out = FallbackPipeline::placeholder_only("pixel-art")
            .run(&snake())
            .await
            .unwrap();
        assert_eq!(out.outcome, PipelineOutcome::Placeholder);
        assert_eq!(out.assets.len(), 1);
    }

    #[tokio::test]
    async fn blank_prompt_fails_derivation() {
        let err = FallbackPipeline::placeholder_only("pixel-art")
            .run(&Payload::new("Snake", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Derivation(_)));
    }
}
