//! Configuration - immutable settings resolved once at startup.
//!
//! Everything comes from environment variables. Components never read the
//! environment themselves; they receive the pieces of `FoundryConfig` they
//! need.

use std::path::PathBuf;
use std::time::Duration;

use ulid::Ulid;

use crate::error::ConfigError;
use crate::pipeline::{MAX_REQUESTS, OpenAiSettings, StableDiffusionSettings};

const DEFAULT_DIRECTORY: &str = "./data/tasks";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_NAMESPACE: &str = "foundry";
const DEFAULT_ROLE: &str = "designer";
const DEFAULT_RECLAIM_IDLE: Duration = Duration::from_secs(300);
/// Headroom kept above the slowest possible task when the reclaim idle
/// threshold is derived rather than configured.
const RECLAIM_HEADROOM: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBackendConfig {
    Directory {
        root: PathBuf,
    },
    Stream {
        url: String,
        namespace: String,
        reclaim_idle: Duration,
        reclaim_interval: Duration,
        max_deliveries: u32,
    },
}

impl QueueBackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            QueueBackendConfig::Directory { .. } => "directory",
            QueueBackendConfig::Stream { .. } => "stream",
        }
    }
}

/// Remote strategies, in the order they appear in the provider chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    StableDiffusion,
}

#[derive(Debug, Clone)]
pub struct FoundryConfig {
    pub queue: QueueBackendConfig,
    pub role: String,
    /// Consumer identity (stream backend) and log label.
    pub agent_id: String,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub drain_grace: Duration,
    /// Empty means placeholder only.
    pub providers: Vec<ProviderKind>,
    pub openai: OpenAiSettings,
    pub stable_diffusion: StableDiffusionSettings,
    pub style: String,
    pub request_timeout: Duration,
    pub output_root: PathBuf,
    pub assets_dir: PathBuf,
    pub debug: bool,
}

impl FoundryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary key lookup. Blank values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let role = match env.raw("AGENT_ROLE") {
            Some(raw) if raw.trim().is_empty() => {
                return Err(invalid("AGENT_ROLE", raw, "role must not be empty"));
            }
            Some(raw) => raw.trim().to_string(),
            None => DEFAULT_ROLE.to_string(),
        };
        let agent_id = env
            .get("AGENT_ID")
            .unwrap_or_else(|| format!("{role}-{}", Ulid::new()));

        let poll_interval = env.millis("TASK_POLL_INTERVAL", 2_000)?;
        if poll_interval.is_zero() {
            return Err(invalid("TASK_POLL_INTERVAL", "0".into(), "must be positive"));
        }

        let (provider_key, chain) = match env.get("IMAGE_GENERATION_PROVIDER") {
            Some(chain) => ("IMAGE_GENERATION_PROVIDER", chain),
            None => (
                "IMAGE_GENERATION",
                env.get("IMAGE_GENERATION").unwrap_or_else(|| "disabled".into()),
            ),
        };
        let providers = parse_providers(provider_key, &chain)?;
        let request_timeout = env.millis("IMAGE_GENERATION_TIMEOUT_MS", 60_000)?;
        let slowest = slowest_task(request_timeout, providers.len());

        let queue = match env.get("TASK_QUEUE_BACKEND").as_deref() {
            None | Some("directory") => QueueBackendConfig::Directory {
                root: env
                    .get("TASK_QUEUE_DIRECTORY")
                    .unwrap_or_else(|| DEFAULT_DIRECTORY.to_string())
                    .into(),
            },
            Some("stream") => {
                let max_deliveries = env.number("STREAM_MAX_DELIVERIES", 5)?;
                let reclaim_idle = match env.get("STREAM_RECLAIM_IDLE_MS") {
                    None => DEFAULT_RECLAIM_IDLE.max(slowest.saturating_add(RECLAIM_HEADROOM)),
                    Some(_) => {
                        let idle = env.millis("STREAM_RECLAIM_IDLE_MS", 0)?;
                        // A live worker's entry would be taken over mid-task.
                        if idle <= slowest {
                            return Err(invalid(
                                "STREAM_RECLAIM_IDLE_MS",
                                idle.as_millis().to_string(),
                                format!("must exceed the slowest possible task ({}ms)", slowest.as_millis()),
                            ));
                        }
                        idle
                    }
                };
                if max_deliveries == 0 {
                    return Err(invalid("STREAM_MAX_DELIVERIES", "0".into(), "must be at least 1"));
                }
                QueueBackendConfig::Stream {
                    url: env
                        .get("TASK_QUEUE_URL")
                        .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
                    namespace: env
                        .get("TASK_QUEUE_NAMESPACE")
                        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                    reclaim_idle,
                    reclaim_interval: env.millis("STREAM_RECLAIM_INTERVAL_MS", 30_000)?,
                    max_deliveries: u32::try_from(max_deliveries).map_err(|_| {
                        invalid("STREAM_MAX_DELIVERIES", max_deliveries.to_string(), "too large")
                    })?,
                }
            }
            Some(other) => {
                return Err(invalid(
                    "TASK_QUEUE_BACKEND",
                    other.to_string(),
                    "expected `directory` or `stream`",
                ));
            }
        };

        let openai = OpenAiSettings {
            base_url: env
                .get("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com".into()),
            api_key: env
                .get("OPENAI_IMAGE_API_KEY")
                .or_else(|| env.get("OPENAI_API_KEY"))
                .unwrap_or_default(),
            model: env.get("OPENAI_IMAGE_MODEL").unwrap_or_else(|| "dall-e-3".into()),
            size: env.get("OPENAI_IMAGE_SIZE").unwrap_or_else(|| "1024x1024".into()),
            quality: env
                .get("OPENAI_IMAGE_QUALITY")
                .unwrap_or_else(|| "standard".into()),
        };
        let stable_diffusion = StableDiffusionSettings {
            base_url: env
                .get("STABLE_DIFFUSION_API_URL")
                .unwrap_or_else(|| "http://localhost:7860".into()),
            model: env.get("STABLE_DIFFUSION_MODEL"),
        };

        Ok(Self {
            queue,
            role,
            agent_id,
            poll_interval,
            max_backoff: env.millis("WORKER_MAX_BACKOFF_MS", 30_000)?,
            drain_grace: env.millis("WORKER_DRAIN_GRACE_MS", 10_000)?,
            providers,
            openai,
            stable_diffusion,
            style: env
                .get("IMAGE_GENERATION_STYLE")
                .unwrap_or_else(|| "pixel-art".into()),
            request_timeout,
            output_root: env.get("OUTPUT_ROOT").unwrap_or_else(|| ".".into()).into(),
            assets_dir: env
                .get("ASSETS_DIRECTORY")
                .unwrap_or_else(|| "web-game/assets".into())
                .into(),
            debug: env.flag("DEBUG")?,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.raw(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn number(&self, key: &'static str, default: u64) -> Result<u64, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid(key, raw, e.to_string())),
        }
    }

    fn millis(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.number(key, default).map(Duration::from_millis)
    }

    fn flag(&self, key: &'static str) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("false" | "0" | "no" | "off") => Ok(false),
            Some("true" | "1" | "yes" | "on") => Ok(true),
            Some(other) => Err(invalid(key, other.to_string(), "expected true or false")),
        }
    }
}

fn invalid(key: &'static str, value: String, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value,
        reason: reason.into(),
    }
}

/// Every request walks the whole chain and each call may run to the timeout.
fn slowest_task(request_timeout: Duration, providers: usize) -> Duration {
    let calls = u32::try_from(MAX_REQUESTS.saturating_mul(providers)).unwrap_or(u32::MAX);
    request_timeout.saturating_mul(calls)
}

fn parse_providers(key: &'static str, chain: &str) -> Result<Vec<ProviderKind>, ConfigError> {
    let mut providers = Vec::new();
    for name in chain.split(',').map(|n| n.trim().to_ascii_lowercase()) {
        let kind = match name.as_str() {
            "" | "disabled" | "local" => continue,
            "openai" => ProviderKind::OpenAi,
            "stable-diffusion" => ProviderKind::StableDiffusion,
            _ => {
                return Err(invalid(
                    key,
                    chain.to_string(),
                    format!("unknown provider `{name}` (expected openai, stable-diffusion, disabled)"),
                ));
            }
        };
        if !providers.contains(&kind) {
            providers.push(kind);
        }
    }
    Ok(providers)
}
