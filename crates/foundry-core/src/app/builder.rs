//! AppBuilder - wiring and startup validation.
//!
//! # Fail-fast
//! `build()` checks everything that would otherwise surface as a confusing
//! runtime failure: a blank role, a remote provider selected without
//! credentials, an unreachable or unusable queue backend. Any of these is a
//! `BuildError` and the process should exit non-zero.
//!
//! Tasks already sitting in `processing` are reported at startup and left
//! where they are.

use std::sync::Arc;

use tokio::sync::watch;

use crate::app::reaper_loop::ReaperLoop;
use crate::app::result_writer::ResultWriter;
use crate::app::worker_loop::{WorkerLoop, WorkerReport, WorkerSettings};
use crate::config::{FoundryConfig, ProviderKind, QueueBackendConfig};
use crate::domain::Role;
use crate::error::{ConfigError, QueueError};
use crate::impls::{DirectoryQueue, FsAssetStore, NoopCommitSink, StreamQueue, StreamQueueSettings};
use crate::pipeline::{FallbackPipeline, OpenAiStrategy, StableDiffusionStrategy, Strategy};
use crate::ports::{AssetStore, Clock, CommitSink, QueueStore, SystemClock};

/// Builds a ready-to-run `App` from a `FoundryConfig`.
///
/// ```ignore
/// let app = AppBuilder::new(FoundryConfig::from_env()?).build().await?;
/// let report = app.run(shutdown_rx).await;
/// ```
///
/// Every collaborator can be swapped before `build()`; whatever is not
/// supplied is derived from the configuration.
pub struct AppBuilder {
    config: FoundryConfig,
    store: Option<Arc<dyn QueueStore>>,
    strategies: Option<Vec<Arc<dyn Strategy>>>,
    assets: Option<Arc<dyn AssetStore>>,
    commits: Option<Arc<dyn CommitSink>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("worker role must not be empty")]
    EmptyRole,

    #[error("{provider} is in the provider chain but {key} is not set")]
    MissingCredential {
        provider: &'static str,
        key: &'static str,
    },

    #[error("queue backend: {0}")]
    Queue(#[from] QueueError),

    #[error("http client: {0}")]
    HttpClient(String),
}

impl AppBuilder {
    pub fn new(config: FoundryConfig) -> Self {
        Self {
            config,
            store: None,
            strategies: None,
            assets: None,
            commits: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use an already-open queue instead of the configured backend.
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the configured provider chain.
    pub fn with_strategies(mut self, strategies: Vec<Arc<dyn Strategy>>) -> Self {
        self.strategies = Some(strategies);
        self
    }

    pub fn with_asset_store(mut self, assets: Arc<dyn AssetStore>) -> Self {
        self.assets = Some(assets);
        self
    }

    pub fn with_commit_sink(mut self, commits: Arc<dyn CommitSink>) -> Self {
        self.commits = Some(commits);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn build(self) -> Result<App, BuildError> {
        let cfg = self.config;
        if cfg.role.trim().is_empty() {
            return Err(BuildError::EmptyRole);
        }
        let role = Role::new(cfg.role.trim());

        let strategies = match self.strategies {
            Some(strategies) => strategies,
            None => remote_strategies(&cfg)?,
        };

        let (store, reaper_schedule) = match self.store {
            Some(store) => (store, None),
            None => open_store(&cfg, Arc::clone(&self.clock)).await?,
        };

        let stranded = store.stranded().await?;
        for task in &stranded {
            tracing::warn!(
                task_id = %task.id,
                role = %task.role,
                embedded_status = %task.embedded_status,
                "task left in processing by a previous run; not requeued"
            );
        }

        let assets: Arc<dyn AssetStore> = match self.assets {
            Some(assets) => assets,
            None => Arc::new(FsAssetStore::new(&cfg.output_root, &cfg.assets_dir)),
        };
        let commits: Arc<dyn CommitSink> = match self.commits {
            Some(commits) => commits,
            None => Arc::new(NoopCommitSink),
        };
        let writer = ResultWriter::new(assets, commits, Arc::clone(&self.clock));
        let pipeline = FallbackPipeline::new(strategies, cfg.request_timeout, cfg.style.clone());

        let reaper = reaper_schedule.map(|(interval, min_idle)| {
            ReaperLoop::new(role.clone(), Arc::clone(&store), interval, min_idle)
        });

        let worker = WorkerLoop::new(
            role,
            Arc::clone(&store),
            Arc::new(pipeline),
            Arc::new(writer),
            WorkerSettings {
                poll_interval: cfg.poll_interval,
                max_backoff: cfg.max_backoff,
                drain_grace: cfg.drain_grace,
            },
        );

        tracing::info!(
            agent_id = %cfg.agent_id,
            backend = store.backend(),
            stranded = stranded.len(),
            reaper = reaper.is_some(),
            "app built"
        );

        Ok(App {
            worker,
            reaper,
            store,
        })
    }
}

fn remote_strategies(cfg: &FoundryConfig) -> Result<Vec<Arc<dyn Strategy>>, BuildError> {
    if cfg.providers.is_empty() {
        return Ok(Vec::new());
    }

    let http = reqwest::Client::builder()
        .timeout(cfg.request_timeout)
        .build()
        .map_err(|e| BuildError::HttpClient(e.to_string()))?;

    let mut strategies: Vec<Arc<dyn Strategy>> = Vec::with_capacity(cfg.providers.len());
    for provider in &cfg.providers {
        match provider {
            ProviderKind::OpenAi => {
                if cfg.openai.api_key.trim().is_empty() {
                    return Err(BuildError::MissingCredential {
                        provider: crate::pipeline::openai::PROVIDER,
                        key: "OPENAI_IMAGE_API_KEY",
                    });
                }
                strategies.push(Arc::new(OpenAiStrategy::new(cfg.openai.clone(), http.clone())));
            }
            ProviderKind::StableDiffusion => {
                strategies.push(Arc::new(StableDiffusionStrategy::new(
                    cfg.stable_diffusion.clone(),
                    http.clone(),
                )));
            }
        }
    }
    Ok(strategies)
}

type ReaperSchedule = Option<(std::time::Duration, std::time::Duration)>;

async fn open_store(
    cfg: &FoundryConfig,
    clock: Arc<dyn Clock>,
) -> Result<(Arc<dyn QueueStore>, ReaperSchedule), BuildError> {
    match &cfg.queue {
        QueueBackendConfig::Directory { root } => {
            let queue: Arc<dyn QueueStore> = Arc::new(DirectoryQueue::with_clock(root, clock).await?);
            Ok((queue, None))
        }
        QueueBackendConfig::Stream {
            url,
            namespace,
            reclaim_idle,
            reclaim_interval,
            max_deliveries,
        } => {
            let settings = StreamQueueSettings {
                namespace: namespace.clone(),
                consumer: cfg.agent_id.clone(),
                block: cfg.poll_interval,
                max_deliveries: *max_deliveries,
            };
            let queue: Arc<dyn QueueStore> =
                Arc::new(StreamQueue::connect_with_clock(url, settings, clock).await?);
            Ok((queue, Some((*reclaim_interval, *reclaim_idle))))
        }
    }
}

/// A wired worker plus, for the stream backend, its reaper.
pub struct App {
    worker: WorkerLoop,
    reaper: Option<ReaperLoop>,
    store: Arc<dyn QueueStore>,
}

impl App {
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn has_reaper(&self) -> bool {
        self.reaper.is_some()
    }

    /// Run the worker (and reaper) until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> WorkerReport {
        match &self.reaper {
            Some(reaper) => {
                let (report, reclaimed) = tokio::join!(self.worker.run(shutdown.clone()), reaper.run(shutdown));
                tracing::debug!(reclaimed, "reaper finished");
                report
            }
            None => self.worker.run(shutdown).await,
        }
    }
}
