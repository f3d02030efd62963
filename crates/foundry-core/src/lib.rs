//! foundry-core
//!
//! Role-scoped task queue workers that turn game-design tasks into image
//! assets.
//!
//! # Modules
//! - **domain**: task records, ids, asset model
//! - **ports**: QueueStore, AssetStore, CommitSink, Clock, IdGenerator
//! - **impls**: queue backends (directory, Redis stream, memory) and output
//! - **pipeline**: request derivation, strategies, placeholder, normalization
//! - **app**: worker loop, result writer, reaper, builder
//! - **config**: environment-style configuration
//! - **telemetry**: tracing subscriber setup
//! - **error**: error taxonomy

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod pipeline;
pub mod ports;
pub mod telemetry;
