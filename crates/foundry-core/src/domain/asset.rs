//! Asset model: what the pipeline is asked for and what a completed task
//! records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category tag of a generated asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Character,
    Background,
    Ui,
    Icon,
    General,
}

impl AssetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetKind::Character => "character",
            AssetKind::Background => "background",
            AssetKind::Ui => "ui",
            AssetKind::Icon => "icon",
            AssetKind::General => "general",
        }
    }

    pub fn target_size(self) -> TargetSize {
        match self {
            AssetKind::Character => TargetSize::new(64, 64),
            AssetKind::Background => TargetSize::new(800, 600),
            AssetKind::Ui => TargetSize::new(128, 32),
            AssetKind::Icon => TargetSize::new(32, 32),
            AssetKind::General => TargetSize::new(128, 128),
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for TargetSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One generation request derived from a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    pub kind: AssetKind,
    pub prompt: String,
    pub description: String,
    pub size: TargetSize,
}

/// Produced asset as recorded in a completed task's `result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDescriptor {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    pub prompt: String,
    pub target_size: TargetSize,
    pub description: String,
    pub filename: String,
    pub path: String,
    pub provider: String,
}

/// How much of a task came from real providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineOutcome {
    /// Every request was served by a remote strategy.
    Full,
    /// Some requests fell through to the placeholder.
    Partial,
    /// Every request fell through to the placeholder.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub assets: Vec<AssetDescriptor>,
    pub duration_ms: u64,
    pub outcome: PipelineOutcome,
}

impl TaskResult {
    pub fn new(assets: Vec<AssetDescriptor>, duration_ms: u64, outcome: PipelineOutcome) -> Self {
        Self {
            assets,
            duration_ms,
            outcome,
        }
    }
}

const MAX_SLUG_LEN: usize = 48;

/// `<slug(description)>_<UTC timestamp with millis>.png`.
///
/// Deterministic for a given `(description, at)`; the timestamp keeps
/// recurring descriptions from overwriting each other.
pub fn asset_filename(description: &str, at: DateTime<Utc>) -> String {
    let mut slug = String::with_capacity(description.len());
    for c in description.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "asset" } else { slug };
    format!("{slug}_{}.png", at.format("%Y%m%dT%H%M%S%3fZ"))
}
