use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{CovisError, Result};

/// What the descriptor extractor does when its backbone cannot run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Backbone failures are returned to the caller.
    #[default]
    Strict,
    /// Backbone failures are logged and replaced with simulated features.
    Permissive,
}

/// Policy used to guarantee a single connected component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityRepair {
    /// Link every consecutive pair of views `(i, i + 1)`.
    #[default]
    Chain,
    /// Find components with union-find and bridge each one to the rest
    /// through its most similar cross-component pair.
    BridgeComponents,
}

/// Configuration for covisibility gating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SparseConfig {
    /// Run gated attention; `false` runs the dense path on a gated model
    pub enabled: bool,
    /// Cosine similarity above which two views are covisible
    pub threshold: f32,
    /// Number of most similar neighbours forced per view
    pub k_nearest: usize,
    pub repair: ConnectivityRepair,
}

impl Default for SparseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.7,
            k_nearest: 10,
            repair: ConnectivityRepair::Chain,
        }
    }
}

impl SparseConfig {
    pub fn new(threshold: f32, k_nearest: usize) -> Self {
        Self {
            threshold,
            k_nearest,
            ..Self::default()
        }
    }

    pub fn with_repair(mut self, repair: ConnectivityRepair) -> Self {
        self.repair = repair;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || !(-1.0..=1.0).contains(&self.threshold) {
            return Err(CovisError::InvalidConfig(format!(
                "threshold must lie in [-1, 1], got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Configuration for the descriptor extractor and its aggregation head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    /// Width of backbone tokens (ViT-B/14 produces 768)
    pub backbone_dim: usize,
    /// Backbone patch stride; image sides are resized to a multiple of it
    pub patch_size: usize,
    pub num_clusters: usize,
    pub cluster_dim: usize,
    pub token_dim: usize,
    pub mlp_dim: usize,
    /// Seed for aggregation weights and simulated backbone features
    pub seed: u64,
    pub mode: ExtractionMode,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            backbone_dim: 768,
            patch_size: 14,
            num_clusters: 64,
            cluster_dim: 256,
            token_dim: 256,
            mlp_dim: 512,
            seed: 0,
            mode: ExtractionMode::Strict,
        }
    }
}

impl DescriptorConfig {
    /// Length of the final descriptor: cluster block followed by the global token block.
    pub fn output_dim(&self) -> usize {
        self.num_clusters * self.cluster_dim + self.token_dim
    }

    pub fn with_mode(mut self, mode: ExtractionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("backbone_dim", self.backbone_dim),
            ("patch_size", self.patch_size),
            ("num_clusters", self.num_clusters),
            ("cluster_dim", self.cluster_dim),
            ("token_dim", self.token_dim),
            ("mlp_dim", self.mlp_dim),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(CovisError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Top-level settings file: `{ sparse: {...}, descriptor: {...} }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sparse: SparseConfig,
    pub descriptor: DescriptorConfig,
}

impl Settings {
    /// Load settings from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = Self::read(path).map_err(CovisError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    fn read(path: &Path) -> AnyResult<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let settings = match ext.as_str() {
            "json" => serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?,
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid YAML in {}", path.display()))?,
            other => anyhow::bail!("Unsupported settings format '{}': {}", other, path.display()),
        };
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.sparse.validate()?;
        self.descriptor.validate()
    }
}
