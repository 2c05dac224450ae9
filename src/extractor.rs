use log::{debug, warn};
use ndarray::{stack, Array1, Array2, Array3, ArrayView2, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;
use std::sync::Arc;

use crate::aggregator::SaladAggregator;
use crate::backbone::{Backbone, SimulatedBackbone};
use crate::config::{DescriptorConfig, ExtractionMode};
use crate::error::{CovisError, Result};
use crate::preprocess::resize_to_patch_multiple;

/// One unit-norm descriptor per view, in submission order.
#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    embeddings: Array2<f32>,
    degraded: bool,
    warnings: Vec<String>,
}

impl EmbeddingBatch {
    /// `(num_views, dim)` matrix of descriptors.
    pub fn embeddings(&self) -> ArrayView2<'_, f32> {
        self.embeddings.view()
    }

    pub fn num_views(&self) -> usize {
        self.embeddings.nrows()
    }

    pub fn dim(&self) -> usize {
        self.embeddings.ncols()
    }

    /// True when at least one descriptor came from simulated backbone features.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_inner(self) -> Array2<f32> {
        self.embeddings
    }
}

struct ViewDescriptor {
    vector: Array1<f32>,
    warning: Option<String>,
}

/// Maps images to L2-normalised global descriptors.
///
/// Holds a frozen backbone and the aggregation heads; both are read-only after
/// construction so one extractor can serve any number of calls.
pub struct DescriptorExtractor {
    config: DescriptorConfig,
    aggregator: SaladAggregator,
    backbone: Arc<dyn Backbone>,
    fallback: SimulatedBackbone,
}

impl DescriptorExtractor {
    /// Build an extractor around `backbone`.
    ///
    /// A missing backbone is an error in [`ExtractionMode::Strict`]; in
    /// [`ExtractionMode::Permissive`] it is replaced by [`SimulatedBackbone`]
    /// and a warning is logged.
    pub fn new(config: DescriptorConfig, backbone: Option<Arc<dyn Backbone>>) -> Result<Self> {
        config.validate()?;
        let fallback = SimulatedBackbone::new(config.backbone_dim, config.patch_size, config.seed);

        let backbone: Arc<dyn Backbone> = match (backbone, config.mode) {
            (Some(backbone), _) => {
                if backbone.embed_dim() != config.backbone_dim {
                    return Err(CovisError::InvalidConfig(format!(
                        "backbone emits {} dims, config expects {}",
                        backbone.embed_dim(),
                        config.backbone_dim
                    )));
                }
                if backbone.patch_size() != config.patch_size {
                    return Err(CovisError::InvalidConfig(format!(
                        "backbone patch size {} differs from configured {}",
                        backbone.patch_size(),
                        config.patch_size
                    )));
                }
                backbone
            }
            (None, ExtractionMode::Strict) => {
                return Err(CovisError::BackboneUnavailable(
                    "no backbone supplied in strict mode".into(),
                ));
            }
            (None, ExtractionMode::Permissive) => {
                warn!("Descriptor backbone unavailable, using simulated features");
                Arc::new(fallback.clone())
            }
        };

        let aggregator = SaladAggregator::new(&config)?;
        Ok(Self {
            config,
            aggregator,
            backbone,
            fallback,
        })
    }

    /// Extractor running only on simulated features. Forces permissive mode.
    pub fn simulated(config: DescriptorConfig) -> Result<Self> {
        Self::new(config.with_mode(ExtractionMode::Permissive), None)
    }

    /// Replace the seeded aggregation heads with pretrained ones.
    pub fn with_aggregator(mut self, aggregator: SaladAggregator) -> Result<Self> {
        if aggregator.input_dim() != self.config.backbone_dim {
            return Err(CovisError::InvalidConfig(format!(
                "aggregator takes {} dims, backbone emits {}",
                aggregator.input_dim(),
                self.config.backbone_dim
            )));
        }
        self.aggregator = aggregator;
        Ok(self)
    }

    pub fn config(&self) -> &DescriptorConfig {
        &self.config
    }

    /// Length of every descriptor this extractor produces.
    pub fn output_dim(&self) -> usize {
        self.aggregator.output_dim()
    }

    /// Descriptor for a single `(3, H, W)` image.
    pub fn extract(&self, image: ArrayView3<f32>) -> Result<Array1<f32>> {
        self.describe(image).map(|d| d.vector)
    }

    /// Descriptors for a list of images, one row per image.
    pub fn extract_batch(&self, images: &[Array3<f32>]) -> Result<EmbeddingBatch> {
        self.extract_views(images.iter().map(|img| img.view()).collect())
    }

    /// Descriptors for a stacked `(N, 3, H, W)` tensor.
    pub fn extract_tensor(&self, images: ArrayView4<f32>) -> Result<EmbeddingBatch> {
        self.extract_views(images.axis_iter(Axis(0)).collect())
    }

    fn extract_views(&self, views: Vec<ArrayView3<f32>>) -> Result<EmbeddingBatch> {
        if views.is_empty() {
            return Err(CovisError::EmptyBatch);
        }

        let descriptors = views
            .into_par_iter()
            .map(|view| self.describe(view))
            .collect::<Result<Vec<_>>>()?;

        let warnings: Vec<String> = descriptors
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.warning.as_ref().map(|w| format!("view {i}: {w}")))
            .collect();
        let rows: Vec<_> = descriptors.iter().map(|d| d.vector.view()).collect();
        let embeddings =
            stack(Axis(0), &rows).map_err(|e| CovisError::ShapeMismatch(e.to_string()))?;

        debug!(
            "Extracted {} descriptors of dim {} ({} degraded)",
            embeddings.nrows(),
            embeddings.ncols(),
            warnings.len()
        );

        Ok(EmbeddingBatch {
            embeddings,
            degraded: !warnings.is_empty(),
            warnings,
        })
    }

    fn describe(&self, image: ArrayView3<f32>) -> Result<ViewDescriptor> {
        let resized = resize_to_patch_multiple(image, self.config.patch_size)?;

        let (features, warning) = match self.backbone.forward_features(resized.view()) {
            Ok(features) => (features, None),
            Err(CovisError::BackboneUnavailable(reason))
                if self.config.mode == ExtractionMode::Permissive =>
            {
                warn!("Backbone failed ({reason}), falling back to simulated features");
                let features = self.fallback.forward_features(resized.view())?;
                (features, Some(reason))
            }
            Err(e) => return Err(e),
        };

        let raw = self.aggregator.aggregate(&features)?;
        Ok(ViewDescriptor {
            vector: l2_normalize(raw),
            warning,
        })
    }
}

/// Scale `v` to unit length. A zero vector maps to the uniform unit vector so
/// the unit-norm guarantee holds for every output.
pub fn l2_normalize(v: Array1<f32>) -> Array1<f32> {
    let norm = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if norm > 1e-12 && norm.is_finite() {
        v.mapv(|x| (x as f64 / norm) as f32)
    } else {
        let len = v.len().max(1);
        Array1::from_elem(v.len(), (1.0 / (len as f64).sqrt()) as f32)
    }
}
