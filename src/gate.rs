//! Attaching covisibility gating to a frozen transformer.
//!
//! The transformer exposes its attention through [`FrozenTransformer::forward`],
//! which receives a [`ScoreMasker`] on every call. [`SparseAttentionModel`]
//! wraps the model, builds a fresh mask for each batch of images and passes it
//! down; detaching simply stops passing it. The model's weights are never
//! touched.
//!
//! Per call the gate moves `Unset -> MaskComputed -> Applied -> Unset`:
//! [`SparseAttentionModel::prepare`] yields a [`PreparedPass`] bound to the
//! images it was computed from, [`SparseAttentionModel::forward_prepared`]
//! consumes it, and nothing survives the call.

use log::{debug, info, warn};
use ndarray::Array3;
use std::sync::Arc;

use crate::attention::{CovisibilityMasker, DenseScores, ScoreMasker};
use crate::covisibility::{CovisibilityBuilder, CovisibilityMask};
use crate::config::SparseConfig;
use crate::error::{CovisError, Result};
use crate::extractor::{DescriptorExtractor, EmbeddingBatch};

/// A pretrained multi-view transformer whose attention accepts a masker.
///
/// Implementations forward `masker` to every cross-view attention layer and
/// use [`DenseScores`] for attention that stays within one view.
pub trait FrozenTransformer {
    type Output;

    fn forward(&self, images: &[Array3<f32>], masker: &dyn ScoreMasker) -> Result<Self::Output>;
}

// One frozen model can back several wrappers at once, e.g. a dense baseline
// and a gated copy.
impl<T: FrozenTransformer + ?Sized> FrozenTransformer for &T {
    type Output = T::Output;

    fn forward(&self, images: &[Array3<f32>], masker: &dyn ScoreMasker) -> Result<Self::Output> {
        (**self).forward(images, masker)
    }
}

impl<T: FrozenTransformer + ?Sized> FrozenTransformer for Arc<T> {
    type Output = T::Output;

    fn forward(&self, images: &[Array3<f32>], masker: &dyn ScoreMasker) -> Result<Self::Output> {
        (**self).forward(images, masker)
    }
}

/// Descriptor extractor plus mask settings; everything needed to gate a model.
pub struct AttentionGate {
    extractor: DescriptorExtractor,
    builder: CovisibilityBuilder,
    config: SparseConfig,
}

impl AttentionGate {
    pub fn new(extractor: DescriptorExtractor, config: SparseConfig) -> Result<Self> {
        let builder = CovisibilityBuilder::from_config(&config)?;
        Ok(Self {
            extractor,
            builder,
            config,
        })
    }

    pub fn config(&self) -> &SparseConfig {
        &self.config
    }

    pub fn extractor(&self) -> &DescriptorExtractor {
        &self.extractor
    }

    /// Embed `images` and build their covisibility mask.
    pub fn compute_mask(&self, images: &[Array3<f32>]) -> Result<(EmbeddingBatch, CovisibilityMask)> {
        let batch = self.extractor.extract_batch(images)?;
        if batch.is_degraded() {
            warn!(
                "Covisibility mask built from degraded descriptors: {}",
                batch.warnings().join("; ")
            );
        }
        let mask = self.builder.build(batch.embeddings())?;
        Ok((batch, mask))
    }
}

/// Mask computed for one specific set of images, ready to be applied once.
pub struct PreparedPass<'a> {
    images: &'a [Array3<f32>],
    mask: Option<CovisibilityMask>,
    embeddings: Option<EmbeddingBatch>,
}

impl PreparedPass<'_> {
    pub fn num_views(&self) -> usize {
        self.images.len()
    }

    /// `None` when the pass will run dense.
    pub fn mask(&self) -> Option<&CovisibilityMask> {
        self.mask.as_ref()
    }

    pub fn embeddings(&self) -> Option<&EmbeddingBatch> {
        self.embeddings.as_ref()
    }
}

/// Result of one forward call.
#[derive(Debug)]
pub struct SparseOutput<O> {
    pub output: O,
    /// The mask that gated this call; `None` for a dense call.
    pub mask: Option<CovisibilityMask>,
    /// Descriptors were built from simulated backbone features.
    pub degraded: bool,
}

/// A frozen transformer that may be gated by covisibility.
pub struct SparseAttentionModel<M> {
    model: M,
    gate: Option<AttentionGate>,
    enabled: bool,
}

/// Wrap `model` so each forward call gates attention with a freshly built
/// covisibility mask.
pub fn attach_sparse_attention<M: FrozenTransformer>(
    model: M,
    extractor: DescriptorExtractor,
    config: SparseConfig,
) -> Result<SparseAttentionModel<M>> {
    let gate = AttentionGate::new(extractor, config)?;
    let mut sparse = SparseAttentionModel::dense(model);
    sparse.attach(gate);
    Ok(sparse)
}

impl<M: FrozenTransformer> SparseAttentionModel<M> {
    /// Wrap a model without gating.
    pub fn dense(model: M) -> Self {
        Self {
            model,
            gate: None,
            enabled: true,
        }
    }

    /// Install `gate`, replacing any previous one.
    pub fn attach(&mut self, gate: AttentionGate) -> Option<AttentionGate> {
        info!(
            "Sparse attention attached (threshold {}, k {})",
            gate.config.threshold, gate.config.k_nearest
        );
        self.enabled = gate.config.enabled;
        self.gate.replace(gate)
    }

    /// Remove the gate and return it. Calling this on an ungated model is a no-op.
    pub fn detach(&mut self) -> Option<AttentionGate> {
        let gate = self.gate.take();
        if gate.is_some() {
            info!("Sparse attention detached, model restored to dense attention");
        }
        gate
    }

    pub fn is_gated(&self) -> bool {
        self.gate.is_some()
    }

    /// Toggle gating without detaching. Disabled gated models run dense.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether the next forward call will be gated.
    pub fn is_sparse_active(&self) -> bool {
        self.enabled && self.gate.is_some()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Unwrap the underlying model, dropping any gate.
    pub fn into_inner(self) -> M {
        self.model
    }

    /// Compute the mask for `images` (or decide to run dense).
    pub fn prepare<'a>(&self, images: &'a [Array3<f32>]) -> Result<PreparedPass<'a>> {
        if images.is_empty() {
            return Err(CovisError::EmptyBatch);
        }

        let (embeddings, mask) = match &self.gate {
            Some(gate) if self.enabled => {
                let (batch, mask) = gate.compute_mask(images)?;
                (Some(batch), Some(mask))
            }
            _ => (None, None),
        };

        Ok(PreparedPass {
            images,
            mask,
            embeddings,
        })
    }

    /// Run the model on the images `pass` was prepared for, consuming it.
    pub fn forward_prepared(&self, pass: PreparedPass<'_>) -> Result<SparseOutput<M::Output>> {
        let degraded = pass
            .embeddings
            .as_ref()
            .is_some_and(EmbeddingBatch::is_degraded);

        let output = match &pass.mask {
            Some(mask) => {
                debug!(
                    "Gated forward over {} views, {} of {} pairs active",
                    mask.num_views(),
                    mask.edge_count(),
                    mask.num_views() * mask.num_views()
                );
                self.model.forward(pass.images, &CovisibilityMasker::new(mask))?
            }
            None => {
                debug!("Dense forward over {} views", pass.images.len());
                self.model.forward(pass.images, &DenseScores)?
            }
        };

        Ok(SparseOutput {
            output,
            mask: pass.mask,
            degraded,
        })
    }

    /// Embed, build the mask and run the model in one call.
    pub fn forward(&self, images: &[Array3<f32>]) -> Result<SparseOutput<M::Output>> {
        let pass = self.prepare(images)?;
        self.forward_prepared(pass)
    }
}
