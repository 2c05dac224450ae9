pub mod error;
pub mod config;
pub mod preprocess;
pub mod backbone;
pub mod aggregator;
pub mod extractor;
pub mod backend;
pub mod covisibility;
pub mod attention;
pub mod gate;

// Re-export commonly used types
pub use error::{CovisError, Result};
pub use config::{ConnectivityRepair, DescriptorConfig, ExtractionMode, Settings, SparseConfig};
pub use backbone::{Backbone, BackboneFeatures, PatchStatsBackbone, SimulatedBackbone};
pub use extractor::{DescriptorExtractor, EmbeddingBatch};
pub use backend::{ComputeBackend, CpuBackend};
pub use covisibility::{
    build_batch_masks, build_covisibility_mask, AttentionFootprint, CovisibilityBuilder,
    CovisibilityMask,
};
pub use attention::{
    scaled_dot_product_attention, CovisibilityMasker, DenseScores, MultiHeadAttention, ScoreMasker,
};
pub use gate::{attach_sparse_attention, FrozenTransformer, SparseAttentionModel, SparseOutput};
