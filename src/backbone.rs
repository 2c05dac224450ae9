//! The frozen feature network seam.
//!
//! A [`Backbone`] turns one `(3, H, W)` image into a global summary token and
//! a sequence of patch tokens. The real network (a self-supervised ViT) lives
//! outside this crate; two built-in implementations cover degraded mode and
//! testing.

use ndarray::{s, Array1, Array2, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::aggregator::uniform_matrix;
use crate::error::{CovisError, Result};

/// Output of a backbone forward pass for one image.
#[derive(Debug, Clone)]
pub struct BackboneFeatures {
    /// Global summary token, `(embed_dim,)`
    pub cls_token: Array1<f32>,
    /// One row per patch, `(num_patches, embed_dim)`
    pub patch_tokens: Array2<f32>,
}

/// Frozen feature extractor. Weights are read-only, so one instance may be
/// shared across threads and calls.
pub trait Backbone: Send + Sync {
    /// Width of every emitted token.
    fn embed_dim(&self) -> usize;

    /// Patch stride; input sides must be multiples of it.
    fn patch_size(&self) -> usize;

    fn forward_features(&self, image: ArrayView3<f32>) -> Result<BackboneFeatures>;
}

fn patch_grid(image: &ArrayView3<f32>, patch: usize) -> Result<(usize, usize)> {
    let (_, height, width) = image.dim();
    if patch == 0 {
        return Err(CovisError::InvalidConfig("patch size must be non-zero".into()));
    }
    if height % patch != 0 || width % patch != 0 || height == 0 || width == 0 {
        return Err(CovisError::InvalidImage(format!(
            "{height}x{width} is not a multiple of patch size {patch}"
        )));
    }
    Ok((height / patch, width / patch))
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// One FNV-1a step over a whole 64-bit word.
fn fnv_fold(hash: u64, word: u64) -> u64 {
    (hash ^ word).wrapping_mul(FNV_PRIME)
}

/// Stand-in used when the real backbone is unavailable.
///
/// Tokens are pseudo-random but deterministic: the generator is seeded from
/// the configured seed folded with the shape and pixel bits (FNV-1a), so
/// identical images always produce identical tokens on every platform and
/// toolchain.
#[derive(Debug, Clone)]
pub struct SimulatedBackbone {
    embed_dim: usize,
    patch_size: usize,
    seed: u64,
}

impl SimulatedBackbone {
    pub fn new(embed_dim: usize, patch_size: usize, seed: u64) -> Self {
        Self {
            embed_dim,
            patch_size,
            seed,
        }
    }

    fn content_seed(&self, image: &ArrayView3<f32>) -> u64 {
        let (channels, height, width) = image.dim();
        let mut hash = fnv_fold(FNV_OFFSET, self.seed);
        for extent in [channels, height, width] {
            hash = fnv_fold(hash, extent as u64);
        }
        image
            .iter()
            .fold(hash, |hash, value| fnv_fold(hash, u64::from(value.to_bits())))
    }
}

impl Backbone for SimulatedBackbone {
    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn patch_size(&self) -> usize {
        self.patch_size
    }

    fn forward_features(&self, image: ArrayView3<f32>) -> Result<BackboneFeatures> {
        let (rows, cols) = patch_grid(&image, self.patch_size)?;
        let mut rng = StdRng::seed_from_u64(self.content_seed(&image));
        let patch_tokens = uniform_matrix(rows * cols, self.embed_dim, 1.0, &mut rng);
        let cls_token = Array1::from_shape_simple_fn(self.embed_dim, || rng.gen_range(-1.0..1.0));
        Ok(BackboneFeatures {
            cls_token,
            patch_tokens,
        })
    }
}

/// Number of colour statistics gathered per patch.
const PATCH_STATS: usize = 7;

/// Parameter-free backbone built from per-patch colour statistics
/// (mean RGB, RGB standard deviation, gradient energy) passed through a fixed
/// random projection. Visually similar images yield similar tokens, which
/// makes it useful for exercising the graph builder on real pixels.
#[derive(Debug, Clone)]
pub struct PatchStatsBackbone {
    patch_size: usize,
    projection: Array2<f32>,
}

impl PatchStatsBackbone {
    pub fn new(embed_dim: usize, patch_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (PATCH_STATS as f32).sqrt();
        Self {
            patch_size,
            projection: uniform_matrix(PATCH_STATS, embed_dim, bound, &mut rng),
        }
    }

    fn stats(block: ArrayView3<f32>) -> [f32; PATCH_STATS] {
        let mut out = [0.0f32; PATCH_STATS];
        for c in 0..3 {
            let channel = block.index_axis(Axis(0), c);
            let mean = channel.mean().unwrap_or(0.0);
            let var = channel.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
            out[c] = mean;
            out[3 + c] = var.sqrt();
        }

        let luma = block.mean_axis(Axis(0));
        let mut energy = 0.0f32;
        let mut count = 0usize;
        if let Some(luma) = luma {
            let (h, w) = luma.dim();
            for y in 0..h {
                for x in 0..w {
                    if x + 1 < w {
                        energy += (luma[[y, x + 1]] - luma[[y, x]]).abs();
                        count += 1;
                    }
                    if y + 1 < h {
                        energy += (luma[[y + 1, x]] - luma[[y, x]]).abs();
                        count += 1;
                    }
                }
            }
        }
        out[6] = if count > 0 { energy / count as f32 } else { 0.0 };
        out
    }
}

impl Backbone for PatchStatsBackbone {
    fn embed_dim(&self) -> usize {
        self.projection.ncols()
    }

    fn patch_size(&self) -> usize {
        self.patch_size
    }

    fn forward_features(&self, image: ArrayView3<f32>) -> Result<BackboneFeatures> {
        let (rows, cols) = patch_grid(&image, self.patch_size)?;
        let p = self.patch_size;

        let mut stats = Array2::<f32>::zeros((rows * cols, PATCH_STATS));
        for r in 0..rows {
            for c in 0..cols {
                let block = image.slice(s![.., r * p..(r + 1) * p, c * p..(c + 1) * p]);
                let values = Self::stats(block);
                stats
                    .row_mut(r * cols + c)
                    .assign(&Array1::from(values.to_vec()));
            }
        }

        let patch_tokens = stats.dot(&self.projection).mapv(f32::tanh);
        let global = Array1::from(Self::stats(image).to_vec());
        let cls_token = global.dot(&self.projection).mapv(f32::tanh);
        Ok(BackboneFeatures {
            cls_token,
            patch_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn simulated_tokens_follow_patch_grid() {
        let backbone = SimulatedBackbone::new(16, 14, 7);
        let image = Array3::<f32>::zeros((3, 28, 42));
        let features = backbone.forward_features(image.view()).unwrap();
        assert_eq!(features.patch_tokens.dim(), (6, 16));
        assert_eq!(features.cls_token.len(), 16);
    }

    #[test]
    fn simulated_tokens_are_deterministic_per_image() {
        let backbone = SimulatedBackbone::new(8, 14, 7);
        let a = Array3::<f32>::from_elem((3, 14, 14), 0.1);
        let b = Array3::<f32>::from_elem((3, 14, 14), 0.9);
        let fa = backbone.forward_features(a.view()).unwrap();
        let fa2 = backbone.forward_features(a.view()).unwrap();
        let fb = backbone.forward_features(b.view()).unwrap();
        assert_eq!(fa.cls_token, fa2.cls_token);
        assert_ne!(fa.cls_token, fb.cls_token);
    }

    #[test]
    fn content_seed_is_pinned() {
        let backbone = SimulatedBackbone::new(8, 14, 7);
        let image = Array3::<f32>::from_elem((3, 14, 14), 0.5);
        assert_eq!(backbone.content_seed(&image.view()), 0x1ba8_84ea_c84d_2727);

        let other = SimulatedBackbone::new(8, 14, 8);
        assert_ne!(other.content_seed(&image.view()), 0x1ba8_84ea_c84d_2727);
    }

    #[test]
    fn patch_stats_rejects_non_multiple_sizes() {
        let backbone = PatchStatsBackbone::new(8, 14, 0);
        let image = Array3::<f32>::zeros((3, 20, 28));
        assert!(backbone.forward_features(image.view()).is_err());
    }
}
