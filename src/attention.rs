//! Scaled dot-product attention with an injectable score-masking step.
//!
//! Attention modules never hold a mask. The caller hands a [`ScoreMasker`]
//! to every forward call; [`DenseScores`] leaves the scores untouched and
//! [`CovisibilityMasker`] removes pairs of tokens whose views are not
//! covisible. Swapping the masker is the only difference between dense and
//! gated inference, so the dense path stays bit-for-bit unchanged.

use ndarray::{s, stack, Array2, Array3, ArrayView2, ArrayView3, ArrayViewMut3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::aggregator::uniform_matrix;
use crate::covisibility::CovisibilityMask;
use crate::error::{CovisError, Result};

/// Score written into masked positions before softmax. Large enough that
/// its softmax weight underflows to exactly zero, finite so rows never go NaN.
pub const MASKED_SCORE: f32 = -1e9;

/// Step applied to raw attention scores `(heads, queries, keys)` before softmax.
pub trait ScoreMasker: Send + Sync {
    fn mask_scores(&self, scores: ArrayViewMut3<f32>) -> Result<()>;

    /// Whether this masker leaves every score untouched.
    fn is_dense(&self) -> bool {
        false
    }
}

/// No-op masker: plain dense attention.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseScores;

impl ScoreMasker for DenseScores {
    fn mask_scores(&self, _scores: ArrayViewMut3<f32>) -> Result<()> {
        Ok(())
    }

    fn is_dense(&self) -> bool {
        true
    }
}

/// Gates scores by a view-level covisibility mask, broadcast across heads.
///
/// Query and key tokens are grouped into equal contiguous blocks, one block
/// per view: with `N` views and `T` tokens, view `v` owns tokens
/// `v * T/N .. (v + 1) * T/N`. One token per view gives the plain `N x N` mask.
#[derive(Debug, Clone, Copy)]
pub struct CovisibilityMasker<'a> {
    mask: &'a CovisibilityMask,
}

impl<'a> CovisibilityMasker<'a> {
    pub fn new(mask: &'a CovisibilityMask) -> Self {
        Self { mask }
    }

    pub fn mask(&self) -> &CovisibilityMask {
        self.mask
    }

    fn tokens_per_view(&self, tokens: usize, axis: &str) -> Result<usize> {
        let n = self.mask.num_views();
        if tokens == 0 || tokens % n != 0 {
            return Err(CovisError::ShapeMismatch(format!(
                "{tokens} {axis} tokens cannot be split across {n} views"
            )));
        }
        Ok(tokens / n)
    }
}

impl ScoreMasker for CovisibilityMasker<'_> {
    fn mask_scores(&self, mut scores: ArrayViewMut3<f32>) -> Result<()> {
        let (_, queries, keys) = scores.dim();
        let per_query = self.tokens_per_view(queries, "query")?;
        let per_key = self.tokens_per_view(keys, "key")?;
        let n = self.mask.num_views();

        for qv in 0..n {
            for kv in 0..n {
                if self.mask.get(qv, kv) {
                    continue;
                }
                scores
                    .slice_mut(s![
                        ..,
                        qv * per_query..(qv + 1) * per_query,
                        kv * per_key..(kv + 1) * per_key
                    ])
                    .fill(MASKED_SCORE);
            }
        }
        Ok(())
    }
}

/// `softmax(mask(Q K^T / sqrt(d))) V` per head.
///
/// `query` is `(heads, T, d)`, `key` is `(heads, S, d)`, `value` is
/// `(heads, S, dv)`; the result is `(heads, T, dv)`.
pub fn scaled_dot_product_attention(
    query: ArrayView3<f32>,
    key: ArrayView3<f32>,
    value: ArrayView3<f32>,
    masker: &dyn ScoreMasker,
) -> Result<Array3<f32>> {
    let (heads, queries, dim) = query.dim();
    let (k_heads, keys, k_dim) = key.dim();
    let (v_heads, values, v_dim) = value.dim();
    if k_heads != heads || v_heads != heads || k_dim != dim || values != keys {
        return Err(CovisError::ShapeMismatch(format!(
            "q {:?}, k {:?}, v {:?} are incompatible",
            query.dim(),
            key.dim(),
            value.dim()
        )));
    }
    if keys == 0 {
        return Err(CovisError::ShapeMismatch("attention over zero keys".into()));
    }

    let scale = (dim as f32).sqrt();
    let mut scores = Array3::<f32>::zeros((heads, queries, keys));
    for h in 0..heads {
        let qh = query.index_axis(Axis(0), h);
        let kh = key.index_axis(Axis(0), h);
        scores
            .index_axis_mut(Axis(0), h)
            .assign(&(qh.dot(&kh.t()) / scale));
    }

    if !masker.is_dense() {
        masker.mask_scores(scores.view_mut())?;
    }
    softmax_last_axis(&mut scores);

    let mut output = Array3::<f32>::zeros((heads, queries, v_dim));
    for h in 0..heads {
        let weights = scores.index_axis(Axis(0), h);
        let vh = value.index_axis(Axis(0), h);
        output.index_axis_mut(Axis(0), h).assign(&weights.dot(&vh));
    }
    Ok(output)
}

fn softmax_last_axis(scores: &mut Array3<f32>) {
    for mut row in scores.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
}

/// Frozen multi-head self-attention over a `(tokens, embed_dim)` sequence.
///
/// Weight matrices are `(embed_dim, embed_dim)` and applied as `x * W`.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    wq: Array2<f32>,
    wk: Array2<f32>,
    wv: Array2<f32>,
    wo: Array2<f32>,
    num_heads: usize,
}

impl MultiHeadAttention {
    pub fn from_weights(
        wq: Array2<f32>,
        wk: Array2<f32>,
        wv: Array2<f32>,
        wo: Array2<f32>,
        num_heads: usize,
    ) -> Result<Self> {
        let embed = wq.nrows();
        for (name, w) in [("wq", &wq), ("wk", &wk), ("wv", &wv), ("wo", &wo)] {
            if w.dim() != (embed, embed) {
                return Err(CovisError::ShapeMismatch(format!(
                    "{name} is {:?}, expected ({embed}, {embed})",
                    w.dim()
                )));
            }
        }
        if embed == 0 || num_heads == 0 || embed % num_heads != 0 {
            return Err(CovisError::InvalidConfig(format!(
                "embed dim {embed} is not divisible into {num_heads} heads"
            )));
        }
        Ok(Self {
            wq,
            wk,
            wv,
            wo,
            num_heads,
        })
    }

    /// Random frozen weights, reproducible from `seed`.
    pub fn seeded(embed_dim: usize, num_heads: usize, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (embed_dim.max(1) as f32).sqrt();
        let wq = uniform_matrix(embed_dim, embed_dim, bound, &mut rng);
        let wk = uniform_matrix(embed_dim, embed_dim, bound, &mut rng);
        let wv = uniform_matrix(embed_dim, embed_dim, bound, &mut rng);
        let wo = uniform_matrix(embed_dim, embed_dim, bound, &mut rng);
        Self::from_weights(wq, wk, wv, wo, num_heads)
    }

    pub fn embed_dim(&self) -> usize {
        self.wq.nrows()
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn forward(&self, x: ArrayView2<f32>, masker: &dyn ScoreMasker) -> Result<Array2<f32>> {
        let (tokens, embed) = x.dim();
        if embed != self.embed_dim() {
            return Err(CovisError::ShapeMismatch(format!(
                "tokens have width {embed}, attention expects {}",
                self.embed_dim()
            )));
        }

        let q = self.split_heads(&x.dot(&self.wq))?;
        let k = self.split_heads(&x.dot(&self.wk))?;
        let v = self.split_heads(&x.dot(&self.wv))?;
        let attended = scaled_dot_product_attention(q.view(), k.view(), v.view(), masker)?;

        let head_dim = embed / self.num_heads;
        let mut merged = Array2::<f32>::zeros((tokens, embed));
        for h in 0..self.num_heads {
            merged
                .slice_mut(s![.., h * head_dim..(h + 1) * head_dim])
                .assign(&attended.index_axis(Axis(0), h));
        }
        Ok(merged.dot(&self.wo))
    }

    /// `(tokens, embed)` to `(heads, tokens, head_dim)`.
    fn split_heads(&self, x: &Array2<f32>) -> Result<Array3<f32>> {
        let head_dim = self.embed_dim() / self.num_heads;
        let heads: Vec<_> = (0..self.num_heads)
            .map(|h| x.slice(s![.., h * head_dim..(h + 1) * head_dim]))
            .collect();
        stack(Axis(0), &heads).map_err(|e| CovisError::ShapeMismatch(e.to_string()))
    }
}
