use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backbone::BackboneFeatures;
use crate::config::DescriptorConfig;
use crate::error::{CovisError, Result};

/// Fills a matrix with `U(-bound, bound)` entries.
pub(crate) fn uniform_matrix(rows: usize, cols: usize, bound: f32, rng: &mut StdRng) -> Array2<f32> {
    Array2::from_shape_simple_fn((rows, cols), || rng.gen_range(-bound..bound))
}

/// Two-layer perceptron: `Linear -> ReLU -> Linear`.
#[derive(Debug, Clone)]
pub struct Mlp {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
}

impl Mlp {
    /// Build from explicit weights. `w1` is `(in, hidden)`, `w2` is `(hidden, out)`.
    pub fn from_weights(
        w1: Array2<f32>,
        b1: Array1<f32>,
        w2: Array2<f32>,
        b2: Array1<f32>,
    ) -> Result<Self> {
        if w1.ncols() != b1.len() || w1.ncols() != w2.nrows() || w2.ncols() != b2.len() {
            return Err(CovisError::ShapeMismatch(format!(
                "mlp layers do not chain: w1 {:?}, b1 {}, w2 {:?}, b2 {}",
                w1.dim(),
                b1.len(),
                w2.dim(),
                b2.len()
            )));
        }
        Ok(Self { w1, b1, w2, b2 })
    }

    /// Uniform `±1/sqrt(fan_in)` initialisation, the usual linear-layer default.
    pub fn seeded(input: usize, hidden: usize, output: usize, rng: &mut StdRng) -> Result<Self> {
        if input == 0 || hidden == 0 || output == 0 {
            return Err(CovisError::InvalidConfig(format!(
                "mlp widths must be non-zero, got {input} -> {hidden} -> {output}"
            )));
        }
        let bound1 = 1.0 / (input as f32).sqrt();
        let bound2 = 1.0 / (hidden as f32).sqrt();
        Ok(Self {
            w1: uniform_matrix(input, hidden, bound1, rng),
            b1: uniform_matrix(1, hidden, bound1, rng).row(0).to_owned(),
            w2: uniform_matrix(hidden, output, bound2, rng),
            b2: uniform_matrix(1, output, bound2, rng).row(0).to_owned(),
        })
    }

    pub fn input_dim(&self) -> usize {
        self.w1.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.w2.ncols()
    }

    /// Apply to each row of `x`.
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let hidden = (x.dot(&self.w1) + &self.b1).mapv(|v| v.max(0.0));
        hidden.dot(&self.w2) + &self.b2
    }

    pub fn forward_one(&self, x: ArrayView1<f32>) -> Array1<f32> {
        let hidden = (x.dot(&self.w1) + &self.b1).mapv(|v| v.max(0.0));
        hidden.dot(&self.w2) + &self.b2
    }
}

/// Soft-assignment aggregation of patch tokens into a fixed-size descriptor.
///
/// Every patch token is projected into `num_clusters * cluster_dim` slots.
/// Each slot is pooled over patches with softmax weights computed across the
/// patch axis, so the descriptor size does not depend on image resolution.
/// The projected global token is appended after the cluster block.
#[derive(Debug, Clone)]
pub struct SaladAggregator {
    mlp_local: Mlp,
    mlp_global: Mlp,
    num_clusters: usize,
    cluster_dim: usize,
}

impl SaladAggregator {
    pub fn new(config: &DescriptorConfig) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mlp_local = Mlp::seeded(
            config.backbone_dim,
            config.mlp_dim,
            config.num_clusters * config.cluster_dim,
            &mut rng,
        )?;
        let mlp_global = Mlp::seeded(config.backbone_dim, config.mlp_dim, config.token_dim, &mut rng)?;
        Ok(Self {
            mlp_local,
            mlp_global,
            num_clusters: config.num_clusters,
            cluster_dim: config.cluster_dim,
        })
    }

    /// Use pretrained projection heads. `mlp_local` must emit
    /// `num_clusters * cluster_dim` values and both heads must share an input width.
    pub fn from_mlps(mlp_local: Mlp, mlp_global: Mlp, num_clusters: usize, cluster_dim: usize) -> Result<Self> {
        if mlp_local.output_dim() != num_clusters * cluster_dim {
            return Err(CovisError::ShapeMismatch(format!(
                "local head emits {} values, expected {} clusters x {}",
                mlp_local.output_dim(),
                num_clusters,
                cluster_dim
            )));
        }
        if mlp_local.input_dim() != mlp_global.input_dim() {
            return Err(CovisError::ShapeMismatch(format!(
                "local head takes {} inputs, global head takes {}",
                mlp_local.input_dim(),
                mlp_global.input_dim()
            )));
        }
        Ok(Self {
            mlp_local,
            mlp_global,
            num_clusters,
            cluster_dim,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.mlp_local.input_dim()
    }

    pub fn output_dim(&self) -> usize {
        self.num_clusters * self.cluster_dim + self.mlp_global.output_dim()
    }

    /// Aggregate one image's tokens. The result is not normalised.
    pub fn aggregate(&self, features: &BackboneFeatures) -> Result<Array1<f32>> {
        let expected = self.input_dim();
        let patches = &features.patch_tokens;
        if patches.nrows() == 0 {
            return Err(CovisError::ShapeMismatch("backbone returned no patch tokens".into()));
        }
        if patches.ncols() != expected || features.cls_token.len() != expected {
            return Err(CovisError::ShapeMismatch(format!(
                "backbone tokens have width {}/{}, aggregator expects {}",
                patches.ncols(),
                features.cls_token.len(),
                expected
            )));
        }

        let local = self.mlp_local.forward(patches.view());
        let pooled = softmax_pool(local.view());
        let global = self.mlp_global.forward_one(features.cls_token.view());

        concatenate(Axis(0), &[pooled.view(), global.view()])
            .map_err(|e| CovisError::ShapeMismatch(e.to_string()))
    }
}

/// For every column: `sum_n softmax_n(x[:, j])[n] * x[n, j]`.
fn softmax_pool(x: ArrayView2<f32>) -> Array1<f32> {
    let mut out = Array1::<f32>::zeros(x.ncols());
    for (j, column) in x.axis_iter(Axis(1)).enumerate() {
        let max = column.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mut denom = 0.0f32;
        let mut numer = 0.0f32;
        for &v in column.iter() {
            let e = (v - max).exp();
            denom += e;
            numer += e * v;
        }
        out[j] = numer / denom;
    }
    out
}
