//! Compute device seam for the pairwise similarity product.
//!
//! The CPU path uses ndarray. With the `wgpu` feature the same product runs as
//! a CubeCL kernel on any CubeCL runtime.

use ndarray::{Array2, ArrayView2};

use crate::error::Result;

/// Device able to compute the Gram matrix of a set of embeddings.
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &str;

    /// `S = E * E^T` for a `(N, D)` embedding matrix. Rows are assumed to be
    /// unit-norm, so the result holds cosine similarities.
    fn pairwise_similarity(&self, embeddings: ArrayView2<f32>) -> Result<Array2<f32>>;
}

/// ndarray matrix product on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn pairwise_similarity(&self, embeddings: ArrayView2<f32>) -> Result<Array2<f32>> {
        Ok(embeddings.dot(&embeddings.t()))
    }
}

#[cfg(feature = "wgpu")]
pub use gpu::CubeBackend;

#[cfg(feature = "wgpu")]
mod gpu {
    use cubecl::prelude::*;
    use cubecl::Runtime;
    use cubecl_runtime::client::ComputeClient;
    use ndarray::{Array2, ArrayView2};

    use super::ComputeBackend;
    use crate::error::{CovisError, Result};

    /// Side of the square tile of matrix entries handled by one cube.
    const TILE: u32 = 16;

    #[cube(launch)]
    fn pairwise_similarity_kernel<F: Float>(
        embeddings: &Array<F>,
        similarity: &mut Array<F>,
        num_views: u32,
        dim: u32,
    ) {
        let i = ABSOLUTE_POS_Y;
        let j = ABSOLUTE_POS_X;
        if i < num_views && j < num_views {
            let mut dot = F::from_int(0);
            for d in 0..dim {
                dot += embeddings[i * dim + d] * embeddings[j * dim + d];
            }
            similarity[i * num_views + j] = dot;
        }
    }

    /// Similarity product on a CubeCL device, one invocation per matrix entry,
    /// dispatched as a 2-D grid of `TILE x TILE` cubes.
    pub struct CubeBackend<R: Runtime> {
        client: ComputeClient<R::Server, R::Channel>,
    }

    impl<R: Runtime> CubeBackend<R> {
        pub fn new(client: ComputeClient<R::Server, R::Channel>) -> Self {
            Self { client }
        }

        pub fn from_device(device: &R::Device) -> Self {
            Self::new(R::client(device))
        }
    }

    impl<R: Runtime> ComputeBackend for CubeBackend<R>
    where
        ComputeClient<R::Server, R::Channel>: Send + Sync,
    {
        fn name(&self) -> &str {
            "cubecl"
        }

        fn pairwise_similarity(&self, embeddings: ArrayView2<f32>) -> Result<Array2<f32>> {
            let (n, d) = embeddings.dim();
            let cells = n * n;
            if cells > u32::MAX as usize || n * d > u32::MAX as usize {
                return Err(CovisError::Backend(format!(
                    "{n}x{d} embeddings exceed kernel index range"
                )));
            }
            // n * n fits in u32, so tiles per side stay far below the 65535 dispatch limit
            let tiles = (n as u32).div_ceil(TILE);

            let flat: Vec<f32> = embeddings.iter().copied().collect();
            let input = self.client.create(bytemuck::cast_slice(&flat));
            let output = self.client.empty(cells * std::mem::size_of::<f32>());

            unsafe {
                pairwise_similarity_kernel::launch::<f32, R>(
                    &self.client,
                    CubeCount::Static(tiles, tiles, 1),
                    CubeDim::new(TILE, TILE, 1),
                    ArrayArg::from_raw_parts::<f32>(&input, n * d, 1),
                    ArrayArg::from_raw_parts::<f32>(&output, cells, 1),
                    ScalarArg::new(n as u32),
                    ScalarArg::new(d as u32),
                );
            }

            let values: Vec<f32> =
                bytemuck::cast_slice(&self.client.read_one(output.binding())).to_vec();
            Array2::from_shape_vec((n, n), values).map_err(|e| CovisError::Backend(e.to_string()))
        }
    }
}
