//! Naive max-pooling kernel.
//!
//! Forward takes the maximum of each stride-determined window; no padding is
//! applied. Backward rebuilds each window's maximum from the retained input
//! and routes the upstream gradient to every position that attains it: ties
//! distribute the full gradient to all tied maxima rather than picking a
//! single winner. Overlapping windows accumulate.

use crate::layers::conv::output_extent;
use crate::tensor::Tensor;

/// Pooling hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolParam {
    pub pool_height: usize,
    pub pool_width: usize,
    pub stride: usize,
}

impl PoolParam {
    /// The 2x2 stride-2 configuration used by the network architectures.
    pub fn halving() -> Self {
        Self {
            pool_height: 2,
            pool_width: 2,
            stride: 2,
        }
    }
}

/// Retained input and configuration; enough to recompute the argmax windows
/// on backward without any forward recomputation of the outputs themselves.
pub struct PoolCache {
    x: Tensor,
    param: PoolParam,
}

/// Naive windowed max reduction.
pub struct MaxPool;

impl MaxPool {
    /// Forward pass over an (N, C, H, W) batch.
    ///
    /// Output spatial size follows the same floor formula as convolution with
    /// the pooling window as the kernel and zero padding.
    pub fn forward(x: &Tensor, param: &PoolParam) -> (Tensor, PoolCache) {
        let (n, c, h, w) = x.dims4();
        let hout = output_extent(h, param.pool_height, 0, param.stride);
        let wout = output_extent(w, param.pool_width, 0, param.stride);
        let x_data = x.data();

        let mut out = Tensor::zeros(&[n, c, hout, wout], x.precision());
        for num in 0..n {
            for chan in 0..c {
                for i in 0..hout {
                    for j in 0..wout {
                        let v0 = i * param.stride;
                        let h0 = j * param.stride;
                        let mut best = f64::NEG_INFINITY;
                        for di in 0..param.pool_height {
                            let row = ((num * c + chan) * h + v0 + di) * w + h0;
                            for dj in 0..param.pool_width {
                                best = best.max(x_data[row + dj]);
                            }
                        }
                        out.data_mut()[((num * c + chan) * hout + i) * wout + j] = best;
                    }
                }
            }
        }

        let cache = PoolCache {
            x: x.clone(),
            param: *param,
        };
        (out, cache)
    }

    /// Backward pass: scatter `dout` onto every input position equal to its
    /// window's maximum.
    pub fn backward(dout: &Tensor, cache: &PoolCache) -> Tensor {
        let (n, c, h, w) = cache.x.dims4();
        let param = cache.param;
        let (dn, dc, hout, wout) = dout.dims4();
        assert_eq!((dn, dc), (n, c), "upstream gradient batch/channel mismatch");

        let x_data = cache.x.data();
        let dout_data = dout.data();
        let mut dx = Tensor::zeros(&[n, c, h, w], cache.x.precision());

        for num in 0..n {
            for chan in 0..c {
                for i in 0..hout {
                    for j in 0..wout {
                        let v0 = i * param.stride;
                        let h0 = j * param.stride;
                        let mut best = f64::NEG_INFINITY;
                        for di in 0..param.pool_height {
                            let row = ((num * c + chan) * h + v0 + di) * w + h0;
                            for dj in 0..param.pool_width {
                                best = best.max(x_data[row + dj]);
                            }
                        }
                        let g = dout_data[((num * c + chan) * hout + i) * wout + j];
                        for di in 0..param.pool_height {
                            let row = ((num * c + chan) * h + v0 + di) * w + h0;
                            for dj in 0..param.pool_width {
                                if x_data[row + dj] == best {
                                    dx.data_mut()[row + dj] += g;
                                }
                            }
                        }
                    }
                }
            }
        }
        dx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Precision;

    #[test]
    fn test_forward_known_values() {
        let x = Tensor::from_vec(
            &[1, 1, 2, 4],
            vec![1.0, 5.0, 2.0, 0.0, 3.0, 4.0, 1.0, 6.0],
            Precision::Double,
        );
        let (out, _) = MaxPool::forward(
            &x,
            &PoolParam {
                pool_height: 2,
                pool_width: 2,
                stride: 2,
            },
        );
        assert_eq!(out.shape(), &[1, 1, 1, 2]);
        assert_eq!(out.data(), &[5.0, 6.0]);
    }

    #[test]
    fn test_backward_routes_to_maximum() {
        let x = Tensor::from_vec(&[1, 1, 2, 2], vec![1.0, 5.0, 2.0, 0.0], Precision::Double);
        let (_, cache) = MaxPool::forward(&x, &PoolParam::halving());
        let dout = Tensor::from_vec(&[1, 1, 1, 1], vec![3.0], Precision::Double);
        let dx = MaxPool::backward(&dout, &cache);
        assert_eq!(dx.data(), &[0.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_backward_ties_share_gradient() {
        // All four entries tie; each receives the full upstream gradient.
        let x = Tensor::full(&[1, 1, 2, 2], 2.5, Precision::Double);
        let (_, cache) = MaxPool::forward(&x, &PoolParam::halving());
        let dout = Tensor::from_vec(&[1, 1, 1, 1], vec![1.0], Precision::Double);
        let dx = MaxPool::backward(&dout, &cache);
        assert_eq!(dx.data(), &[1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_backward_overlapping_windows_accumulate() {
        // Stride 1 with a 2x2 window over a 2x3 input: the center column is
        // visited by both windows.
        let x = Tensor::from_vec(
            &[1, 1, 2, 3],
            vec![0.0, 9.0, 0.0, 0.0, 0.0, 0.0],
            Precision::Double,
        );
        let (_, cache) = MaxPool::forward(
            &x,
            &PoolParam {
                pool_height: 2,
                pool_width: 2,
                stride: 1,
            },
        );
        let dout = Tensor::from_vec(&[1, 1, 1, 2], vec![1.0, 2.0], Precision::Double);
        let dx = MaxPool::backward(&dout, &cache);
        assert_eq!(dx.data()[1], 3.0);
    }
}
