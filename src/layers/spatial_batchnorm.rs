//! Spatial batch normalization: a shape adapter over the vanilla kernel.
//!
//! An (N, C, H, W) activation is folded so that the batch and spatial axes
//! become rows and the channel axis becomes the feature axis, the flat kernel
//! runs on the (N*H*W, C) view, and the result is unfolded back. No new math
//! lives here; backward delegates to the closed-form flat backward.

use crate::layers::batchnorm::{BatchNorm, BnForward, BnParam, RunningStats};
use crate::tensor::Tensor;

/// Fold (N, C, H, W) into (N*H*W, C): each spatial position of each sample
/// becomes one row of per-channel features.
fn fold_channels_last(x: &Tensor) -> Tensor {
    let (n, c, h, w) = x.dims4();
    let x_data = x.data();
    let mut out = Tensor::zeros(&[n * h * w, c], x.precision());
    for num in 0..n {
        for chan in 0..c {
            for i in 0..h {
                for j in 0..w {
                    let row = (num * h + i) * w + j;
                    out.data_mut()[row * c + chan] = x_data[((num * c + chan) * h + i) * w + j];
                }
            }
        }
    }
    out
}

/// Inverse of [`fold_channels_last`].
fn unfold_channels_last(flat: &Tensor, n: usize, c: usize, h: usize, w: usize) -> Tensor {
    assert_eq!(flat.dims2(), (n * h * w, c), "folded shape mismatch");
    let flat_data = flat.data();
    let mut out = Tensor::zeros(&[n, c, h, w], flat.precision());
    for num in 0..n {
        for chan in 0..c {
            for i in 0..h {
                for j in 0..w {
                    let row = (num * h + i) * w + j;
                    out.data_mut()[((num * c + chan) * h + i) * w + j] = flat_data[row * c + chan];
                }
            }
        }
    }
    out
}

/// Per-channel batch normalization over spatial activations.
pub struct SpatialBatchNorm;

impl SpatialBatchNorm {
    /// Forward pass for an (N, C, H, W) input with per-channel gamma/beta of
    /// shape (C,). The returned cache is the flat kernel's cache.
    pub fn forward(
        x: &Tensor,
        gamma: &Tensor,
        beta: &Tensor,
        param: &BnParam,
        stats: &RunningStats,
    ) -> BnForward {
        let (n, c, h, w) = x.dims4();
        let folded = fold_channels_last(x);
        let mut fwd = BatchNorm::forward(&folded, gamma, beta, param, stats);
        fwd.out = unfold_channels_last(&fwd.out, n, c, h, w);
        fwd
    }

    /// Train-mode forward pass; see [`BatchNorm::forward_train`].
    pub fn forward_train(
        x: &Tensor,
        gamma: &Tensor,
        beta: &Tensor,
        param: &BnParam,
        stats: &RunningStats,
    ) -> (Tensor, crate::layers::batchnorm::BnCache, RunningStats) {
        let (n, c, h, w) = x.dims4();
        let folded = fold_channels_last(x);
        let (out, cache, stats) = BatchNorm::forward_train(&folded, gamma, beta, param, stats);
        (unfold_channels_last(&out, n, c, h, w), cache, stats)
    }

    /// Backward pass: mirror reshape around the closed-form flat backward.
    pub fn backward(
        dout: &Tensor,
        cache: &crate::layers::batchnorm::BnCache,
    ) -> (Tensor, Tensor, Tensor) {
        let (n, c, h, w) = dout.dims4();
        let folded = fold_channels_last(dout);
        let (dx_flat, dgamma, dbeta) = BatchNorm::backward_alt(&folded, cache);
        let dx = unfold_channels_last(&dx_flat, n, c, h, w);
        (dx, dgamma, dbeta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Precision;

    #[test]
    fn test_fold_roundtrip() {
        let x = Tensor::from_vec(
            &[1, 2, 2, 2],
            (0..8).map(|v| v as f64).collect(),
            Precision::Double,
        );
        let folded = fold_channels_last(&x);
        assert_eq!(folded.shape(), &[4, 2]);
        // Row 0 is spatial position (0,0): channel 0 value 0, channel 1 value 4.
        assert_eq!(folded.data()[0], 0.0);
        assert_eq!(folded.data()[1], 4.0);
        let back = unfold_channels_last(&folded, 1, 2, 2, 2);
        assert_eq!(back, x);
    }
}
