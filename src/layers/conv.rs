//! Naive 2-D convolution kernel with hand-derived gradients.
//!
//! The forward pass is a direct correlation (no kernel flip): each output
//! value is the inner product of a filter with the receptive-field window of
//! the zero-padded input, plus the filter's bias. The backward pass
//! scatter-adds through the same windows, so overlapping receptive fields
//! accumulate their contributions.
//!
//! This implementation favors clarity over speed; [`crate::layers::fast`]
//! holds the GEMM-backed variant the sandwich layers use.

use crate::tensor::Tensor;

/// Convolution hyperparameters.
///
/// * `stride` - pixels between adjacent receptive fields, must be positive
/// * `pad` - zeros added symmetrically to both sides of each spatial axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParam {
    pub stride: usize,
    pub pad: usize,
}

impl Default for ConvParam {
    fn default() -> Self {
        Self { stride: 1, pad: 0 }
    }
}

/// Spatial output extent for one axis: `1 + (input + 2*pad - kernel) / stride`,
/// clamped to zero when the window does not fit (degenerate output).
pub(crate) fn output_extent(input: usize, kernel: usize, pad: usize, stride: usize) -> usize {
    assert!(stride > 0, "stride must be positive");
    let span = input as isize + 2 * pad as isize - kernel as isize;
    if span < 0 {
        0
    } else {
        1 + (span as usize) / stride
    }
}

/// Values retained by [`Conv::forward`] for the matching backward call.
///
/// The *unpadded* input is kept; backward re-pads it so it never aliases the
/// padded working buffer of the forward pass.
pub struct ConvCache {
    x: Tensor,
    w: Tensor,
    param: ConvParam,
}

/// Naive convolution: an explicit loop over every sample, filter, and output
/// position.
pub struct Conv;

impl Conv {
    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - input batch of shape (N, C, H, W)
    /// * `w` - filters of shape (F, C, HH, WW)
    /// * `b` - per-filter biases of shape (F,)
    /// * `param` - stride and padding
    ///
    /// # Returns
    ///
    /// Output of shape (N, F, H', W') with `H' = 1 + (H + 2*pad - HH) / stride`
    /// (and W' analogous), plus the cache for the backward pass. A window that
    /// does not fit yields a zero-size output axis. The caller's `x` is never
    /// mutated; padding works on a copy.
    pub fn forward(x: &Tensor, w: &Tensor, b: &Tensor, param: &ConvParam) -> (Tensor, ConvCache) {
        let (n, c, h, width) = x.dims4();
        let (f, cw, hh, ww) = w.dims4();
        assert_eq!(c, cw, "filter channel count {} does not match input {}", cw, c);
        assert_eq!(b.shape(), &[f], "bias shape must be ({},)", f);

        let hout = output_extent(h, hh, param.pad, param.stride);
        let wout = output_extent(width, ww, param.pad, param.stride);

        let xp = x.pad2d(param.pad);
        let (_, _, hp, wp) = xp.dims4();
        let xp_data = xp.data();
        let w_data = w.data();

        let mut out = Tensor::zeros(&[n, f, hout, wout], x.precision());
        for num in 0..n {
            for filt in 0..f {
                for i in 0..hout {
                    for j in 0..wout {
                        let v0 = i * param.stride;
                        let h0 = j * param.stride;
                        let mut acc = b.data()[filt];
                        for chan in 0..c {
                            for di in 0..hh {
                                let xrow = ((num * c + chan) * hp + v0 + di) * wp + h0;
                                let wrow = ((filt * c + chan) * hh + di) * ww;
                                for dj in 0..ww {
                                    acc += xp_data[xrow + dj] * w_data[wrow + dj];
                                }
                            }
                        }
                        out.data_mut()[((num * f + filt) * hout + i) * wout + j] = acc;
                    }
                }
            }
        }

        let cache = ConvCache {
            x: x.clone(),
            w: w.clone(),
            param: *param,
        };
        (out, cache)
    }

    /// Backward pass.
    ///
    /// # Arguments
    ///
    /// * `dout` - upstream gradient of shape (N, F, H', W')
    /// * `cache` - the cache produced by the matching forward call
    ///
    /// # Returns
    ///
    /// `(dx, dw, db)` with the shapes of `x`, `w`, and `b`. The input gradient
    /// is scatter-added into a zero-initialized padded buffer and the border
    /// is stripped afterwards, so `dx` matches the original unpadded input.
    pub fn backward(dout: &Tensor, cache: &ConvCache) -> (Tensor, Tensor, Tensor) {
        let (n, c, h, width) = cache.x.dims4();
        let (f, _, hh, ww) = cache.w.dims4();
        let (dn, df, hout, wout) = dout.dims4();
        assert_eq!(dn, n, "upstream gradient batch size mismatch");
        assert_eq!(df, f, "upstream gradient filter count mismatch");

        let pad = cache.param.pad;
        let stride = cache.param.stride;
        let xp = cache.x.pad2d(pad);
        let (_, _, hp, wp) = xp.dims4();
        let xp_data = xp.data();
        let w_data = cache.w.data();
        let dout_data = dout.data();

        let mut dpad = vec![0.0f64; xp.len()];
        let mut dw = Tensor::zeros(cache.w.shape(), cache.w.precision());
        let mut db = Tensor::zeros(&[f], cache.w.precision());

        for num in 0..n {
            for filt in 0..f {
                for i in 0..hout {
                    for j in 0..wout {
                        let g = dout_data[((num * f + filt) * hout + i) * wout + j];
                        db.data_mut()[filt] += g;
                        let v0 = i * stride;
                        let h0 = j * stride;
                        for chan in 0..c {
                            for di in 0..hh {
                                let xrow = ((num * c + chan) * hp + v0 + di) * wp + h0;
                                let wrow = ((filt * c + chan) * hh + di) * ww;
                                for dj in 0..ww {
                                    dw.data_mut()[wrow + dj] += xp_data[xrow + dj] * g;
                                    dpad[xrow + dj] += w_data[wrow + dj] * g;
                                }
                            }
                        }
                    }
                }
            }
        }

        // Strip the padded border to recover the gradient of the original x.
        let mut dx = Tensor::zeros(&[n, c, h, width], cache.x.precision());
        for num in 0..n {
            for chan in 0..c {
                for i in 0..h {
                    let src = ((num * c + chan) * hp + i + pad) * wp + pad;
                    let dst = ((num * c + chan) * h + i) * width;
                    dx.data_mut()[dst..dst + width].copy_from_slice(&dpad[src..src + width]);
                }
            }
        }
        (dx, dw, db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Precision;

    #[test]
    fn test_output_extent_formula() {
        assert_eq!(output_extent(32, 7, 3, 1), 32);
        assert_eq!(output_extent(4, 4, 0, 4), 1);
        assert_eq!(output_extent(5, 3, 0, 2), 2);
        // Window larger than padded input: degenerate.
        assert_eq!(output_extent(2, 5, 0, 1), 0);
    }

    #[test]
    fn test_forward_known_values() {
        // Single 2x2 input, single 2x2 filter of ones, bias 1: out = sum + 1.
        let x = Tensor::from_vec(&[1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0], Precision::Double);
        let w = Tensor::full(&[1, 1, 2, 2], 1.0, Precision::Double);
        let b = Tensor::full(&[1], 1.0, Precision::Double);
        let (out, _) = Conv::forward(&x, &w, &b, &ConvParam { stride: 1, pad: 0 });
        assert_eq!(out.shape(), &[1, 1, 1, 1]);
        assert_eq!(out.data()[0], 11.0);
    }

    #[test]
    fn test_forward_does_not_mutate_input() {
        let x = Tensor::from_vec(&[1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0], Precision::Double);
        let before = x.clone();
        let w = Tensor::full(&[1, 1, 2, 2], 1.0, Precision::Double);
        let b = Tensor::zeros(&[1], Precision::Double);
        let _ = Conv::forward(&x, &w, &b, &ConvParam { stride: 1, pad: 1 });
        assert_eq!(x, before);
    }

    #[test]
    fn test_degenerate_output_is_empty() {
        let x = Tensor::zeros(&[1, 1, 2, 2], Precision::Double);
        let w = Tensor::zeros(&[1, 1, 5, 5], Precision::Double);
        let b = Tensor::zeros(&[1], Precision::Double);
        let (out, _) = Conv::forward(&x, &w, &b, &ConvParam { stride: 1, pad: 0 });
        assert_eq!(out.shape(), &[1, 1, 0, 0]);
        assert!(out.is_empty());
    }
}
