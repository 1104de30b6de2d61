//! GEMM-backed convolution and index-caching max pooling.
//!
//! These are the kernels the sandwich layers run on. `FastConv` lowers each
//! receptive-field window into a row of a column matrix (im2col) and reduces
//! the convolution to one BLAS multiply; backward runs the transposed
//! multiplies and scatters the column gradient back (col2im). `FastMaxPool`
//! records the flat argmax index of every window during forward so backward
//! is a single scatter through the recorded indices (ties break to the first
//! occurrence, unlike the naive kernel's distribute-to-all policy).
//!
//! Outputs and gradients match the naive kernels within numerical-
//! differentiation tolerance. Backward calls report an explicit
//! [`GradOutcome`]: a degenerate zero-size output plane cannot be
//! differentiated through, so zero gradients of the correct shapes are
//! substituted and the outcome says so instead of failing the whole chain.

use crate::layers::conv::{output_extent, ConvParam};
use crate::layers::pool::PoolParam;
use crate::tensor::{Precision, Tensor};
use crate::utils::matrix::matmul;

/// Whether a backward call produced a real gradient or substituted zeros for
/// a degenerate shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradOutcome {
    Computed,
    /// The forward output had no elements; gradients are zero tensors of the
    /// correct shapes. A documented approximation, not a correctness claim.
    DegenerateZero,
}

/// Gradients of a fast convolution backward call.
pub struct FastConvGrads {
    pub dx: Tensor,
    pub dw: Tensor,
    pub db: Tensor,
    pub outcome: GradOutcome,
}

/// Gradient of a fast pooling backward call.
pub struct FastPoolGrads {
    pub dx: Tensor,
    pub outcome: GradOutcome,
}

/// Forward intermediates of [`FastConv`]: the column matrix is kept so
/// backward never re-lowers the input.
pub struct FastConvCache {
    x: Tensor,
    w: Tensor,
    param: ConvParam,
    /// (N*Hout*Wout) x (C*HH*WW) row-major im2col matrix.
    cols: Vec<f64>,
    hout: usize,
    wout: usize,
}

/// im2col + GEMM convolution, numerically consistent with
/// [`crate::layers::conv::Conv`].
pub struct FastConv;

impl FastConv {
    /// Forward pass; same contract as the naive kernel.
    pub fn forward(x: &Tensor, w: &Tensor, b: &Tensor, param: &ConvParam) -> (Tensor, FastConvCache) {
        let (n, c, h, width) = x.dims4();
        let (f, cw, hh, ww) = w.dims4();
        assert_eq!(c, cw, "filter channel count {} does not match input {}", cw, c);
        assert_eq!(b.shape(), &[f], "bias shape must be ({},)", f);

        let hout = output_extent(h, hh, param.pad, param.stride);
        let wout = output_extent(width, ww, param.pad, param.stride);
        let rows = n * hout * wout;
        let k = c * hh * ww;

        let xp = x.pad2d(param.pad);
        let (_, _, hp, wp) = xp.dims4();
        let xp_data = xp.data();

        // Lower every receptive field into one row.
        let mut cols = vec![0.0f64; rows * k];
        for num in 0..n {
            for i in 0..hout {
                for j in 0..wout {
                    let row = (num * hout + i) * wout + j;
                    let v0 = i * param.stride;
                    let h0 = j * param.stride;
                    for chan in 0..c {
                        for di in 0..hh {
                            let src = ((num * c + chan) * hp + v0 + di) * wp + h0;
                            let dst = row * k + (chan * hh + di) * ww;
                            cols[dst..dst + ww].copy_from_slice(&xp_data[src..src + ww]);
                        }
                    }
                }
            }
        }

        // (rows x k) * (k x F) with the filters used transposed.
        let out_rows = matmul(&cols, w.data(), rows, k, f, false, true);
        let mut out = Tensor::zeros(&[n, f, hout, wout], x.precision());
        for num in 0..n {
            for filt in 0..f {
                for i in 0..hout {
                    for j in 0..wout {
                        let row = (num * hout + i) * wout + j;
                        out.data_mut()[((num * f + filt) * hout + i) * wout + j] =
                            out_rows[row * f + filt] + b.data()[filt];
                    }
                }
            }
        }

        let cache = FastConvCache {
            x: x.clone(),
            w: w.clone(),
            param: *param,
            cols,
            hout,
            wout,
        };
        (out, cache)
    }

    /// Backward pass. A degenerate (element-free) forward output yields zero
    /// gradients with [`GradOutcome::DegenerateZero`].
    pub fn backward(dout: &Tensor, cache: &FastConvCache) -> FastConvGrads {
        let (n, c, h, width) = cache.x.dims4();
        let (f, _, hh, ww) = cache.w.dims4();
        let (hout, wout) = (cache.hout, cache.wout);
        assert_eq!(
            dout.shape(),
            &[n, f, hout, wout],
            "upstream gradient shape mismatch"
        );

        if dout.is_empty() {
            return FastConvGrads {
                dx: Tensor::zeros(cache.x.shape(), cache.x.precision()),
                dw: Tensor::zeros(cache.w.shape(), cache.w.precision()),
                db: Tensor::zeros(&[f], cache.w.precision()),
                outcome: GradOutcome::DegenerateZero,
            };
        }

        let rows = n * hout * wout;
        let k = c * hh * ww;

        // Regroup dout as (rows x F).
        let mut dout_rows = vec![0.0f64; rows * f];
        let mut db = Tensor::zeros(&[f], cache.w.precision());
        for num in 0..n {
            for filt in 0..f {
                for i in 0..hout {
                    for j in 0..wout {
                        let g = dout.data()[((num * f + filt) * hout + i) * wout + j];
                        dout_rows[((num * hout + i) * wout + j) * f + filt] = g;
                        db.data_mut()[filt] += g;
                    }
                }
            }
        }

        // dw = dout^T * cols, dcols = dout * w.
        let dw_data = matmul(&dout_rows, &cache.cols, f, rows, k, true, false);
        let dw = Tensor::from_vec(cache.w.shape(), dw_data, cache.w.precision());
        let dcols = matmul(&dout_rows, cache.w.data(), rows, f, k, false, false);

        // col2im: scatter-add the column gradient into the padded plane, then
        // strip the border.
        let pad = cache.param.pad;
        let stride = cache.param.stride;
        let (hp, wp) = (h + 2 * pad, width + 2 * pad);
        let mut dpad = vec![0.0f64; n * c * hp * wp];
        for num in 0..n {
            for i in 0..hout {
                for j in 0..wout {
                    let row = (num * hout + i) * wout + j;
                    let v0 = i * stride;
                    let h0 = j * stride;
                    for chan in 0..c {
                        for di in 0..hh {
                            let dst = ((num * c + chan) * hp + v0 + di) * wp + h0;
                            let src = row * k + (chan * hh + di) * ww;
                            for dj in 0..ww {
                                dpad[dst + dj] += dcols[src + dj];
                            }
                        }
                    }
                }
            }
        }
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

        FastConvGrads {
            dx,
            dw,
            db,
            outcome: GradOutcome::Computed,
        }
    }
}

/// Forward intermediates of [`FastMaxPool`]: one flat input index per output
/// element.
pub struct FastPoolCache {
    x_shape: [usize; 4],
    precision: Precision,
    argmax: Vec<usize>,
}

/// Max pooling with a recorded argmax; backward is a single scatter.
pub struct FastMaxPool;

impl FastMaxPool {
    /// Forward pass; same contract as the naive kernel apart from tie
    /// handling (first maximum wins).
    pub fn forward(x: &Tensor, param: &PoolParam) -> (Tensor, FastPoolCache) {
        let (n, c, h, w) = x.dims4();
        let hout = output_extent(h, param.pool_height, 0, param.stride);
        let wout = output_extent(w, param.pool_width, 0, param.stride);
        let x_data = x.data();

        let mut out = Tensor::zeros(&[n, c, hout, wout], x.precision());
        let mut argmax = vec![0usize; n * c * hout * wout];
        for num in 0..n {
            for chan in 0..c {
                for i in 0..hout {
                    for j in 0..wout {
                        let v0 = i * param.stride;
                        let h0 = j * param.stride;
                        let mut best = f64::NEG_INFINITY;
                        let mut best_idx = 0usize;
                        for di in 0..param.pool_height {
                            let row = ((num * c + chan) * h + v0 + di) * w + h0;
                            for dj in 0..param.pool_width {
                                if x_data[row + dj] > best {
                                    best = x_data[row + dj];
                                    best_idx = row + dj;
                                }
                            }
                        }
                        let o = ((num * c + chan) * hout + i) * wout + j;
                        out.data_mut()[o] = best;
                        argmax[o] = best_idx;
                    }
                }
            }
        }

        let cache = FastPoolCache {
            x_shape: [n, c, h, w],
            precision: x.precision(),
            argmax,
        };
        (out, cache)
    }

    /// Backward pass through the recorded indices.
    pub fn backward(dout: &Tensor, cache: &FastPoolCache) -> FastPoolGrads {
        assert_eq!(
            dout.len(),
            cache.argmax.len(),
            "upstream gradient element count mismatch"
        );
        let mut dx = Tensor::zeros(&cache.x_shape, cache.precision);
        if dout.is_empty() {
            return FastPoolGrads {
                dx,
                outcome: GradOutcome::DegenerateZero,
            };
        }
        for (o, &src) in cache.argmax.iter().enumerate() {
            dx.data_mut()[src] += dout.data()[o];
        }
        FastPoolGrads {
            dx,
            outcome: GradOutcome::Computed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_conv_backward_is_zero() {
        let x = Tensor::zeros(&[1, 1, 2, 2], Precision::Double);
        let w = Tensor::zeros(&[1, 1, 5, 5], Precision::Double);
        let b = Tensor::zeros(&[1], Precision::Double);
        let (out, cache) = FastConv::forward(&x, &w, &b, &ConvParam { stride: 1, pad: 0 });
        assert!(out.is_empty());
        let grads = FastConv::backward(&out, &cache);
        assert_eq!(grads.outcome, GradOutcome::DegenerateZero);
        assert_eq!(grads.dx.shape(), x.shape());
        assert_eq!(grads.dw.shape(), w.shape());
        assert!(grads.dw.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_pool_argmax_scatter() {
        let x = Tensor::from_vec(&[1, 1, 2, 2], vec![1.0, 5.0, 2.0, 0.0], Precision::Double);
        let (out, cache) = FastMaxPool::forward(&x, &PoolParam::halving());
        assert_eq!(out.data(), &[5.0]);
        let dout = Tensor::from_vec(&[1, 1, 1, 1], vec![4.0], Precision::Double);
        let grads = FastMaxPool::backward(&dout, &cache);
        assert_eq!(grads.outcome, GradOutcome::Computed);
        assert_eq!(grads.dx.data(), &[0.0, 4.0, 0.0, 0.0]);
    }
}
