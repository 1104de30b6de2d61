//! Fully connected (affine) kernel backed by BLAS.
//!
//! Inputs of any rank are flattened to (N, D) where D is the product of the
//! trailing dimensions, so a pooled convolutional activation feeds straight
//! into a linear layer. The input gradient is reshaped back to the original
//! input shape.

use crate::tensor::Tensor;
use crate::utils::matrix::matmul;

/// Values retained for the backward pass.
pub struct LinearCache {
    x: Tensor,
    w: Tensor,
}

/// `out = flatten(x) * w + b`.
pub struct Linear;

impl Linear {
    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - input of shape (N, d_1, ..., d_k); flattened to (N, D)
    /// * `w` - weight matrix of shape (D, M)
    /// * `b` - bias of shape (M,)
    pub fn forward(x: &Tensor, w: &Tensor, b: &Tensor) -> (Tensor, LinearCache) {
        let n = x.shape()[0];
        let d = if n == 0 { 0 } else { x.len() / n };
        let (wd, m) = w.dims2();
        assert_eq!(d, wd, "flattened input dim {} does not match weight rows {}", d, wd);
        assert_eq!(b.shape(), &[m], "bias shape must be ({},)", m);

        let mut out_data = matmul(x.data(), w.data(), n, d, m, false, false);
        for i in 0..n {
            for j in 0..m {
                out_data[i * m + j] += b.data()[j];
            }
        }
        let out = Tensor::from_vec(&[n, m], out_data, x.precision());
        let cache = LinearCache {
            x: x.clone(),
            w: w.clone(),
        };
        (out, cache)
    }

    /// Backward pass; returns `(dx, dw, db)` where `dx` has the original
    /// (unflattened) input shape.
    pub fn backward(dout: &Tensor, cache: &LinearCache) -> (Tensor, Tensor, Tensor) {
        let n = cache.x.shape()[0];
        let d = if n == 0 { 0 } else { cache.x.len() / n };
        let (_, m) = cache.w.dims2();
        assert_eq!(dout.dims2(), (n, m), "upstream gradient shape mismatch");

        // dx = dout * w^T, reshaped to the cached input shape.
        let dx_data = matmul(dout.data(), cache.w.data(), n, m, d, false, true);
        let dx = Tensor::from_vec(cache.x.shape(), dx_data, cache.x.precision());

        // dw = x^T * dout.
        let dw_data = matmul(cache.x.data(), dout.data(), d, n, m, true, false);
        let dw = Tensor::from_vec(&[d, m], dw_data, cache.w.precision());

        let mut db = Tensor::zeros(&[m], cache.w.precision());
        for i in 0..n {
            for j in 0..m {
                db.data_mut()[j] += dout.data()[i * m + j];
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
    fn test_forward_known_values() {
        let x = Tensor::from_vec(&[1, 2], vec![1.0, 2.0], Precision::Double);
        let w = Tensor::from_vec(&[2, 2], vec![1.0, 0.0, 0.0, 1.0], Precision::Double);
        let b = Tensor::from_vec(&[2], vec![10.0, 20.0], Precision::Double);
        let (out, _) = Linear::forward(&x, &w, &b);
        assert_eq!(out.data(), &[11.0, 22.0]);
    }

    #[test]
    fn test_forward_flattens_high_rank_input() {
        let x = Tensor::from_vec(&[2, 1, 2, 2], (0..8).map(|v| v as f64).collect(), Precision::Double);
        let w = Tensor::zeros(&[4, 3], Precision::Double);
        let b = Tensor::zeros(&[3], Precision::Double);
        let (out, _) = Linear::forward(&x, &w, &b);
        assert_eq!(out.shape(), &[2, 3]);
    }

    #[test]
    fn test_backward_restores_input_shape() {
        let x = Tensor::from_vec(&[2, 1, 2, 2], (0..8).map(|v| v as f64).collect(), Precision::Double);
        let w = Tensor::full(&[4, 3], 0.5, Precision::Double);
        let b = Tensor::zeros(&[3], Precision::Double);
        let (_, cache) = Linear::forward(&x, &w, &b);
        let dout = Tensor::full(&[2, 3], 1.0, Precision::Double);
        let (dx, dw, db) = Linear::backward(&dout, &cache);
        assert_eq!(dx.shape(), &[2, 1, 2, 2]);
        assert_eq!(dw.shape(), &[4, 3]);
        assert_eq!(db.data(), &[2.0, 2.0, 2.0]);
    }
}
