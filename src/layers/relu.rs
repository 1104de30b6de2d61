//! Rectified linear unit.

use crate::tensor::Tensor;

/// Input retained by the forward pass; backward masks on its sign.
pub struct ReluCache {
    x: Tensor,
}

/// Elementwise `max(0, x)` with a pass-through gradient on the positive part.
pub struct Relu;

impl Relu {
    /// Clamp negatives to zero.
    pub fn forward(x: &Tensor) -> (Tensor, ReluCache) {
        let data = x.data().iter().map(|&v| v.max(0.0)).collect();
        let out = Tensor::from_vec(x.shape(), data, x.precision());
        (out, ReluCache { x: x.clone() })
    }

    /// Zero the upstream gradient wherever the input was not positive.
    pub fn backward(dout: &Tensor, cache: &ReluCache) -> Tensor {
        assert_eq!(dout.shape(), cache.x.shape(), "upstream gradient shape mismatch");
        let data = dout
            .data()
            .iter()
            .zip(cache.x.data().iter())
            .map(|(&g, &v)| if v > 0.0 { g } else { 0.0 })
            .collect();
        Tensor::from_vec(dout.shape(), data, dout.precision())
    }
}
