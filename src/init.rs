//! Variance-scaled random weight initialization.

use crate::tensor::{Precision, Tensor};
use crate::utils::SimpleRng;

/// Kaiming/Xavier initialization for linear and convolution layers.
///
/// Draws i.i.d. zero-mean normal samples scaled by `sqrt(gain / fan_in)`.
/// The gain is 2 when the layer feeds a rectifying nonlinearity (Kaiming)
/// and 1 otherwise (Xavier).
///
/// # Arguments
///
/// * `din`, `dout` - input and output dimensions of the layer
/// * `k` - `None` initializes a linear weight of shape (din, dout) with
///   `fan_in = din`; `Some(k)` initializes a convolution weight of shape
///   (dout, din, k, k) with `fan_in = k * k * din`
/// * `relu` - whether the layer is followed by a ReLU
///
/// # Example
///
/// ```
/// use conv_networks::init::kaiming_initializer;
/// use conv_networks::tensor::Precision;
/// use conv_networks::utils::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// let w = kaiming_initializer(3, 8, Some(3), true, Precision::Double, &mut rng);
/// assert_eq!(w.shape(), &[8, 3, 3, 3]);
/// ```
pub fn kaiming_initializer(
    din: usize,
    dout: usize,
    k: Option<usize>,
    relu: bool,
    precision: Precision,
    rng: &mut SimpleRng,
) -> Tensor {
    let gain = if relu { 2.0 } else { 1.0 };
    match k {
        None => {
            let std = (gain / din as f64).sqrt();
            scaled_randn(&[din, dout], std, precision, rng)
        }
        Some(k) => {
            let std = (gain / (k * k * din) as f64).sqrt();
            scaled_randn(&[dout, din, k, k], std, precision, rng)
        }
    }
}

fn scaled_randn(shape: &[usize], std: f64, precision: Precision, rng: &mut SimpleRng) -> Tensor {
    let len: usize = shape.iter().product();
    let data = (0..len).map(|_| std * rng.next_gaussian()).collect();
    Tensor::from_vec(shape, data, precision)
}
