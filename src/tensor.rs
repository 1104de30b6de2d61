//! Dense tensor storage shared by every kernel.
//!
//! Data lives in a flat row-major `Vec<f64>` with an explicit shape, the same
//! layout the rest of the crate indexes by hand. A [`Precision`] tag records
//! whether the tensor is meant to behave like single or double precision:
//! arithmetic always runs in `f64`, and single-precision tensors quantize
//! their values through `f32` when they are constructed and when they cross a
//! checkpoint boundary.

use crate::error::Error;
use crate::utils::SimpleRng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Numeric precision tag carried by every tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Values are representable as `f32`; quantized at construction.
    Single,
    /// Full `f64` values.
    Double,
}

impl Precision {
    /// Round a value to this precision.
    pub fn quantize(self, value: f64) -> f64 {
        match self {
            Precision::Single => value as f32 as f64,
            Precision::Double => value,
        }
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "single" => Ok(Precision::Single),
            "double" => Ok(Precision::Double),
            other => Err(Error::InvalidPrecision(other.to_string())),
        }
    }
}

/// N-dimensional array of floating-point numbers.
///
/// Kernels receive tensors by reference and never mutate caller-owned inputs;
/// padding and reshaping allocate fresh buffers. Outputs and gradients are
/// always newly allocated.
///
/// # Example
///
/// ```
/// use conv_networks::tensor::{Precision, Tensor};
///
/// let t = Tensor::zeros(&[2, 3], Precision::Double);
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.len(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
    precision: Precision,
}

impl Tensor {
    /// Create a zero-filled tensor with the given shape.
    pub fn zeros(shape: &[usize], precision: Precision) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; len],
            precision,
        }
    }

    /// Create a tensor filled with a constant value.
    pub fn full(shape: &[usize], value: f64, precision: Precision) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![precision.quantize(value); len],
            precision,
        }
    }

    /// Wrap an existing buffer. The buffer length must match the shape
    /// product; single-precision tensors quantize every value.
    pub fn from_vec(shape: &[usize], mut data: Vec<f64>, precision: Precision) -> Self {
        let len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            len,
            "data length {} does not match shape {:?}",
            data.len(),
            shape
        );
        if precision == Precision::Single {
            for v in &mut data {
                *v = precision.quantize(*v);
            }
        }
        Self {
            shape: shape.to_vec(),
            data,
            precision,
        }
    }

    /// Draw i.i.d. standard normal samples.
    pub fn randn(shape: &[usize], precision: Precision, rng: &mut SimpleRng) -> Self {
        let len: usize = shape.iter().product();
        let data = (0..len).map(|_| rng.next_gaussian()).collect();
        Self::from_vec(shape, data, precision)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Interpret the shape as (N, D), asserting rank 2.
    pub fn dims2(&self) -> (usize, usize) {
        assert_eq!(self.shape.len(), 2, "expected rank-2 tensor, got {:?}", self.shape);
        (self.shape[0], self.shape[1])
    }

    /// Interpret the shape as (N, C, H, W), asserting rank 4.
    pub fn dims4(&self) -> (usize, usize, usize, usize) {
        assert_eq!(self.shape.len(), 4, "expected rank-4 tensor, got {:?}", self.shape);
        (self.shape[0], self.shape[1], self.shape[2], self.shape[3])
    }

    /// Reinterpret the same data under a new shape of equal length.
    pub fn reshape(&self, shape: &[usize]) -> Tensor {
        let len: usize = shape.iter().product();
        assert_eq!(
            len,
            self.data.len(),
            "cannot reshape {:?} into {:?}",
            self.shape,
            shape
        );
        Tensor {
            shape: shape.to_vec(),
            data: self.data.clone(),
            precision: self.precision,
        }
    }

    /// Copy with values re-homed to the requested precision.
    pub fn to_precision(&self, precision: Precision) -> Tensor {
        Tensor::from_vec(&self.shape, self.data.clone(), precision)
    }

    /// Sum of squared entries; used for L2 regularization terms.
    pub fn sum_squares(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Zero-pad the two trailing (spatial) axes of a (N, C, H, W) tensor
    /// symmetrically. Returns a fresh tensor; the receiver is untouched.
    pub fn pad2d(&self, pad: usize) -> Tensor {
        let (n, c, h, w) = self.dims4();
        let hp = h + 2 * pad;
        let wp = w + 2 * pad;
        let mut out = Tensor::zeros(&[n, c, hp, wp], self.precision);
        for num in 0..n {
            for chan in 0..c {
                for i in 0..h {
                    let src = ((num * c + chan) * h + i) * w;
                    let dst = ((num * c + chan) * hp + i + pad) * wp + pad;
                    out.data[dst..dst + w].copy_from_slice(&self.data[src..src + w]);
                }
            }
        }
        out
    }
}
