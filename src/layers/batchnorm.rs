//! Batch normalization kernel with manually derived gradients.
//!
//! During training the sample mean and (uncorrected) sample variance are
//! computed from minibatch statistics and used to normalize the incoming
//! data, after which a learnable scale (gamma) and shift (beta) are applied.
//! An exponentially decaying running average of the mean and variance of each
//! feature is maintained at the same time:
//!
//! ```text
//! running_mean = momentum * running_mean + (1 - momentum) * sample_mean
//! running_var  = momentum * running_var  + (1 - momentum) * sample_var
//! ```
//!
//! At test time the running averages normalize the data instead of batch
//! statistics. Rather than mutating caller state, a train-mode forward call
//! returns the updated statistics in its result; the owning network replaces
//! its stored records with them.
//!
//! Two backward formulations are provided. [`BatchNorm::backward`] propagates
//! the chain rule through explicit variance and mean gradient stages.
//! [`BatchNorm::backward_alt`] is the algebraically reduced single-pass form;
//! it is derived independently and the two must agree to floating-point
//! tolerance.
//!
//! # References
//!
//! Ioffe, S., & Szegedy, C. (2015). Batch Normalization: Accelerating Deep
//! Network Training by Reducing Internal Covariate Shift. ICML.

use crate::error::Error;
use crate::tensor::{Precision, Tensor};
use std::str::FromStr;

/// Per-call batch normalization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BnMode {
    /// Normalize with batch statistics and report updated running averages.
    Train,
    /// Normalize with stored running averages; statistics are read-only.
    Test,
}

impl FromStr for BnMode {
    type Err = Error;

    /// Parse a mode string; anything but "train" or "test" is rejected
    /// immediately with an invalid-configuration error.
    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "train" => Ok(BnMode::Train),
            "test" => Ok(BnMode::Test),
            other => Err(Error::InvalidBatchNormMode(other.to_string())),
        }
    }
}

/// Batch normalization hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct BnParam {
    pub mode: BnMode,
    /// Numerical-stability constant added to the variance.
    pub eps: f64,
    /// Decay of the running statistics; 0 discards history, 1 never updates.
    pub momentum: f64,
}

impl BnParam {
    pub fn new(mode: BnMode) -> Self {
        Self {
            mode,
            eps: 1e-5,
            momentum: 0.9,
        }
    }

    pub fn train() -> Self {
        Self::new(BnMode::Train)
    }

    pub fn test() -> Self {
        Self::new(BnMode::Test)
    }
}

/// Exponentially averaged per-feature statistics, owned by the network.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunningStats {
    pub mean: Tensor,
    pub var: Tensor,
}

impl RunningStats {
    /// Zero-initialized statistics for `features` features.
    pub fn zeros(features: usize, precision: Precision) -> Self {
        Self {
            mean: Tensor::zeros(&[features], precision),
            var: Tensor::zeros(&[features], precision),
        }
    }

    /// Re-home both tensors to the requested precision.
    pub fn to_precision(&self, precision: Precision) -> Self {
        Self {
            mean: self.mean.to_precision(precision),
            var: self.var.to_precision(precision),
        }
    }
}

/// Intermediates retained by a train-mode forward for the backward pass.
pub struct BnCache {
    x: Tensor,
    x_hat: Tensor,
    mean: Vec<f64>,
    var: Vec<f64>,
    gamma: Tensor,
    inv_std: Vec<f64>,
    eps: f64,
}

/// Result of a batch normalization forward call.
///
/// `cache` is present only in train mode (test mode is inference-only), and
/// `stats` carries the updated running averages for the caller to persist; in
/// test mode it is an unchanged copy.
pub struct BnForward {
    pub out: Tensor,
    pub cache: Option<BnCache>,
    pub stats: RunningStats,
}

/// Vanilla (flat) batch normalization over an (N, D) batch.
pub struct BatchNorm;

impl BatchNorm {
    /// Forward pass, dispatching on `param.mode`.
    ///
    /// # Arguments
    ///
    /// * `x` - data of shape (N, D)
    /// * `gamma` - scale parameter of shape (D,)
    /// * `beta` - shift parameter of shape (D,)
    /// * `param` - mode, eps, and momentum
    /// * `stats` - the running statistics owned by the caller
    pub fn forward(
        x: &Tensor,
        gamma: &Tensor,
        beta: &Tensor,
        param: &BnParam,
        stats: &RunningStats,
    ) -> BnForward {
        match param.mode {
            BnMode::Train => {
                let (out, cache, stats) = Self::forward_train(x, gamma, beta, param, stats);
                BnForward {
                    out,
                    cache: Some(cache),
                    stats,
                }
            }
            BnMode::Test => {
                let (n, d) = x.dims2();
                assert_eq!(gamma.shape(), &[d], "gamma shape must be ({},)", d);
                assert_eq!(beta.shape(), &[d], "beta shape must be ({},)", d);
                assert_eq!(stats.mean.shape(), &[d], "running mean shape must be ({},)", d);
                let x_data = x.data();
                let mut out = Tensor::zeros(&[n, d], x.precision());
                for i in 0..n {
                    for j in 0..d {
                        let idx = i * d + j;
                        let xh = (x_data[idx] - stats.mean.data()[j])
                            / (stats.var.data()[j] + param.eps).sqrt();
                        out.data_mut()[idx] = gamma.data()[j] * xh + beta.data()[j];
                    }
                }
                BnForward {
                    out,
                    cache: None,
                    stats: stats.clone(),
                }
            }
        }
    }

    /// Train-mode forward pass; always produces a cache, so compositions
    /// that need one get it without inspecting an `Option`.
    pub fn forward_train(
        x: &Tensor,
        gamma: &Tensor,
        beta: &Tensor,
        param: &BnParam,
        stats: &RunningStats,
    ) -> (Tensor, BnCache, RunningStats) {
        let (n, d) = x.dims2();
        assert!(n > 0, "train-mode batchnorm needs a non-empty batch");
        assert_eq!(gamma.shape(), &[d], "gamma shape must be ({},)", d);
        assert_eq!(beta.shape(), &[d], "beta shape must be ({},)", d);
        assert_eq!(stats.mean.shape(), &[d], "running mean shape must be ({},)", d);
        let x_data = x.data();

        // Biased (divide-by-N) batch statistics per feature.
        let mut mean = vec![0.0f64; d];
        for i in 0..n {
            for j in 0..d {
                mean[j] += x_data[i * d + j];
            }
        }
        for m in &mut mean {
            *m /= n as f64;
        }

        let mut var = vec![0.0f64; d];
        for i in 0..n {
            for j in 0..d {
                let diff = x_data[i * d + j] - mean[j];
                var[j] += diff * diff;
            }
        }
        for v in &mut var {
            *v /= n as f64;
        }

        let inv_std: Vec<f64> = var.iter().map(|&v| 1.0 / (v + param.eps).sqrt()).collect();

        let mut x_hat = Tensor::zeros(&[n, d], x.precision());
        let mut out = Tensor::zeros(&[n, d], x.precision());
        for i in 0..n {
            for j in 0..d {
                let idx = i * d + j;
                let xh = (x_data[idx] - mean[j]) * inv_std[j];
                x_hat.data_mut()[idx] = xh;
                out.data_mut()[idx] = gamma.data()[j] * xh + beta.data()[j];
            }
        }

        let mut new_stats = stats.clone();
        for j in 0..d {
            new_stats.mean.data_mut()[j] =
                param.momentum * stats.mean.data()[j] + (1.0 - param.momentum) * mean[j];
            new_stats.var.data_mut()[j] =
                param.momentum * stats.var.data()[j] + (1.0 - param.momentum) * var[j];
        }

        let cache = BnCache {
            x: x.clone(),
            x_hat,
            mean,
            var,
            gamma: gamma.clone(),
            inv_std,
            eps: param.eps,
        };
        (out, cache, new_stats)
    }

    /// Backward pass staged through explicit variance and mean gradients.
    ///
    /// Returns `(dx, dgamma, dbeta)` for an upstream gradient of shape (N, D).
    pub fn backward(dout: &Tensor, cache: &BnCache) -> (Tensor, Tensor, Tensor) {
        let (n, d) = cache.x.dims2();
        assert_eq!(dout.dims2(), (n, d), "upstream gradient shape mismatch");
        let nf = n as f64;
        let x = cache.x.data();
        let x_hat = cache.x_hat.data();
        let gamma = cache.gamma.data();
        let dout_data = dout.data();

        let mut dgamma = Tensor::zeros(&[d], cache.gamma.precision());
        let mut dbeta = Tensor::zeros(&[d], cache.gamma.precision());
        for i in 0..n {
            for j in 0..d {
                let idx = i * d + j;
                dgamma.data_mut()[j] += x_hat[idx] * dout_data[idx];
                dbeta.data_mut()[j] += dout_data[idx];
            }
        }

        // Gradient through the variance node:
        // dvar = sum(dx_hat * (x - mean)) * -1/2 * (var + eps)^(-3/2)
        let mut dvar = vec![0.0f64; d];
        for i in 0..n {
            for j in 0..d {
                let idx = i * d + j;
                let dx_hat = gamma[j] * dout_data[idx];
                dvar[j] += dx_hat * (x[idx] - cache.mean[j]);
            }
        }
        for j in 0..d {
            dvar[j] *= -0.5 * (cache.var[j] + cache.eps).powf(-1.5);
        }

        // Gradient through the mean node. The second term is mathematically
        // zero (sum of centered values) but is kept to mirror the staged
        // derivation exactly.
        let mut dmean = vec![0.0f64; d];
        let mut centered_sum = vec![0.0f64; d];
        for i in 0..n {
            for j in 0..d {
                let idx = i * d + j;
                let dx_hat = gamma[j] * dout_data[idx];
                dmean[j] -= dx_hat * cache.inv_std[j];
                centered_sum[j] += x[idx] - cache.mean[j];
            }
        }
        for j in 0..d {
            dmean[j] += dvar[j] * (-2.0 / nf) * centered_sum[j];
        }

        let mut dx = Tensor::zeros(&[n, d], cache.x.precision());
        for i in 0..n {
            for j in 0..d {
                let idx = i * d + j;
                let dx_hat = gamma[j] * dout_data[idx];
                dx.data_mut()[idx] = dx_hat * cache.inv_std[j]
                    + dvar[j] * 2.0 / nf * (x[idx] - cache.mean[j])
                    + dmean[j] / nf;
            }
        }
        (dx, dgamma, dbeta)
    }

    /// Algebraically reduced backward pass.
    ///
    /// Uses only `x_hat`, `inv_std`, `gamma`, `dout`, and the batch size:
    ///
    /// ```text
    /// dx = inv_std / N * (N * dx_hat - sum(dx_hat) - x_hat * sum(dx_hat * x_hat))
    /// ```
    ///
    /// Derived independently from [`BatchNorm::backward`]; the two agree to
    /// floating-point tolerance on the same cache and upstream gradient.
    pub fn backward_alt(dout: &Tensor, cache: &BnCache) -> (Tensor, Tensor, Tensor) {
        let (n, d) = cache.x_hat.dims2();
        assert_eq!(dout.dims2(), (n, d), "upstream gradient shape mismatch");
        let nf = n as f64;
        let x_hat = cache.x_hat.data();
        let gamma = cache.gamma.data();
        let dout_data = dout.data();

        let mut dgamma = Tensor::zeros(&[d], cache.gamma.precision());
        let mut dbeta = Tensor::zeros(&[d], cache.gamma.precision());
        let mut sum_dx_hat = vec![0.0f64; d];
        let mut sum_dx_hat_x_hat = vec![0.0f64; d];
        for i in 0..n {
            for j in 0..d {
                let idx = i * d + j;
                let dx_hat = gamma[j] * dout_data[idx];
                dgamma.data_mut()[j] += x_hat[idx] * dout_data[idx];
                dbeta.data_mut()[j] += dout_data[idx];
                sum_dx_hat[j] += dx_hat;
                sum_dx_hat_x_hat[j] += dx_hat * x_hat[idx];
            }
        }

        let mut dx = Tensor::zeros(&[n, d], cache.x_hat.precision());
        for i in 0..n {
            for j in 0..d {
                let idx = i * d + j;
                let dx_hat = gamma[j] * dout_data[idx];
                dx.data_mut()[idx] = cache.inv_std[j] / nf
                    * (nf * dx_hat - sum_dx_hat[j] - x_hat[idx] * sum_dx_hat_x_hat[j]);
            }
        }
        (dx, dgamma, dbeta)
    }
}
