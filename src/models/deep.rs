//! Variable-depth convolutional network in VGG style.
//!
//! Architecture: `{conv - [batchnorm?] - relu - [pool?]} x (L - 1) - linear`.
//! Every convolution uses a 3x3 kernel with stride 1 and pad 1 so the feature
//! map size is preserved, and every pooling layer is a 2x2 stride-2 max pool
//! that halves it. Macro layers are an ordered array of per-layer parameter
//! structs; the canonical `W{i}`/`b{i}`/`gamma{i}`/`beta{i}` names are a view
//! derived from the position.

use crate::error::{Error, Result};
use crate::init::kaiming_initializer;
use crate::layers::batchnorm::{BnParam, RunningStats};
use crate::layers::conv::ConvParam;
use crate::layers::fast::{FastConv, FastMaxPool};
use crate::layers::linear::Linear;
use crate::layers::pool::PoolParam;
use crate::layers::relu::Relu;
use crate::layers::sandwich::{
    ConvBatchNormRelu, ConvBatchNormReluCache, ConvBatchNormReluPool, ConvBatchNormReluPoolCache,
    ConvRelu, ConvReluCache, ConvReluPool, ConvReluPoolCache,
};
use crate::layers::spatial_batchnorm::SpatialBatchNorm;
use crate::losses::softmax_loss;
use crate::tensor::{Precision, Tensor};
use crate::utils::SimpleRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How convolutional and linear weights are initialized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightScale {
    /// `scale * randn`.
    Constant(f64),
    /// Variance-scaled initialization keyed to fan-in and ReLU gain.
    Kaiming,
}

/// Learnable tensors of one macro layer. `gamma`/`beta` are present exactly
/// when the network was built with batch normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroLayerParams {
    pub w: Tensor,
    pub b: Tensor,
    pub gamma: Option<Tensor>,
    pub beta: Option<Tensor>,
}

impl MacroLayerParams {
    /// Scale and shift of a batchnorm-bearing layer.
    fn norm(&self) -> (&Tensor, &Tensor) {
        match (&self.gamma, &self.beta) {
            (Some(gamma), Some(beta)) => (gamma, beta),
            _ => panic!("macro layer is missing its batchnorm scale/shift"),
        }
    }
}

/// Gradients of one macro layer, mirroring [`MacroLayerParams`].
pub struct MacroLayerGrads {
    pub w: Tensor,
    pub b: Tensor,
    pub gamma: Option<Tensor>,
    pub beta: Option<Tensor>,
}

/// Full gradient set of a deep network: one entry per learnable parameter.
pub struct DeepGrads {
    pub layers: Vec<MacroLayerGrads>,
    pub final_w: Tensor,
    pub final_b: Tensor,
}

impl DeepGrads {
    /// Canonical (name, tensor) view in parameter order.
    pub fn named(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            out.push((format!("W{}", i + 1), &layer.w));
            out.push((format!("b{}", i + 1), &layer.b));
            if let Some(gamma) = &layer.gamma {
                out.push((format!("gamma{}", i + 1), gamma));
            }
            if let Some(beta) = &layer.beta {
                out.push((format!("beta{}", i + 1), beta));
            }
        }
        let l = self.layers.len() + 1;
        out.push((format!("W{}", l), &self.final_w));
        out.push((format!("b{}", l), &self.final_b));
        out
    }
}

/// Per-macro-layer forward cache; the variant matches the sandwich that ran.
enum LayerCache {
    ConvRelu(ConvReluCache),
    ConvReluPool(ConvReluPoolCache),
    ConvBnRelu(ConvBatchNormReluCache),
    ConvBnReluPool(ConvBatchNormReluPoolCache),
}

#[derive(Serialize, Deserialize)]
struct DeepCheckpoint {
    reg: f64,
    precision: Precision,
    num_layers: usize,
    max_pools: Vec<usize>,
    batchnorm: bool,
    layers: Vec<MacroLayerParams>,
    final_w: Tensor,
    final_b: Tensor,
    bn_stats: Vec<RunningStats>,
}

/// Deep convolutional network with L - 1 macro layers and a final linear
/// layer.
#[derive(Debug)]
pub struct DeepConvNet {
    layers: Vec<MacroLayerParams>,
    final_w: Tensor,
    final_b: Tensor,
    /// One record per macro layer when batchnorm is enabled, else empty.
    bn_stats: Vec<RunningStats>,
    max_pools: Vec<usize>,
    batchnorm: bool,
    reg: f64,
    precision: Precision,
}

const CONV_PARAM: ConvParam = ConvParam { stride: 1, pad: 1 };

impl DeepConvNet {
    /// Initialize a new network.
    ///
    /// # Arguments
    ///
    /// * `input_dims` - (C, H, W) of one input sample
    /// * `num_filters` - filters per macro layer; its length is L - 1
    /// * `max_pools` - zero-based indices of the macro layers followed by a
    ///   2x2 max pool
    /// * `batchnorm` - whether each macro layer carries batch normalization
    /// * `weight_scale` - constant scale or Kaiming initialization
    /// * `reg` - L2 regularization strength, applied to convolutional and
    ///   fully connected weights only, never to biases or batchnorm
    ///   scale/shift
    ///
    /// Fails fast when `num_filters` is empty, a pool index is out of range,
    /// or the constructed parameter set does not match the architecture.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_dims: (usize, usize, usize),
        num_filters: &[usize],
        max_pools: &[usize],
        batchnorm: bool,
        num_classes: usize,
        weight_scale: WeightScale,
        reg: f64,
        precision: Precision,
        seed: u64,
    ) -> Result<Self> {
        if num_filters.is_empty() {
            return Err(Error::EmptyFilterList);
        }
        for &index in max_pools {
            if index >= num_filters.len() {
                return Err(Error::PoolIndexOutOfRange {
                    index,
                    layers: num_filters.len(),
                });
            }
        }

        let (c, h, w) = input_dims;
        let mut rng = SimpleRng::new(seed);
        let mut layers = Vec::with_capacity(num_filters.len());
        let mut channels = c;
        for &filters in num_filters {
            let weight = match weight_scale {
                WeightScale::Kaiming => {
                    kaiming_initializer(channels, filters, Some(3), true, precision, &mut rng)
                }
                WeightScale::Constant(scale) => {
                    scaled_randn(&[filters, channels, 3, 3], scale, precision, &mut rng)
                }
            };
            layers.push(MacroLayerParams {
                w: weight,
                b: Tensor::zeros(&[filters], precision),
                gamma: batchnorm.then(|| Tensor::full(&[filters], 1.0, precision)),
                beta: batchnorm.then(|| Tensor::zeros(&[filters], precision)),
            });
            channels = filters;
        }

        // Each distinct pooled layer shrinks the feature map by 4.
        let mut distinct = max_pools.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        let shrink = 4usize.pow(distinct.len() as u32);
        let flat_dim = channels * h * w / shrink;
        let final_w = match weight_scale {
            WeightScale::Kaiming => {
                kaiming_initializer(flat_dim, num_classes, None, true, precision, &mut rng)
            }
            WeightScale::Constant(scale) => {
                scaled_randn(&[flat_dim, num_classes], scale, precision, &mut rng)
            }
        };

        let bn_stats = if batchnorm {
            num_filters
                .iter()
                .map(|&f| RunningStats::zeros(f, precision))
                .collect()
        } else {
            Vec::new()
        };

        let net = Self {
            layers,
            final_w,
            final_b: Tensor::zeros(&[num_classes], precision),
            bn_stats,
            max_pools: max_pools.to_vec(),
            batchnorm,
            reg,
            precision,
        };
        net.validate()?;
        Ok(net)
    }

    /// Check the constructed parameter set against the requested
    /// architecture: the learnable tensor count and every tensor's precision.
    fn validate(&self) -> Result<()> {
        let params_per_macro_layer = if self.batchnorm { 4 } else { 2 };
        let expected = params_per_macro_layer * self.layers.len() + 2;
        let named = self.named_parameters();
        if named.len() != expected {
            return Err(Error::ParameterCountMismatch {
                got: named.len(),
                expected,
            });
        }
        for (name, tensor) in named {
            if tensor.precision() != self.precision {
                return Err(Error::PrecisionMismatch {
                    name,
                    actual: tensor.precision(),
                    expected: self.precision,
                });
            }
        }
        Ok(())
    }

    /// Total number of layers L (macro layers plus the final linear layer).
    pub fn num_layers(&self) -> usize {
        self.layers.len() + 1
    }

    pub fn batchnorm(&self) -> bool {
        self.batchnorm
    }

    pub fn reg(&self) -> f64 {
        self.reg
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn max_pools(&self) -> &[usize] {
        &self.max_pools
    }

    /// Running statistics per batchnorm layer; empty without batchnorm.
    pub fn bn_stats(&self) -> &[RunningStats] {
        &self.bn_stats
    }

    /// Canonical (name, tensor) view of the learnable parameters.
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            out.push((format!("W{}", i + 1), &layer.w));
            out.push((format!("b{}", i + 1), &layer.b));
            if let Some(gamma) = &layer.gamma {
                out.push((format!("gamma{}", i + 1), gamma));
            }
            if let Some(beta) = &layer.beta {
                out.push((format!("beta{}", i + 1), beta));
            }
        }
        let l = self.num_layers();
        out.push((format!("W{}", l), &self.final_w));
        out.push((format!("b{}", l), &self.final_b));
        out
    }

    /// Mutable view of the learnable parameters, for the external optimizer
    /// to apply updates between training steps.
    pub fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut out = Vec::new();
        let l = self.layers.len() + 1;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            out.push((format!("W{}", i + 1), &mut layer.w));
            out.push((format!("b{}", i + 1), &mut layer.b));
            if let Some(gamma) = &mut layer.gamma {
                out.push((format!("gamma{}", i + 1), gamma));
            }
            if let Some(beta) = &mut layer.beta {
                out.push((format!("beta{}", i + 1), beta));
            }
        }
        out.push((format!("W{}", l), &mut self.final_w));
        out.push((format!("b{}", l), &mut self.final_b));
        out
    }

    fn pools(&self, index: usize) -> bool {
        self.max_pools.contains(&index)
    }

    /// Class scores for a batch: inference only. Batch normalization runs in
    /// test mode against the stored running statistics, which stay untouched.
    pub fn predict(&self, x: &Tensor) -> Tensor {
        let mut out = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            if self.batchnorm {
                let (gamma, beta) = layer.norm();
                let (a, _) = FastConv::forward(&out, &layer.w, &layer.b, &CONV_PARAM);
                let fwd =
                    SpatialBatchNorm::forward(&a, gamma, beta, &BnParam::test(), &self.bn_stats[i]);
                let (s, _) = Relu::forward(&fwd.out);
                out = s;
            } else {
                let (s, _) = ConvRelu::forward(&out, &layer.w, &layer.b, &CONV_PARAM);
                out = s;
            }
            if self.pools(i) {
                let (s, _) = FastMaxPool::forward(&out, &PoolParam::halving());
                out = s;
            }
        }
        let (scores, _) = Linear::forward(&out, &self.final_w, &self.final_b);
        scores
    }

    /// Loss and full gradient set for a labeled minibatch.
    ///
    /// Batch normalization runs in train mode; the statistics returned by the
    /// forward chain replace the stored records. The L2 term here is
    /// `reg * sum(W^2)` per weight with `2 * reg * W` added to each weight
    /// gradient, the convention this architecture documents (the three-layer
    /// network uses the `0.5 * reg` scaling instead).
    pub fn loss(&mut self, x: &Tensor, y: &[usize]) -> (f64, DeepGrads) {
        let pool_param = PoolParam::halving();
        let bn_param = BnParam::train();

        let mut out = x.clone();
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut new_stats = Vec::with_capacity(self.bn_stats.len());
        for (i, layer) in self.layers.iter().enumerate() {
            if self.batchnorm {
                let (gamma, beta) = layer.norm();
                if self.pools(i) {
                    let (s, cache, stats) = ConvBatchNormReluPool::forward(
                        &out,
                        &layer.w,
                        &layer.b,
                        gamma,
                        beta,
                        &CONV_PARAM,
                        &bn_param,
                        &pool_param,
                        &self.bn_stats[i],
                    );
                    out = s;
                    caches.push(LayerCache::ConvBnReluPool(cache));
                    new_stats.push(stats);
                } else {
                    let (s, cache, stats) = ConvBatchNormRelu::forward(
                        &out,
                        &layer.w,
                        &layer.b,
                        gamma,
                        beta,
                        &CONV_PARAM,
                        &bn_param,
                        &self.bn_stats[i],
                    );
                    out = s;
                    caches.push(LayerCache::ConvBnRelu(cache));
                    new_stats.push(stats);
                }
            } else if self.pools(i) {
                let (s, cache) =
                    ConvReluPool::forward(&out, &layer.w, &layer.b, &CONV_PARAM, &pool_param);
                out = s;
                caches.push(LayerCache::ConvReluPool(cache));
            } else {
                let (s, cache) = ConvRelu::forward(&out, &layer.w, &layer.b, &CONV_PARAM);
                out = s;
                caches.push(LayerCache::ConvRelu(cache));
            }
        }
        let (scores, final_cache) = Linear::forward(&out, &self.final_w, &self.final_b);

        let (mut loss, dscores) = softmax_loss(&scores, y);
        for layer in &self.layers {
            loss += self.reg * layer.w.sum_squares();
        }
        loss += self.reg * self.final_w.sum_squares();

        let (mut dout, mut final_dw, final_db) = Linear::backward(&dscores, &final_cache);
        add_scaled(&mut final_dw, &self.final_w, 2.0 * self.reg);

        let mut layer_grads: Vec<MacroLayerGrads> = Vec::with_capacity(self.layers.len());
        for (layer, cache) in self.layers.iter().zip(caches.iter()).rev() {
            let grads = match cache {
                LayerCache::ConvRelu(c) => {
                    let (dx, mut dw, db) = ConvRelu::backward(&dout, c);
                    dout = dx;
                    add_scaled(&mut dw, &layer.w, 2.0 * self.reg);
                    MacroLayerGrads {
                        w: dw,
                        b: db,
                        gamma: None,
                        beta: None,
                    }
                }
                LayerCache::ConvReluPool(c) => {
                    let (dx, mut dw, db) = ConvReluPool::backward(&dout, c);
                    dout = dx;
                    add_scaled(&mut dw, &layer.w, 2.0 * self.reg);
                    MacroLayerGrads {
                        w: dw,
                        b: db,
                        gamma: None,
                        beta: None,
                    }
                }
                LayerCache::ConvBnRelu(c) => {
                    let (dx, mut dw, db, dgamma, dbeta) = ConvBatchNormRelu::backward(&dout, c);
                    dout = dx;
                    add_scaled(&mut dw, &layer.w, 2.0 * self.reg);
                    MacroLayerGrads {
                        w: dw,
                        b: db,
                        gamma: Some(dgamma),
                        beta: Some(dbeta),
                    }
                }
                LayerCache::ConvBnReluPool(c) => {
                    let (dx, mut dw, db, dgamma, dbeta) = ConvBatchNormReluPool::backward(&dout, c);
                    dout = dx;
                    add_scaled(&mut dw, &layer.w, 2.0 * self.reg);
                    MacroLayerGrads {
                        w: dw,
                        b: db,
                        gamma: Some(dgamma),
                        beta: Some(dbeta),
                    }
                }
            };
            layer_grads.push(grads);
        }
        layer_grads.reverse();

        if self.batchnorm {
            self.bn_stats = new_stats;
        }

        (
            loss,
            DeepGrads {
                layers: layer_grads,
                final_w: final_dw,
                final_b: final_db,
            },
        )
    }

    /// Serialize the network state to a JSON checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        let checkpoint = DeepCheckpoint {
            reg: self.reg,
            precision: self.precision,
            num_layers: self.num_layers(),
            max_pools: self.max_pools.clone(),
            batchnorm: self.batchnorm,
            layers: self.layers.clone(),
            final_w: self.final_w.clone(),
            final_b: self.final_b.clone(),
            bn_stats: self.bn_stats.clone(),
        };
        fs::write(path, serde_json::to_string(&checkpoint)?)?;
        Ok(())
    }

    /// Restore a network from a checkpoint, re-homing every tensor (including
    /// the running statistics) to the requested precision.
    pub fn load(path: &Path, precision: Precision) -> Result<Self> {
        let checkpoint: DeepCheckpoint = serde_json::from_str(&fs::read_to_string(path)?)?;
        if checkpoint.num_layers != checkpoint.layers.len() + 1 {
            return Err(Error::ParameterCountMismatch {
                got: checkpoint.layers.len() + 1,
                expected: checkpoint.num_layers,
            });
        }
        let layers = checkpoint
            .layers
            .into_iter()
            .map(|layer| MacroLayerParams {
                w: layer.w.to_precision(precision),
                b: layer.b.to_precision(precision),
                gamma: layer.gamma.map(|t| t.to_precision(precision)),
                beta: layer.beta.map(|t| t.to_precision(precision)),
            })
            .collect();
        let bn_stats = checkpoint
            .bn_stats
            .iter()
            .map(|s| s.to_precision(precision))
            .collect();
        let net = Self {
            layers,
            final_w: checkpoint.final_w.to_precision(precision),
            final_b: checkpoint.final_b.to_precision(precision),
            bn_stats,
            max_pools: checkpoint.max_pools,
            batchnorm: checkpoint.batchnorm,
            reg: checkpoint.reg,
            precision,
        };
        net.validate()?;
        Ok(net)
    }
}

fn scaled_randn(shape: &[usize], scale: f64, precision: Precision, rng: &mut SimpleRng) -> Tensor {
    let len: usize = shape.iter().product();
    let data = (0..len).map(|_| scale * rng.next_gaussian()).collect();
    Tensor::from_vec(shape, data, precision)
}

fn add_scaled(grad: &mut Tensor, param: &Tensor, scale: f64) {
    for (g, p) in grad.data_mut().iter_mut().zip(param.data().iter()) {
        *g += scale * p;
    }
}
