//! Sandwich layers: compositions of primitive kernels behind a single
//! forward/backward pair.
//!
//! Each forward chains its constituent forwards in order and bundles their
//! caches into one composite cache struct; each backward unpacks the bundle
//! and runs the constituent backwards in exactly reverse order, threading the
//! output gradient of one stage into the next. Convolution and pooling run on
//! the GEMM-backed fast kernels; a degenerate fast-path gradient arrives as
//! zeros and the chain simply continues.
//!
//! Variants with batch normalization return the updated running statistics
//! alongside the output; the owning network persists them.

use crate::layers::batchnorm::{BatchNorm, BnCache, BnParam, RunningStats};
use crate::layers::conv::ConvParam;
use crate::layers::fast::{FastConv, FastConvCache, FastMaxPool, FastPoolCache};
use crate::layers::linear::{Linear, LinearCache};
use crate::layers::pool::PoolParam;
use crate::layers::relu::{Relu, ReluCache};
use crate::layers::spatial_batchnorm::SpatialBatchNorm;
use crate::tensor::Tensor;

/// Convolution followed by a ReLU.
pub struct ConvRelu;

pub struct ConvReluCache {
    conv: FastConvCache,
    relu: ReluCache,
}

impl ConvRelu {
    pub fn forward(
        x: &Tensor,
        w: &Tensor,
        b: &Tensor,
        conv_param: &ConvParam,
    ) -> (Tensor, ConvReluCache) {
        let (a, conv) = FastConv::forward(x, w, b, conv_param);
        let (out, relu) = Relu::forward(&a);
        (out, ConvReluCache { conv, relu })
    }

    pub fn backward(dout: &Tensor, cache: &ConvReluCache) -> (Tensor, Tensor, Tensor) {
        let da = Relu::backward(dout, &cache.relu);
        let grads = FastConv::backward(&da, &cache.conv);
        (grads.dx, grads.dw, grads.db)
    }
}

/// Convolution, ReLU, then max pooling.
pub struct ConvReluPool;

pub struct ConvReluPoolCache {
    conv: FastConvCache,
    relu: ReluCache,
    pool: FastPoolCache,
}

impl ConvReluPool {
    pub fn forward(
        x: &Tensor,
        w: &Tensor,
        b: &Tensor,
        conv_param: &ConvParam,
        pool_param: &PoolParam,
    ) -> (Tensor, ConvReluPoolCache) {
        let (a, conv) = FastConv::forward(x, w, b, conv_param);
        let (s, relu) = Relu::forward(&a);
        let (out, pool) = FastMaxPool::forward(&s, pool_param);
        (out, ConvReluPoolCache { conv, relu, pool })
    }

    pub fn backward(dout: &Tensor, cache: &ConvReluPoolCache) -> (Tensor, Tensor, Tensor) {
        let ds = FastMaxPool::backward(dout, &cache.pool);
        let da = Relu::backward(&ds.dx, &cache.relu);
        let grads = FastConv::backward(&da, &cache.conv);
        (grads.dx, grads.dw, grads.db)
    }
}

/// Linear transform, batch normalization, then ReLU.
pub struct LinearBatchNormRelu;

pub struct LinearBatchNormReluCache {
    linear: LinearCache,
    bn: BnCache,
    relu: ReluCache,
}

impl LinearBatchNormRelu {
    /// Returns the output, the composite cache, and the updated running
    /// statistics.
    pub fn forward(
        x: &Tensor,
        w: &Tensor,
        b: &Tensor,
        gamma: &Tensor,
        beta: &Tensor,
        bn_param: &BnParam,
        stats: &RunningStats,
    ) -> (Tensor, LinearBatchNormReluCache, RunningStats) {
        let (a, linear) = Linear::forward(x, w, b);
        let (a_bn, bn, stats) = BatchNorm::forward_train(&a, gamma, beta, bn_param, stats);
        let (out, relu) = Relu::forward(&a_bn);
        (out, LinearBatchNormReluCache { linear, bn, relu }, stats)
    }

    pub fn backward(
        dout: &Tensor,
        cache: &LinearBatchNormReluCache,
    ) -> (Tensor, Tensor, Tensor, Tensor, Tensor) {
        let da_bn = Relu::backward(dout, &cache.relu);
        let (da, dgamma, dbeta) = BatchNorm::backward(&da_bn, &cache.bn);
        let (dx, dw, db) = Linear::backward(&da, &cache.linear);
        (dx, dw, db, dgamma, dbeta)
    }
}

/// Convolution, spatial batch normalization, then ReLU.
pub struct ConvBatchNormRelu;

pub struct ConvBatchNormReluCache {
    conv: FastConvCache,
    bn: BnCache,
    relu: ReluCache,
}

impl ConvBatchNormRelu {
    pub fn forward(
        x: &Tensor,
        w: &Tensor,
        b: &Tensor,
        gamma: &Tensor,
        beta: &Tensor,
        conv_param: &ConvParam,
        bn_param: &BnParam,
        stats: &RunningStats,
    ) -> (Tensor, ConvBatchNormReluCache, RunningStats) {
        let (a, conv) = FastConv::forward(x, w, b, conv_param);
        let (an, bn, stats) = SpatialBatchNorm::forward_train(&a, gamma, beta, bn_param, stats);
        let (out, relu) = Relu::forward(&an);
        (out, ConvBatchNormReluCache { conv, bn, relu }, stats)
    }

    pub fn backward(
        dout: &Tensor,
        cache: &ConvBatchNormReluCache,
    ) -> (Tensor, Tensor, Tensor, Tensor, Tensor) {
        let dan = Relu::backward(dout, &cache.relu);
        let (da, dgamma, dbeta) = SpatialBatchNorm::backward(&dan, &cache.bn);
        let grads = FastConv::backward(&da, &cache.conv);
        (grads.dx, grads.dw, grads.db, dgamma, dbeta)
    }
}

/// Convolution, spatial batch normalization, ReLU, then max pooling.
pub struct ConvBatchNormReluPool;

pub struct ConvBatchNormReluPoolCache {
    conv: FastConvCache,
    bn: BnCache,
    relu: ReluCache,
    pool: FastPoolCache,
}

impl ConvBatchNormReluPool {
    pub fn forward(
        x: &Tensor,
        w: &Tensor,
        b: &Tensor,
        gamma: &Tensor,
        beta: &Tensor,
        conv_param: &ConvParam,
        bn_param: &BnParam,
        pool_param: &PoolParam,
        stats: &RunningStats,
    ) -> (Tensor, ConvBatchNormReluPoolCache, RunningStats) {
        let (a, conv) = FastConv::forward(x, w, b, conv_param);
        let (an, bn, stats) = SpatialBatchNorm::forward_train(&a, gamma, beta, bn_param, stats);
        let (s, relu) = Relu::forward(&an);
        let (out, pool) = FastMaxPool::forward(&s, pool_param);
        (
            out,
            ConvBatchNormReluPoolCache {
                conv,
                bn,
                relu,
                pool,
            },
            stats,
        )
    }

    pub fn backward(
        dout: &Tensor,
        cache: &ConvBatchNormReluPoolCache,
    ) -> (Tensor, Tensor, Tensor, Tensor, Tensor) {
        let ds = FastMaxPool::backward(dout, &cache.pool);
        let dan = Relu::backward(&ds.dx, &cache.relu);
        let (da, dgamma, dbeta) = SpatialBatchNorm::backward(&dan, &cache.bn);
        let grads = FastConv::backward(&da, &cache.conv);
        (grads.dx, grads.dw, grads.db, dgamma, dbeta)
    }
}
