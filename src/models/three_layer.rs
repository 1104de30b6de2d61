//! Fixed-depth three-layer convolutional network.
//!
//! Architecture: `conv - relu - 2x2 max pool - linear - relu - linear -
//! softmax`. The network operates on minibatches of shape (N, C, H, W).

use crate::error::Result;
use crate::layers::conv::ConvParam;
use crate::layers::linear::Linear;
use crate::layers::pool::PoolParam;
use crate::layers::relu::Relu;
use crate::layers::sandwich::ConvReluPool;
use crate::losses::softmax_loss;
use crate::tensor::{Precision, Tensor};
use crate::utils::SimpleRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Gradients of every learnable parameter, shapes matching the parameters.
pub struct ThreeLayerGrads {
    pub w1: Tensor,
    pub b1: Tensor,
    pub w2: Tensor,
    pub b2: Tensor,
    pub w3: Tensor,
    pub b3: Tensor,
}

impl ThreeLayerGrads {
    /// Canonical (name, tensor) view, one entry per learnable parameter.
    pub fn named(&self) -> Vec<(&'static str, &Tensor)> {
        vec![
            ("W1", &self.w1),
            ("b1", &self.b1),
            ("W2", &self.w2),
            ("b2", &self.b2),
            ("W3", &self.w3),
            ("b3", &self.b3),
        ]
    }
}

#[derive(Serialize, Deserialize)]
struct ThreeLayerCheckpoint {
    reg: f64,
    precision: Precision,
    w1: Tensor,
    b1: Tensor,
    w2: Tensor,
    b2: Tensor,
    w3: Tensor,
    b3: Tensor,
}

/// Three-layer convolutional network with randomly initialized weights.
///
/// The convolution preserves the spatial size (stride 1, pad chosen from the
/// filter size) and the pool halves it, so the first linear layer sees
/// `num_filters * (H/2) * (W/2)` features.
#[derive(Debug)]
pub struct ThreeLayerConvNet {
    w1: Tensor,
    b1: Tensor,
    w2: Tensor,
    b2: Tensor,
    w3: Tensor,
    b3: Tensor,
    reg: f64,
    precision: Precision,
}

impl ThreeLayerConvNet {
    /// Initialize a new network.
    ///
    /// # Arguments
    ///
    /// * `input_dims` - (C, H, W) of one input sample
    /// * `num_filters` - filters in the convolutional layer
    /// * `filter_size` - square filter height/width
    /// * `hidden_dim` - units in the fully connected hidden layer
    /// * `num_classes` - scores produced by the final linear layer
    /// * `weight_scale` - standard deviation of the random weights
    /// * `reg` - L2 regularization strength
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_dims: (usize, usize, usize),
        num_filters: usize,
        filter_size: usize,
        hidden_dim: usize,
        num_classes: usize,
        weight_scale: f64,
        reg: f64,
        precision: Precision,
        seed: u64,
    ) -> Self {
        let (c, h, w) = input_dims;
        assert!(num_filters > 0 && hidden_dim > 0 && num_classes > 0);
        let mut rng = SimpleRng::new(seed);

        let scaled = |shape: &[usize], rng: &mut SimpleRng| {
            let len: usize = shape.iter().product();
            let data = (0..len).map(|_| weight_scale * rng.next_gaussian()).collect();
            Tensor::from_vec(shape, data, precision)
        };

        let w1 = scaled(&[num_filters, c, filter_size, filter_size], &mut rng);
        let pool_output = num_filters * (h / 2) * (w / 2);
        let w2 = scaled(&[pool_output, hidden_dim], &mut rng);
        let w3 = scaled(&[hidden_dim, num_classes], &mut rng);

        Self {
            w1,
            b1: Tensor::zeros(&[num_filters], precision),
            w2,
            b2: Tensor::zeros(&[hidden_dim], precision),
            w3,
            b3: Tensor::zeros(&[num_classes], precision),
            reg,
            precision,
        }
    }

    pub fn reg(&self) -> f64 {
        self.reg
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Canonical (name, tensor) view of the learnable parameters.
    pub fn named_parameters(&self) -> Vec<(&'static str, &Tensor)> {
        vec![
            ("W1", &self.w1),
            ("b1", &self.b1),
            ("W2", &self.w2),
            ("b2", &self.b2),
            ("W3", &self.w3),
            ("b3", &self.b3),
        ]
    }

    /// Mutable view of the learnable parameters, for the external optimizer
    /// to apply updates between training steps.
    pub fn named_parameters_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        vec![
            ("W1", &mut self.w1),
            ("b1", &mut self.b1),
            ("W2", &mut self.w2),
            ("b2", &mut self.b2),
            ("W3", &mut self.w3),
            ("b3", &mut self.b3),
        ]
    }

    fn conv_param(&self) -> ConvParam {
        // Preserve the spatial size: stride 1, pad (filter_size - 1) / 2.
        ConvParam {
            stride: 1,
            pad: (self.w1.shape()[2] - 1) / 2,
        }
    }

    /// Class scores for a batch; pure inference, no cache retained.
    pub fn predict(&self, x: &Tensor) -> Tensor {
        let (cout, _) =
            ConvReluPool::forward(x, &self.w1, &self.b1, &self.conv_param(), &PoolParam::halving());
        let (a, _) = Linear::forward(&cout, &self.w2, &self.b2);
        let (h, _) = Relu::forward(&a);
        let (scores, _) = Linear::forward(&h, &self.w3, &self.b3);
        scores
    }

    /// Loss and gradients for a labeled minibatch.
    ///
    /// Data loss comes from the softmax collaborator; the L2 term
    /// `0.5 * reg * sum(W^2)` covers every weight matrix and never the
    /// biases, and `reg * W` is added to each weight gradient to match.
    pub fn loss(&self, x: &Tensor, y: &[usize]) -> (f64, ThreeLayerGrads) {
        let (cout, conv_cache) =
            ConvReluPool::forward(x, &self.w1, &self.b1, &self.conv_param(), &PoolParam::halving());
        let (a, fc_cache) = Linear::forward(&cout, &self.w2, &self.b2);
        let (h, relu_cache) = Relu::forward(&a);
        let (scores, out_cache) = Linear::forward(&h, &self.w3, &self.b3);

        let (mut loss, dscores) = softmax_loss(&scores, y);
        loss += 0.5
            * self.reg
            * (self.w1.sum_squares() + self.w2.sum_squares() + self.w3.sum_squares());

        let (dh, mut dw3, db3) = Linear::backward(&dscores, &out_cache);
        let da = Relu::backward(&dh, &relu_cache);
        let (dcout, mut dw2, db2) = Linear::backward(&da, &fc_cache);
        let (_, mut dw1, db1) = ConvReluPool::backward(&dcout, &conv_cache);

        for (dw, w) in [
            (&mut dw1, &self.w1),
            (&mut dw2, &self.w2),
            (&mut dw3, &self.w3),
        ] {
            for (g, p) in dw.data_mut().iter_mut().zip(w.data().iter()) {
                *g += self.reg * p;
            }
        }

        (
            loss,
            ThreeLayerGrads {
                w1: dw1,
                b1: db1,
                w2: dw2,
                b2: db2,
                w3: dw3,
                b3: db3,
            },
        )
    }

    /// Serialize the network state to a JSON checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        let checkpoint = ThreeLayerCheckpoint {
            reg: self.reg,
            precision: self.precision,
            w1: self.w1.clone(),
            b1: self.b1.clone(),
            w2: self.w2.clone(),
            b2: self.b2.clone(),
            w3: self.w3.clone(),
            b3: self.b3.clone(),
        };
        fs::write(path, serde_json::to_string(&checkpoint)?)?;
        Ok(())
    }

    /// Restore a network from a checkpoint written by [`Self::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let checkpoint: ThreeLayerCheckpoint = serde_json::from_str(&fs::read_to_string(path)?)?;
        let p = checkpoint.precision;
        Ok(Self {
            w1: checkpoint.w1.to_precision(p),
            b1: checkpoint.b1.to_precision(p),
            w2: checkpoint.w2.to_precision(p),
            b2: checkpoint.b2.to_precision(p),
            w3: checkpoint.w3.to_precision(p),
            b3: checkpoint.b3.to_precision(p),
            reg: checkpoint.reg,
            precision: p,
        })
    }
}
