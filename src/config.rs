//! Network architecture configuration via JSON files.
//!
//! A [`DeepNetConfig`] describes a [`DeepConvNet`] so architectures can be
//! experimented with without code changes:
//!
//! ```json
//! {
//!   "input_dims": [3, 32, 32],
//!   "num_filters": [32, 32, 64],
//!   "max_pools": [0, 2],
//!   "batchnorm": true,
//!   "num_classes": 10,
//!   "weight_scale": "kaiming",
//!   "reg": 1e-5,
//!   "precision": "single"
//! }
//! ```

use crate::error::{Error, Result};
use crate::models::deep::{DeepConvNet, WeightScale};
use crate::tensor::Precision;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Weight initialization as written in a config file: either a numeric scale
/// or the string "kaiming".
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WeightScaleConfig {
    Scale(f64),
    Named(String),
}

impl WeightScaleConfig {
    fn resolve(&self) -> Result<WeightScale> {
        match self {
            WeightScaleConfig::Scale(s) => Ok(WeightScale::Constant(*s)),
            WeightScaleConfig::Named(name) if name == "kaiming" => Ok(WeightScale::Kaiming),
            WeightScaleConfig::Named(name) => Err(Error::InvalidConfig {
                field: "weight_scale",
                reason: format!("unknown initializer \"{}\"", name),
            }),
        }
    }
}

fn default_weight_scale() -> WeightScaleConfig {
    WeightScaleConfig::Scale(1e-3)
}

fn default_precision() -> String {
    "double".to_string()
}

/// Configuration of a deep convolutional network.
#[derive(Debug, Clone, Deserialize)]
pub struct DeepNetConfig {
    /// (C, H, W) of one input sample.
    pub input_dims: [usize; 3],
    /// Convolutional filters per macro layer.
    pub num_filters: Vec<usize>,
    /// Zero-based macro-layer indices followed by a max pool.
    #[serde(default)]
    pub max_pools: Vec<usize>,
    /// Whether each macro layer carries batch normalization.
    #[serde(default)]
    pub batchnorm: bool,
    pub num_classes: usize,
    #[serde(default = "default_weight_scale")]
    pub weight_scale: WeightScaleConfig,
    #[serde(default)]
    pub reg: f64,
    /// "single" or "double".
    #[serde(default = "default_precision")]
    pub precision: String,
}

impl DeepNetConfig {
    /// Validate the raw configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.input_dims.iter().any(|&d| d == 0) {
            return Err(Error::InvalidConfig {
                field: "input_dims",
                reason: format!("dimensions must be positive, got {:?}", self.input_dims),
            });
        }
        if self.num_filters.is_empty() {
            return Err(Error::EmptyFilterList);
        }
        if self.num_filters.iter().any(|&f| f == 0) {
            return Err(Error::InvalidConfig {
                field: "num_filters",
                reason: "filter counts must be positive".to_string(),
            });
        }
        for &index in &self.max_pools {
            if index >= self.num_filters.len() {
                return Err(Error::PoolIndexOutOfRange {
                    index,
                    layers: self.num_filters.len(),
                });
            }
        }
        if self.num_classes == 0 {
            return Err(Error::InvalidConfig {
                field: "num_classes",
                reason: "must be positive".to_string(),
            });
        }
        self.weight_scale.resolve()?;
        self.precision.parse::<Precision>()?;
        Ok(())
    }
}

/// Load and validate a configuration from a JSON file.
pub fn load_config(path: &Path) -> Result<DeepNetConfig> {
    let config: DeepNetConfig = serde_json::from_str(&fs::read_to_string(path)?)?;
    config.validate()?;
    Ok(config)
}

/// Build a [`DeepConvNet`] from a validated configuration.
pub fn build_deep_net(config: &DeepNetConfig, seed: u64) -> Result<DeepConvNet> {
    config.validate()?;
    DeepConvNet::new(
        (
            config.input_dims[0],
            config.input_dims[1],
            config.input_dims[2],
        ),
        &config.num_filters,
        &config.max_pools,
        config.batchnorm,
        config.num_classes,
        config.weight_scale.resolve()?,
        config.reg,
        config.precision.parse()?,
        seed,
    )
}
