//! Network assemblies built from sandwich layers.

pub mod deep;
pub mod three_layer;

pub use deep::{DeepConvNet, DeepGrads, MacroLayerParams, WeightScale};
pub use three_layer::{ThreeLayerConvNet, ThreeLayerGrads};
