//! Layer kernels: naive reference implementations, fast GEMM-backed
//! variants, and sandwich compositions.
//!
//! Every kernel follows the same contract: `forward` returns a freshly
//! allocated output together with a layer-specific cache struct, and the
//! matching `backward` consumes that cache (and only that cache) to produce
//! gradients. Caches are never shared between calls.

pub mod batchnorm;
pub mod conv;
pub mod fast;
pub mod linear;
pub mod pool;
pub mod relu;
pub mod sandwich;
pub mod spatial_batchnorm;

pub use batchnorm::{BatchNorm, BnMode, BnParam, RunningStats};
pub use conv::{Conv, ConvParam};
pub use fast::{FastConv, FastMaxPool, GradOutcome};
pub use linear::Linear;
pub use pool::{MaxPool, PoolParam};
pub use relu::Relu;
pub use spatial_batchnorm::SpatialBatchNorm;
