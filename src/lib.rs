//! Convolutional network building blocks with hand-derived gradients.
//!
//! Reference implementations of the forward and backward passes of common
//! convolutional-network layers, written without an autograd engine: each
//! kernel derives its gradient by hand and is verified against numerical
//! differentiation.
//!
//! # Modules
//!
//! - `tensor`: flat dense tensor storage with a precision tag
//! - `layers`: naive kernels, fast GEMM-backed kernels, and sandwich
//!   compositions
//! - `init`: variance-scaled (Kaiming/Xavier) weight initialization
//! - `losses`: softmax cross-entropy
//! - `models`: the three-layer and deep convolutional networks
//! - `config`: JSON architecture configuration for the deep network
//! - `utils`: deterministic RNG, BLAS matrix multiply, gradient checking

extern crate blas_src;

pub mod config;
pub mod error;
pub mod init;
pub mod layers;
pub mod losses;
pub mod models;
pub mod tensor;
pub mod utils;

pub use error::{Error, Result};
pub use tensor::{Precision, Tensor};
