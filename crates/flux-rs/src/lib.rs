//! Kernel generation and asynchronous execution runtime.
//!
//! Backends implement [`backend::Backend`]; everything else in this crate
//! (pointwise kernels, BLAS-extension operators, composites and the
//! recipe-backed multiply) is written once against that trait.

pub mod backend;
pub mod blasext;
pub mod config;
pub mod env;
pub mod error;
pub mod gemm;
pub mod generator;
pub mod kernel;
pub mod matrix;
pub mod pointwise;
pub mod profiling;
pub mod provider;
pub mod runtime;
pub mod template;

pub use backend::{Backend, StagingBuffer};
pub use blasext::{BlasTemplate, Norm, ReductionMethod};
pub use config::RuntimeConfig;
pub use error::{BackendError, BackendResult};
pub use gemm::{MulKernel, RecipeMultiply, RecipeRuntime};
pub use generator::{ArgKind, Intent, KernelArg, PointwiseSpec};
pub use kernel::{ArgType, ArgValue, ComputeKernel, Kernel, KernelArgs, LaunchConfig, RuntimeSlots};
pub use matrix::{DType, Matrix, MatrixTraits, View};
pub use pointwise::KernelOperands;
pub use runtime::Runtime;
pub use template::{KernelTemplate, TemplateArgs, TemplateContext};
