//! Tilefuse: tile-level fusion of GEMM with collective communication.
//!
//! Two fused operators overlap a matrix multiply with data movement across
//! a tensor-parallel group:
//!
//! - [`GemmReduceScatter`]: every rank computes partial products of the full
//!   output and the partials are summed so rank `r` ends up owning row chunk
//!   `r`.
//! - [`AllGatherGemm`]: A is sharded along K; shards are gathered while the
//!   GEMM consumes them step by step.
//!
//! Both are generic over a device [`Backend`] and communicate tile readiness
//! through epoch-tagged flag words ([`BarrierArray`]). The CPU reference
//! backend lives in `tilefuse-cpu`.

#[allow(clippy::missing_errors_doc, clippy::doc_markdown)]
pub mod ag;
pub mod args;
#[allow(clippy::missing_errors_doc, clippy::doc_markdown)]
pub mod backend;
pub mod barrier;
pub mod config;
pub mod dtype;
pub mod error;
pub mod hparams;
#[allow(clippy::missing_errors_doc)]
pub mod kernel;
#[allow(clippy::missing_errors_doc)]
pub mod operator;
pub mod registry;
pub mod ring;
#[allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]
pub mod rs;
pub mod schedule;
pub mod topology;
pub mod workspace;

pub use ag::AllGatherGemm;
pub use args::{
    AllGatherArguments, AllGatherGemmArguments, AllGatherOptions, GemmReduceScatterArguments,
    LocalGemmArguments, ReduceScatterArguments, ReduceScatterOptions,
};
pub use backend::{
    Backend, BufferView, CollectiveBackend, CommOps, CopyEngine, DeviceBuffer, FlagOps,
    MatrixView, MemoryOps, ReduceArgs, ReduceOps, StreamOps,
};
pub use barrier::{BarrierArray, FlagState, LaunchEpoch};
pub use config::OperatorConfig;
pub use dtype::{DType, TensorDType, F8E4M3};
pub use error::{Error, Result};
pub use hparams::{ClusterShape, GemmSchedule, TileShape, UnifiedGemmHParams};
pub use kernel::{GemmKernel, KernelArguments};
pub use operator::{DefaultGemmOperator, GemmArguments, GemmOperator, LocalGemmImpl};
pub use registry::{GemmMeta, KernelFlavor, OpRegistry};
pub use ring::ring_reduce;
pub use rs::GemmReduceScatter;
pub use schedule::{build_program, flag_words, GemmKind, GemmShape, TileDesc, TileProgram};
pub use topology::Topology;
