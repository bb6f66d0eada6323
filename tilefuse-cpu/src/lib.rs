//! Host-simulated device backend for tilefuse.
//!
//! Each rank is a "device" whose memory is a shared array of atomic words
//! and whose streams are worker threads draining an in-order queue. Kernels
//! run on the rayon pool. Devices on the same node can address each other's
//! buffers directly; devices on different nodes exchange data through an
//! in-process mailbox standing in for the collective library.
//!
//! Intended for testing the fused operators and for running them on
//! machines without accelerators. It is not optimised for throughput.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss
)]

pub mod buffer;
pub mod comm;
pub mod config;
pub mod kernel;
pub mod ops;
pub mod stream;
pub mod world;

use tilefuse::backend::Backend;

pub use buffer::CpuBuffer;
pub use comm::{CommHub, CpuComm};
pub use config::CpuConfig;
pub use kernel::{builtin_registry, CpuTileConfig, CpuTileGemm};
pub use stream::{CpuEvent, CpuStream};
pub use world::{CpuWorld, RankContext};

/// Marker type for the CPU backend.
///
/// All op trait impls are on this type.
#[derive(Clone, Copy, Debug)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Buffer = CpuBuffer;
    type Stream = CpuStream;
    type Event = CpuEvent;
    type Comm = CpuComm;
}
