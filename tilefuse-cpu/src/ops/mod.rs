//! Op trait implementations for [`CpuBackend`](crate::CpuBackend).

pub mod copy;
pub mod flags;
pub mod reduce;
