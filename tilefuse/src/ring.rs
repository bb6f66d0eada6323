//! Ring reducer: sums the `world_size` partial slots of a reduce buffer
//! into one output chunk.
//!
//! The input holds one slot of `chunk_size` elements per rank. Step `s`
//! adds slot `(rank - s) mod W`, the slot the ring delivers at that step,
//! so every rank sums in the same rotating order it would receive in.

use tracing::trace;

use crate::backend::{CopyEngine, DeviceBuffer, MatrixView, MemoryOps, ReduceArgs, ReduceOps};
use crate::{DType, Error, Result};

/// Reducer block count used by [`ring_reduce`].
pub const RING_REDUCE_BLOCKS: usize = 12;

/// Slots 16-bit data are padded to.
const PAD_BYTES: usize = 16;

/// Slot order for `rank`: `(rank - s) mod W` for `s in 0..W`.
pub fn ring_order(rank: usize, world_size: usize) -> impl Iterator<Item = usize> {
    (0..world_size).map(move |s| (rank + world_size - s % world_size) % world_size)
}

/// Distance in elements between consecutive slots.
#[must_use]
pub fn slot_stride(chunk_size: usize, dtype: DType) -> usize {
    if dtype.is_16bit() {
        let bytes = (chunk_size * dtype.size_in_bytes()).next_multiple_of(PAD_BYTES);
        bytes / dtype.size_in_bytes()
    } else {
        chunk_size
    }
}

/// Split a chunk of `chunk_size` elements into a dense `rows x cols` body
/// with one row per reducer block, plus a tail of `chunk_size - rows * cols`
/// elements. Chunks shorter than `blocks` are all tail.
#[must_use]
pub fn block_layout(chunk_size: usize, blocks: usize) -> (usize, usize, usize) {
    let blocks = blocks.max(1);
    let cols = chunk_size / blocks;
    if cols == 0 {
        return (0, 0, chunk_size);
    }
    (blocks, cols, chunk_size - blocks * cols)
}

/// Enqueue the reduction of `input`'s `world_size` slots into `output`.
///
/// `W == 1` is a copy; `chunk_size == 0` enqueues nothing. For 16-bit
/// dtypes each slot is padded to a 16-byte boundary.
///
/// # Errors
/// Returns `InvalidConfiguration` for unsupported dtypes, a topology where
/// `nnodes` does not divide `world_size`, an out-of-range rank, or
/// undersized buffers.
#[allow(clippy::too_many_arguments)]
pub fn ring_reduce<B: MemoryOps + ReduceOps>(
    input: &B::Buffer,
    output: &B::Buffer,
    rank: usize,
    nnodes: usize,
    world_size: usize,
    chunk_size: usize,
    dtype: DType,
    stream: &B::Stream,
) -> Result<()> {
    if dtype.is_fp8() {
        return Err(Error::invalid(format!("ring_reduce does not support {dtype}")));
    }
    if world_size == 0 || nnodes == 0 || world_size % nnodes != 0 {
        return Err(Error::invalid(format!(
            "nnodes {nnodes} does not divide world_size {world_size}"
        )));
    }
    if rank >= world_size {
        return Err(Error::invalid(format!(
            "rank {rank} out of range for world_size {world_size}"
        )));
    }
    if chunk_size == 0 {
        return Ok(());
    }

    let esz = dtype.size_in_bytes();
    let stride = slot_stride(chunk_size, dtype);
    let needed_in = ((world_size - 1) * stride + chunk_size) * esz;
    if input.len_bytes() < needed_in {
        return Err(Error::invalid(format!(
            "ring_reduce input holds {} bytes, needs {needed_in}",
            input.len_bytes()
        )));
    }
    if output.len_bytes() < chunk_size * esz {
        return Err(Error::invalid(format!(
            "ring_reduce output holds {} bytes, needs {}",
            output.len_bytes(),
            chunk_size * esz
        )));
    }

    trace!(rank, world_size, chunk_size, %dtype, "ring_reduce");
    if world_size == 1 {
        let slot = MatrixView::<B>::at(input.clone(), 0, dtype, 1, chunk_size);
        let out = MatrixView::<B>::new(output.clone(), dtype, 1, chunk_size);
        return B::copy_2d(stream, &slot, &out, CopyEngine::MemcpyAsync);
    }

    let (rows, cols, tail) = block_layout(chunk_size, RING_REDUCE_BLOCKS);
    let mut pieces = Vec::with_capacity(2);
    if rows > 0 {
        pieces.push((0, rows, cols));
    }
    if tail > 0 {
        pieces.push((rows * cols, 1, tail));
    }
    for (start, rows, cols) in pieces {
        let slot = |i: usize| MatrixView::<B>::at(input.clone(), (i * stride + start) * esz, dtype, rows, cols);
        B::reduce(
            stream,
            ReduceArgs {
                sources: ring_order(rank, world_size).map(slot).collect(),
                output: MatrixView::at(output.clone(), start * esz, dtype, rows, cols),
                num_blocks: RING_REDUCE_BLOCKS,
                scale: None,
                abs_max: None,
            },
        )?;
    }
    Ok(())
}
