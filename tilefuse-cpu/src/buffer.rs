//! Peer-visible device memory.
//!
//! Every allocation is a shared array of 64-bit atomic words. Flag windows
//! address the words atomically through [`BarrierArray`]; tile data is
//! moved with plain byte copies through the same cells. The barrier
//! protocol guarantees a region is never written and read concurrently.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tilefuse::backend::{BufferView, DeviceBuffer, MatrixView};
use tilefuse::barrier::{BarrierArray, FlagWords};
use tilefuse::dtype::TensorDType;
use tilefuse::{DType, Error, Result};

use crate::CpuBackend;

/// A device allocation. Clones alias the same memory.
#[derive(Clone)]
pub struct CpuBuffer {
    words: Arc<Box<[AtomicU64]>>,
    len: usize,
    device: usize,
    ranks_per_node: usize,
    peer_access: bool,
}

impl std::fmt::Debug for CpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBuffer")
            .field("len", &self.len)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl DeviceBuffer for CpuBuffer {
    fn len_bytes(&self) -> usize {
        self.len
    }

    fn device(&self) -> usize {
        self.device
    }
}

impl CpuBuffer {
    /// Zeroed allocation of `len` bytes on `device`.
    pub fn zeroed(device: usize, len: usize) -> Self {
        let words: Box<[AtomicU64]> = (0..len.div_ceil(8)).map(|_| AtomicU64::new(0)).collect();
        Self {
            words: Arc::new(words),
            len,
            device,
            ranks_per_node: 1,
            peer_access: false,
        }
    }

    /// Make the allocation directly reachable from devices of the same
    /// node (`ranks_per_node` consecutive devices per node).
    #[must_use]
    pub fn peer_mapped(mut self, ranks_per_node: usize, peer_access: bool) -> Self {
        self.ranks_per_node = ranks_per_node.max(1);
        self.peer_access = peer_access;
        self
    }

    /// Whether a kernel on `device` can address this buffer.
    pub fn reachable_from(&self, device: usize) -> bool {
        device == self.device
            || (self.peer_access && device / self.ranks_per_node == self.device / self.ranks_per_node)
    }

    pub fn same_allocation(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }

    fn base(&self) -> *mut u8 {
        self.words.as_ptr().cast::<u8>().cast_mut()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(Error::DeviceFailure(format!(
                "access {offset}..{} out of bounds for {}-byte buffer on device {}",
                offset.saturating_add(len),
                self.len,
                self.device
            )));
        }
        Ok(())
    }

    /// Copy `len` bytes starting at `offset` out of the buffer.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: range checked above; the cells are interior-mutable.
        unsafe { std::ptr::copy(self.base().add(offset), out.as_mut_ptr(), len) };
        Ok(out)
    }

    /// Copy `bytes` into the buffer at `offset`.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        // SAFETY: range checked above; the cells are interior-mutable.
        unsafe { std::ptr::copy(bytes.as_ptr(), self.base().add(offset), bytes.len()) };
        Ok(())
    }

    pub fn fill_zero(&self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: range checked above.
        unsafe { std::ptr::write_bytes(self.base().add(offset), 0, len) };
        Ok(())
    }

    /// Copy `len` bytes between two (possibly identical) buffers.
    pub fn copy_from(&self, dst_offset: usize, src: &Self, src_offset: usize, len: usize) -> Result<()> {
        src.check_range(src_offset, len)?;
        self.check_range(dst_offset, len)?;
        // SAFETY: both ranges checked; `copy` tolerates overlap.
        unsafe { std::ptr::copy(src.base().add(src_offset), self.base().add(dst_offset), len) };
        Ok(())
    }

    /// `words` flag words starting at `byte_offset` as a barrier window.
    pub fn barrier_array(&self, byte_offset: usize, words: usize) -> Result<BarrierArray> {
        if byte_offset % 8 != 0 {
            return Err(Error::invalid(format!(
                "flag window at byte {byte_offset} is not 8-byte aligned"
            )));
        }
        let storage: Arc<dyn FlagWords> = self.words.clone();
        BarrierArray::new(storage, byte_offset / 8, words)
    }

    /// Atomically raise the f32 at `offset` to at least `value` (`value >= 0`).
    pub fn fetch_max_f32(&self, offset: usize, value: f32) -> Result<()> {
        self.check_range(offset, 4)?;
        if offset % 4 != 0 {
            return Err(Error::DeviceFailure(format!(
                "abs-max cell at byte {offset} is not 4-byte aligned"
            )));
        }
        // SAFETY: in range and aligned; AtomicU32 has the layout of u32.
        let cell = unsafe { &*self.base().add(offset).cast::<AtomicU32>() };
        // Non-negative floats order like their bit patterns.
        cell.fetch_max(value.abs().to_bits(), Ordering::AcqRel);
        Ok(())
    }

    /// Upload typed host data at the start of the buffer.
    pub fn upload<T: TensorDType>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Download `count` typed elements from the start of the buffer.
    pub fn download<T: TensorDType>(&self, count: usize) -> Result<Vec<T>> {
        let bytes = self.read_bytes(0, count * std::mem::size_of::<T>())?;
        Ok(bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Upload f32 host data converted to `dtype`.
    pub fn upload_f32(&self, dtype: DType, data: &[f32]) -> Result<()> {
        let mut bytes = vec![0u8; data.len() * dtype.size_in_bytes()];
        encode_row(data, dtype, &mut bytes);
        self.write_bytes(0, &bytes)
    }

    /// Download `count` elements of `dtype` widened to f32.
    pub fn download_f32(&self, dtype: DType, count: usize) -> Result<Vec<f32>> {
        let bytes = self.read_bytes(0, count * dtype.size_in_bytes())?;
        let mut out = vec![0.0; count];
        decode_row(&bytes, dtype, &mut out);
        Ok(out)
    }
}

// ---- Typed row access ----

fn decode<T: TensorDType>(bytes: &[u8], out: &mut [f32]) {
    for (o, chunk) in out.iter_mut().zip(bytes.chunks_exact(std::mem::size_of::<T>())) {
        *o = bytemuck::pod_read_unaligned::<T>(chunk).to_f32();
    }
}

fn encode<T: TensorDType>(values: &[f32], out: &mut [u8]) {
    for (v, chunk) in values.iter().zip(out.chunks_exact_mut(std::mem::size_of::<T>())) {
        chunk.copy_from_slice(bytemuck::bytes_of(&T::from_f32(*v)));
    }
}

/// Widen packed `dtype` elements to f32.
pub fn decode_row(bytes: &[u8], dtype: DType, out: &mut [f32]) {
    match dtype {
        DType::F32 => decode::<f32>(bytes, out),
        DType::F16 => decode::<half::f16>(bytes, out),
        DType::BF16 => decode::<half::bf16>(bytes, out),
        DType::F8E4M3 => decode::<tilefuse::F8E4M3>(bytes, out),
    }
}

/// Narrow f32 values into packed `dtype` elements.
pub fn encode_row(values: &[f32], dtype: DType, out: &mut [u8]) {
    match dtype {
        DType::F32 => encode::<f32>(values, out),
        DType::F16 => encode::<half::f16>(values, out),
        DType::BF16 => encode::<half::bf16>(values, out),
        DType::F8E4M3 => encode::<tilefuse::F8E4M3>(values, out),
    }
}

/// Load a matrix view as a dense row-major f32 array.
pub fn load_matrix(view: &MatrixView<CpuBackend>) -> Result<Vec<f32>> {
    let esz = view.dtype.size_in_bytes();
    let mut out = vec![0.0f32; view.rows * view.cols];
    for (r, row) in out.chunks_exact_mut(view.cols.max(1)).enumerate().take(view.rows) {
        let bytes = view.buffer.read_bytes(view.byte_offset(r, 0), view.cols * esz)?;
        decode_row(&bytes, view.dtype, row);
    }
    Ok(out)
}

/// Store a dense row-major f32 array into a matrix view.
pub fn store_matrix(view: &MatrixView<CpuBackend>, values: &[f32]) -> Result<()> {
    let esz = view.dtype.size_in_bytes();
    let mut bytes = vec![0u8; view.cols * esz];
    for (r, row) in values.chunks_exact(view.cols.max(1)).enumerate().take(view.rows) {
        encode_row(row, view.dtype, &mut bytes);
        view.buffer.write_bytes(view.byte_offset(r, 0), &bytes)?;
    }
    Ok(())
}

/// Rows of `view` packed back to back.
pub fn read_packed(view: &MatrixView<CpuBackend>) -> Result<Vec<u8>> {
    let row_bytes = view.cols * view.dtype.size_in_bytes();
    let mut out = Vec::with_capacity(view.rows * row_bytes);
    for r in 0..view.rows {
        out.extend_from_slice(&view.buffer.read_bytes(view.byte_offset(r, 0), row_bytes)?);
    }
    Ok(out)
}

/// Scatter packed rows into `view`.
pub fn write_packed(view: &MatrixView<CpuBackend>, bytes: &[u8]) -> Result<()> {
    let row_bytes = view.cols * view.dtype.size_in_bytes();
    if bytes.len() != view.rows * row_bytes {
        return Err(Error::DeviceFailure(format!(
            "{} bytes do not fill a {}x{} {} region",
            bytes.len(),
            view.rows,
            view.cols,
            view.dtype
        )));
    }
    for (r, row) in bytes.chunks_exact(row_bytes.max(1)).enumerate() {
        view.buffer.write_bytes(view.byte_offset(r, 0), row)?;
    }
    Ok(())
}

/// Read the f32 scalar at `view`, or `1.0` if absent.
pub fn load_scale(view: Option<&BufferView<CpuBackend>>) -> Result<f32> {
    match view {
        Some(v) => {
            let bytes = v.buffer.read_bytes(v.offset, 4)?;
            Ok(bytemuck::pod_read_unaligned::<f32>(&bytes))
        }
        None => Ok(1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilefuse::barrier::FlagState;

    #[test]
    fn test_upload_download_f16() {
        let buf = CpuBuffer::zeroed(0, 8);
        buf.upload_f32(DType::F16, &[1.0, -2.5, 0.25, 3.0]).unwrap();
        assert_eq!(buf.download_f32(DType::F16, 4).unwrap(), vec![1.0, -2.5, 0.25, 3.0]);
    }

    #[test]
    fn test_out_of_bounds_is_device_failure() {
        let buf = CpuBuffer::zeroed(0, 16);
        assert!(matches!(buf.read_bytes(8, 16), Err(Error::DeviceFailure(_))));
    }

    #[test]
    fn test_matrix_views_respect_leading_dimension() {
        let buf = CpuBuffer::zeroed(0, 4 * 4 * 4);
        let full = MatrixView::<CpuBackend>::new(buf.clone(), DType::F32, 4, 4);
        store_matrix(&full.sub(1, 2, 2, 2), &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let all = buf.download::<f32>(16).unwrap();
        assert_eq!(&all[4..8], &[0.0, 0.0, 1.0, 2.0]);
        assert_eq!(&all[8..12], &[0.0, 0.0, 3.0, 4.0]);
        assert_eq!(load_matrix(&full.sub(2, 1, 2, 2)).unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_barrier_window_shares_memory() {
        let buf = CpuBuffer::zeroed(0, 64);
        let a = buf.barrier_array(16, 4).unwrap();
        let b = buf.clone().barrier_array(16, 4).unwrap();
        a.produce(1, 3);
        assert_eq!(b.state(1), (FlagState::Produced, 3));
        assert!(buf.barrier_array(4, 1).is_err());
    }

    #[test]
    fn test_fetch_max_f32() {
        let buf = CpuBuffer::zeroed(0, 4);
        buf.fetch_max_f32(0, 2.0).unwrap();
        buf.fetch_max_f32(0, -3.0).unwrap();
        buf.fetch_max_f32(0, 1.0).unwrap();
        assert_eq!(buf.download::<f32>(1).unwrap(), vec![3.0]);
    }

    #[test]
    fn test_reachability() {
        let buf = CpuBuffer::zeroed(3, 8).peer_mapped(2, true);
        assert!(buf.reachable_from(2));
        assert!(!buf.reachable_from(1));
        let isolated = CpuBuffer::zeroed(3, 8).peer_mapped(2, false);
        assert!(!isolated.reachable_from(2));
        assert!(isolated.reachable_from(3));
    }
}
