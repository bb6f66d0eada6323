//! MemoryOps: uploads, fills and 2-D copies.
//!
//! The three copy engines produce identical bytes; they differ in how the
//! work is carried out, mirroring the device: `P2p` requires both buffers
//! to be reachable from the stream's device, `MemcpyAsync` moves row by
//! row, `CopyKernel` splits rows across the thread pool.

use rayon::prelude::*;
use tilefuse::backend::{BufferView, CopyEngine, DeviceBuffer, MatrixView, MemoryOps, StreamOps};
use tilefuse::{Error, Result};

use crate::buffer::CpuBuffer;
use crate::CpuBackend;

fn copy_rows(src: &MatrixView<CpuBackend>, dst: &MatrixView<CpuBackend>, engine: CopyEngine) -> Result<()> {
    let row_bytes = src.cols * src.dtype.size_in_bytes();
    let copy_row = |r: usize| {
        dst.buffer
            .copy_from(dst.byte_offset(r, 0), &src.buffer, src.byte_offset(r, 0), row_bytes)
    };
    match engine {
        CopyEngine::P2p if src.ld == src.cols && dst.ld == dst.cols => dst.buffer.copy_from(
            dst.offset,
            &src.buffer,
            src.offset,
            src.rows * row_bytes,
        ),
        CopyEngine::P2p | CopyEngine::MemcpyAsync => (0..src.rows).try_for_each(copy_row),
        CopyEngine::CopyKernel => (0..src.rows).into_par_iter().try_for_each(copy_row),
    }
}

impl MemoryOps for CpuBackend {
    fn write_bytes(stream: &Self::Stream, dst: &BufferView<Self>, bytes: Vec<u8>) -> Result<()> {
        if dst.available() < bytes.len() {
            return Err(Error::invalid(format!(
                "write of {} bytes at offset {} overflows a {}-byte buffer",
                bytes.len(),
                dst.offset,
                dst.offset + dst.available()
            )));
        }
        let dst = dst.clone();
        stream.enqueue("write_bytes", move || dst.buffer.write_bytes(dst.offset, &bytes))
    }

    fn fill_zero(stream: &Self::Stream, dst: &BufferView<Self>, len: usize) -> Result<()> {
        if dst.available() < len {
            return Err(Error::invalid(format!(
                "fill of {len} bytes at offset {} overflows the buffer",
                dst.offset
            )));
        }
        let dst = dst.clone();
        stream.enqueue("fill_zero", move || dst.buffer.fill_zero(dst.offset, len))
    }

    fn copy_2d(
        stream: &Self::Stream,
        src: &MatrixView<Self>,
        dst: &MatrixView<Self>,
        engine: CopyEngine,
    ) -> Result<()> {
        if src.dtype != dst.dtype || src.rows != dst.rows || src.cols != dst.cols {
            return Err(Error::invalid(format!(
                "copy_2d between {}x{} {} and {}x{} {}",
                src.rows, src.cols, src.dtype, dst.rows, dst.cols, dst.dtype
            )));
        }
        src.check_fits("copy source")?;
        dst.check_fits("copy destination")?;
        let device = stream.device();
        if engine == CopyEngine::P2p
            && !(src.buffer.reachable_from(device) && dst.buffer.reachable_from(device))
        {
            return Err(Error::invalid(format!(
                "P2P copy on device {device} between devices {} and {} without peer access",
                src.buffer.device(),
                dst.buffer.device()
            )));
        }
        let (src, dst) = (src.clone(), dst.clone());
        stream.enqueue("copy_2d", move || copy_rows(&src, &dst, engine))
    }

    fn can_access_peer(device: usize, buffer: &CpuBuffer) -> bool {
        buffer.reachable_from(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tilefuse::DType;

    use crate::config::CpuConfig;
    use crate::stream::CpuStream;

    #[test]
    fn test_engines_agree() {
        let stream = CpuStream::new(0, Arc::new(CpuConfig::default())).unwrap();
        let src = CpuBuffer::zeroed(0, 6 * 4);
        src.upload::<f32>(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let src_view = MatrixView::<CpuBackend>::new(src, DType::F32, 2, 3).sub(0, 2, 1, 2);
        for engine in [CopyEngine::P2p, CopyEngine::MemcpyAsync, CopyEngine::CopyKernel] {
            let dst = CpuBuffer::zeroed(0, 4 * 4);
            let dst_view = MatrixView::<CpuBackend>::new(dst.clone(), DType::F32, 2, 2);
            CpuBackend::copy_2d(&stream, &src_view, &dst_view, engine).unwrap();
            stream.synchronize().unwrap();
            assert_eq!(dst.download::<f32>(4).unwrap(), vec![2.0, 3.0, 5.0, 6.0], "{engine:?}");
        }
    }

    #[test]
    fn test_p2p_requires_reachability() {
        let stream = CpuStream::new(0, Arc::new(CpuConfig::default())).unwrap();
        let local = CpuBuffer::zeroed(0, 16);
        let remote = CpuBuffer::zeroed(1, 16).peer_mapped(2, false);
        let a = MatrixView::<CpuBackend>::new(local, DType::F32, 1, 4);
        let b = MatrixView::<CpuBackend>::new(remote, DType::F32, 1, 4);
        assert!(CpuBackend::copy_2d(&stream, &a, &b, CopyEngine::P2p).is_err());
        assert!(CpuBackend::copy_2d(&stream, &a, &b, CopyEngine::MemcpyAsync).is_ok());
        stream.synchronize().unwrap();
    }
}
