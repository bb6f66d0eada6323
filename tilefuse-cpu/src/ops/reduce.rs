//! ReduceOps: block-parallel elementwise sums.
//!
//! Rows are split into at most `num_blocks` contiguous blocks executed on
//! the thread pool. Each element is accumulated in f64 in source order
//! and rounded once to the output dtype.

use rayon::prelude::*;
use tilefuse::backend::{MatrixView, ReduceArgs, ReduceOps};
use tilefuse::{Error, Result};

use crate::buffer::{decode_row, encode_row, load_scale};
use crate::stream::CpuStream;
use crate::CpuBackend;

#[allow(clippy::cast_possible_truncation)]
fn reduce_block(args: &ReduceArgs<CpuBackend>, rows: std::ops::Range<usize>, scale: f32) -> Result<f32> {
    let out = &args.output;
    let cols = out.cols;
    let mut acc = vec![0.0f64; cols];
    let mut row = vec![0.0f32; cols];
    let mut bytes = vec![0u8; cols * out.dtype.size_in_bytes()];
    let mut block_max = 0.0f32;

    for r in rows {
        acc.fill(0.0);
        for src in &args.sources {
            let raw = src
                .buffer
                .read_bytes(src.byte_offset(r, 0), cols * src.dtype.size_in_bytes())?;
            decode_row(&raw, src.dtype, &mut row);
            for (a, v) in acc.iter_mut().zip(&row) {
                *a += f64::from(*v);
            }
        }
        for (o, a) in row.iter_mut().zip(&acc) {
            block_max = block_max.max((*a as f32).abs());
            *o = (*a * f64::from(scale)) as f32;
        }
        encode_row(&row, out.dtype, &mut bytes);
        out.buffer.write_bytes(out.byte_offset(r, 0), &bytes)?;
    }
    Ok(block_max)
}

fn run_reduce(args: &ReduceArgs<CpuBackend>) -> Result<()> {
    let scale = load_scale(args.scale.as_ref())?;
    let rows = args.output.rows;
    let blocks = args.num_blocks.clamp(1, rows.max(1));
    let rows_per_block = rows.div_ceil(blocks).max(1);

    let max = (0..blocks)
        .into_par_iter()
        .map(|b| {
            let lo = (b * rows_per_block).min(rows);
            let hi = (lo + rows_per_block).min(rows);
            reduce_block(args, lo..hi, scale)
        })
        .try_reduce(|| 0.0, |a, b| Ok(a.max(b)))?;

    if let Some(cell) = &args.abs_max {
        cell.buffer.fetch_max_f32(cell.offset, max)?;
    }
    Ok(())
}

fn check_source(src: &MatrixView<CpuBackend>, out: &MatrixView<CpuBackend>) -> Result<()> {
    if src.rows != out.rows || src.cols != out.cols {
        return Err(Error::invalid(format!(
            "reduce source {}x{} does not match output {}x{}",
            src.rows, src.cols, out.rows, out.cols
        )));
    }
    src.check_fits("reduce source")
}

impl ReduceOps for CpuBackend {
    fn reduce(stream: &CpuStream, args: ReduceArgs<Self>) -> Result<()> {
        if args.sources.is_empty() {
            return Err(Error::invalid("reduce needs at least one source"));
        }
        if args.output.dtype.is_fp8() {
            return Err(Error::invalid("reduce cannot write fp8 output"));
        }
        args.output.check_fits("reduce output")?;
        for src in &args.sources {
            check_source(src, &args.output)?;
        }
        stream.enqueue("reduce", move || run_reduce(&args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tilefuse::backend::{BufferView, StreamOps};
    use tilefuse::DType;

    use crate::buffer::CpuBuffer;
    use crate::config::CpuConfig;

    #[test]
    fn test_reduce_with_scale_and_abs_max() {
        let stream = CpuStream::new(0, Arc::new(CpuConfig::default())).unwrap();
        let rows = 5;
        let cols = 3;
        let sources: Vec<MatrixView<CpuBackend>> = (0..3)
            .map(|i| {
                let buf = CpuBuffer::zeroed(0, rows * cols * 4);
                let data: Vec<f32> = (0..rows * cols).map(|j| (i * 10 + j) as f32).collect();
                buf.upload(&data).unwrap();
                MatrixView::new(buf, DType::F32, rows, cols)
            })
            .collect();
        let out = CpuBuffer::zeroed(0, rows * cols * 4);
        let scale = CpuBuffer::zeroed(0, 4);
        scale.upload(&[0.5f32]).unwrap();
        let abs_max = CpuBuffer::zeroed(0, 4);

        CpuBackend::reduce(
            &stream,
            ReduceArgs {
                sources,
                output: MatrixView::new(out.clone(), DType::F32, rows, cols),
                num_blocks: 2,
                scale: Some(BufferView::new(scale)),
                abs_max: Some(BufferView::new(abs_max.clone())),
            },
        )
        .unwrap();
        stream.synchronize().unwrap();

        let got = out.download::<f32>(rows * cols).unwrap();
        for (j, v) in got.iter().enumerate() {
            assert_eq!(*v, (3 * j + 30) as f32 * 0.5);
        }
        assert_eq!(abs_max.download::<f32>(1).unwrap()[0], (3 * 14 + 30) as f32);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let stream = CpuStream::new(0, Arc::new(CpuConfig::default())).unwrap();
        let a = MatrixView::<CpuBackend>::new(CpuBuffer::zeroed(0, 16), DType::F32, 2, 2);
        let b = MatrixView::<CpuBackend>::new(CpuBuffer::zeroed(0, 16), DType::F32, 1, 4);
        let err = CpuBackend::reduce(
            &stream,
            ReduceArgs {
                sources: vec![a],
                output: b,
                num_blocks: 1,
                scale: None,
                abs_max: None,
            },
        );
        assert!(err.is_err());
    }
}
