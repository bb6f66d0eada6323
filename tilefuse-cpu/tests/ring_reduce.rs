//! Standalone ring reducer.

mod test_helpers;

use std::sync::Arc;

use tilefuse::ring::slot_stride;
use tilefuse::{ring_reduce, DType, Error, StreamOps};
use tilefuse_cpu::{CpuBackend, CpuBuffer, CpuConfig, CpuStream};

use test_helpers::random_matrix;

fn stream() -> CpuStream {
    CpuStream::new(0, Arc::new(CpuConfig::default())).unwrap()
}

/// Reduce `world_size` random slots of `chunk` elements as `rank`.
fn reduce(rank: usize, world_size: usize, chunk: usize, dtype: DType) -> (Vec<Vec<f32>>, Vec<f32>) {
    let stride = slot_stride(chunk, dtype);
    let esz = dtype.size_in_bytes();
    let slots: Vec<Vec<f32>> = (0..world_size)
        .map(|i| random_matrix(40 + i as u64, 1, chunk, dtype))
        .collect();
    let input = CpuBuffer::zeroed(0, ((world_size - 1) * stride + chunk) * esz);
    for (i, slot) in slots.iter().enumerate() {
        let mut bytes = vec![0u8; chunk * esz];
        tilefuse_cpu::buffer::encode_row(slot, dtype, &mut bytes);
        input.write_bytes(i * stride * esz, &bytes).unwrap();
    }
    let output = CpuBuffer::zeroed(0, chunk * esz);
    let s = stream();
    ring_reduce::<CpuBackend>(&input, &output, rank, 1, world_size, chunk, dtype, &s).unwrap();
    s.synchronize().unwrap();
    (slots, output.download_f32(dtype, chunk).unwrap())
}

#[test]
fn four_ranks_f32_within_one_ulp() {
    for rank in 0..4 {
        let (slots, out) = reduce(rank, 4, 1024, DType::F32);
        for (j, &got) in out.iter().enumerate() {
            let exact: f64 = slots.iter().map(|s| f64::from(s[j])).sum();
            let ulp = f64::from(f32::EPSILON) * exact.abs().max(f64::from(f32::MIN_POSITIVE));
            assert!((f64::from(got) - exact).abs() <= ulp, "rank {rank} [{j}]: {got} vs {exact}");
        }
    }
}

#[test]
fn padded_half_slots() {
    let (slots, out) = reduce(1, 3, 13, DType::F16);
    for (j, &got) in out.iter().enumerate() {
        let exact: f32 = slots.iter().map(|s| s[j]).sum();
        assert!((got - exact).abs() <= 1e-2 * exact.abs().max(1.0), "[{j}]: {got} vs {exact}");
    }
}

#[test]
fn body_and_tail_pieces_cover_the_chunk() {
    // 1000 = 12 rows of 83 plus a 4-element tail; 5 is tail only.
    for chunk in [1000, 5, 24] {
        let (slots, out) = reduce(2, 3, chunk, DType::F32);
        assert_eq!(out.len(), chunk);
        for (j, &got) in out.iter().enumerate() {
            let exact: f32 = slots.iter().map(|s| s[j]).sum();
            assert!((got - exact).abs() <= 1e-5 * exact.abs().max(1.0), "chunk {chunk} [{j}]: {got} vs {exact}");
        }
    }
}

#[test]
fn single_rank_is_a_copy() {
    let (slots, out) = reduce(0, 1, 100, DType::BF16);
    assert_eq!(out, slots[0]);
}

#[test]
fn empty_chunk_is_a_no_op() {
    let s = stream();
    let buf = CpuBuffer::zeroed(0, 0);
    ring_reduce::<CpuBackend>(&buf, &buf, 0, 1, 2, 0, DType::F32, &s).unwrap();
    s.synchronize().unwrap();
}

#[test]
fn rejects_bad_topology_and_dtype() {
    let s = stream();
    let buf = CpuBuffer::zeroed(0, 1 << 12);
    let err = ring_reduce::<CpuBackend>(&buf, &buf, 0, 3, 4, 16, DType::F32, &s).unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)));
    let err = ring_reduce::<CpuBackend>(&buf, &buf, 0, 1, 4, 16, DType::F8E4M3, &s).unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)));
    let err = ring_reduce::<CpuBackend>(&buf, &buf, 4, 1, 4, 16, DType::F32, &s).unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)));
}
