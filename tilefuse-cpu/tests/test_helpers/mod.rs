//! Shared helpers for CPU backend integration tests.
//!
//! Host reference GEMMs run in f64 over inputs already rounded through the
//! device dtype, so the comparison tolerance only has to cover output
//! rounding and summation order.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tilefuse::DType;
use tilefuse_cpu::buffer::{decode_row, encode_row};
use tilefuse_cpu::{CpuBuffer, CpuConfig, RankContext};

/// Config with a short flag timeout so a broken protocol fails fast.
pub fn test_config() -> CpuConfig {
    CpuConfig {
        flag_timeout_ms: Some(20_000),
        ..CpuConfig::default()
    }
}

/// Round `values` through `dtype` and back.
pub fn quantize(values: &[f32], dtype: DType) -> Vec<f32> {
    let mut bytes = vec![0u8; values.len() * dtype.size_in_bytes()];
    encode_row(values, dtype, &mut bytes);
    let mut out = vec![0.0; values.len()];
    decode_row(&bytes, dtype, &mut out);
    out
}

/// `rows x cols` uniform in [-0.5, 0.5], representable in `dtype`.
pub fn random_matrix(seed: u64, rows: usize, cols: usize, dtype: DType) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-0.5..0.5)).collect();
    quantize(&values, dtype)
}

/// Row-major `a (m x k) . b (k x n)` in f64.
pub fn matmul_ref(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f64> {
    let mut out = vec![0.0f64; m * n];
    for i in 0..m {
        for p in 0..k {
            let av = f64::from(a[i * k + p]);
            for j in 0..n {
                out[i * n + j] += av * f64::from(b[p * n + j]);
            }
        }
    }
    out
}

/// Element-wise `|actual - expected| <= tol * max(|expected|, 1)`.
pub fn assert_close(actual: &[f32], expected: &[f64], tol: f32, what: &str) {
    assert_eq!(actual.len(), expected.len(), "{what}: length mismatch");
    let tol = f64::from(tol);
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let err = (f64::from(a) - e).abs();
        assert!(
            err <= tol * e.abs().max(1.0),
            "{what}[{i}]: got {a}, expected {e} (err {err})"
        );
    }
}

/// Allocate on the rank's device and upload `data` as `dtype`.
pub fn upload(ctx: &RankContext<'_>, dtype: DType, data: &[f32]) -> CpuBuffer {
    let buf = ctx.alloc(data.len() * dtype.size_in_bytes());
    buf.upload_f32(dtype, data).expect("upload");
    buf
}

/// Upload an f32 scalar (scale tensor).
pub fn scalar(ctx: &RankContext<'_>, value: f32) -> CpuBuffer {
    upload(ctx, DType::F32, &[value])
}

/// Rows `[row0, row0 + rows)` of a row-major `_ x n` matrix.
pub fn rows_of<T: Copy>(values: &[T], n: usize, row0: usize, rows: usize) -> Vec<T> {
    values[row0 * n..(row0 + rows) * n].to_vec()
}

/// Columns `[col0, col0 + cols)` of a row-major `m x n` matrix.
pub fn cols_of(values: &[f32], m: usize, n: usize, col0: usize, cols: usize) -> Vec<f32> {
    (0..m)
        .flat_map(|i| values[i * n + col0..i * n + col0 + cols].iter().copied())
        .collect()
}
