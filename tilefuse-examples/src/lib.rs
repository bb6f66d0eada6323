//! Shared plumbing for the tilefuse example binaries.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tilefuse::DType;
use tilefuse_cpu::buffer::{decode_row, encode_row};
use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// `TILEFUSE_LOG_FORMAT=json` switches to JSON lines.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TILEFUSE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    }
}

/// `len` values uniform in [-0.5, 0.5], rounded through `dtype`.
pub fn random_values(seed: u64, len: usize, dtype: DType) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..len).map(|_| rng.gen_range(-0.5..0.5)).collect();
    let mut bytes = vec![0u8; len * dtype.size_in_bytes()];
    encode_row(&values, dtype, &mut bytes);
    let mut out = vec![0.0f32; len];
    decode_row(&bytes, dtype, &mut out);
    out
}

/// Row-major `a (m x k) . b (k x n)` accumulated into `out` in f64.
pub fn matmul_accumulate(a: &[f32], b: &[f32], m: usize, n: usize, k: usize, out: &mut [f64]) {
    for i in 0..m {
        for p in 0..k {
            let av = f64::from(a[i * k + p]);
            for j in 0..n {
                out[i * n + j] += av * f64::from(b[p * n + j]);
            }
        }
    }
}

/// Largest `|got - want| / max(|want|, 1)`.
pub fn max_rel_err<'a>(pairs: impl IntoIterator<Item = (&'a f32, &'a f64)>) -> f64 {
    pairs
        .into_iter()
        .map(|(&got, &want)| (f64::from(got) - want).abs() / want.abs().max(1.0))
        .fold(0.0, f64::max)
}
