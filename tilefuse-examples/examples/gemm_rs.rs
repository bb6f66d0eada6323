//! GEMM + reduce-scatter on a simulated multi-rank world.
//!
//! Every rank multiplies its own random A and B; afterwards rank r holds
//! row chunk r of the sum. The result is checked against a host
//! reference and a JSON summary is printed.
//!
//! Usage:
//!   cargo run --example gemm_rs -- --world-size 4 -m 1024 -n 512 -k 256
//!   # push mode, two nodes, config from a file:
//!   cargo run --example gemm_rs -- --world-size 4 --nnodes 2 --config rs.json
//!
//! Set `RUST_LOG=tilefuse=debug` for per-launch logs and
//! `TILEFUSE_LOG_FORMAT=json` for machine-readable output.

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use tracing::info;

use tilefuse::args::GemmReduceScatterArguments;
use tilefuse::{flag_words, DType, GemmKind, GemmReduceScatter, GemmShape, KernelFlavor, OperatorConfig, Result, StreamOps};
use tilefuse_cpu::{builtin_registry, CpuConfig, CpuWorld};
use tilefuse_examples::{init_logging, matmul_accumulate, max_rel_err, random_values};

/// Fused GEMM + reduce-scatter on simulated devices
#[derive(Parser)]
#[command(name = "gemm_rs")]
struct Cli {
    /// Number of simulated devices
    #[arg(long, default_value_t = 4)]
    world_size: usize,

    /// Number of simulated nodes
    #[arg(long, default_value_t = 1)]
    nnodes: usize,

    #[arg(short, default_value_t = 1024)]
    m: usize,

    #[arg(short, default_value_t = 512)]
    n: usize,

    #[arg(short, default_value_t = 256)]
    k: usize,

    /// Input and output dtype: f32, f16 or bf16
    #[arg(long, default_value = "f16")]
    dtype: DType,

    /// Use legacy (non-PDL) kernels
    #[arg(long)]
    legacy: bool,

    /// Operator config JSON; `TILEFUSE_*` variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Timed launches after one warmup
    #[arg(long, default_value_t = 5)]
    iters: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => OperatorConfig::from_file(path)?,
        None => OperatorConfig::default(),
    };
    config.apply_env_overrides()?;
    let mut options = config.reduce_scatter;
    options.sub_world_size = cli.world_size;

    let shape = GemmShape::new(cli.m, cli.n, cli.k);
    let dt = cli.dtype;
    let flavor = if cli.legacy {
        KernelFlavor::Legacy
    } else {
        KernelFlavor::Universal
    };
    let registry = builtin_registry()?;
    let world = CpuWorld::with_config(cli.world_size, cli.nnodes, CpuConfig::from_env()?)?;
    let s = cli.world_size;
    let chunk = cli.m / s.max(1);
    info!(?shape, %dt, world_size = s, nnodes = cli.nnodes, ?options, "gemm_rs");

    let results = world.run(|ctx| {
        let rank = ctx.rank();
        let mut op = GemmReduceScatter::from_registry(&registry, dt, dt, flavor, None)?;
        let tile = op.get_runtime_gemm_hparams().tile_shape;
        let words = flag_words(GemmKind::ReduceScatter, shape, tile, s, options.per_tile_flags);

        let a = random_values(cli.seed + 2 * rank as u64, cli.m * cli.k, dt);
        let b = random_values(cli.seed + 2 * rank as u64 + 1, cli.k * cli.n, dt);
        let input = ctx.alloc(a.len() * dt.size_in_bytes());
        input.upload_f32(dt, &a)?;
        let weight = ctx.alloc(b.len() * dt.size_in_bytes());
        weight.upload_f32(dt, &b)?;

        let scatter = ctx.alloc_shared(chunk * cli.n * dt.size_in_bytes())?;
        let mut args = GemmReduceScatterArguments::new(shape, rank, s, cli.nnodes, dt, input, weight);
        args.output_scatter_ptrs = scatter.clone();
        args.reduce_buffer_ptrs = ctx.alloc_shared(cli.m * cli.n * dt.size_in_bytes())?;
        args.barrier_ptrs = Some(ctx.alloc_shared(words * 8)?);
        args.reduce_scatter_args.options = options.clone();
        args.reduce_scatter_args.opaque = Some(ctx.comm());
        args.reduce_scatter_args.rs_stream = Some(ctx.new_stream()?);

        let workspace = ctx.alloc(op.get_workspace_size(&args)?);
        let mut elapsed = 0.0;
        for iter in 0..=cli.iters {
            ctx.host_barrier()?;
            let start = Instant::now();
            op.run(&args, &workspace, ctx.stream(), flavor == KernelFlavor::Universal)?;
            ctx.stream().synchronize()?;
            if iter > 0 {
                elapsed += start.elapsed().as_secs_f64();
            }
        }
        let out = scatter[rank].download_f32(dt, chunk * cli.n)?;
        Ok((out, elapsed / cli.iters.max(1) as f64))
    })?;

    let mut sum = vec![0.0f64; cli.m * cli.n];
    for rank in 0..s {
        let a = random_values(cli.seed + 2 * rank as u64, cli.m * cli.k, dt);
        let b = random_values(cli.seed + 2 * rank as u64 + 1, cli.k * cli.n, dt);
        matmul_accumulate(&a, &b, cli.m, cli.n, cli.k, &mut sum);
    }
    let max_err = max_rel_err(results.iter().enumerate().flat_map(|(rank, (out, _))| {
        out.iter().zip(&sum[rank * chunk * cli.n..(rank + 1) * chunk * cli.n])
    }));
    let mean_ms = results.iter().map(|(_, t)| t).sum::<f64>() / results.len() as f64 * 1e3;

    let summary = serde_json::json!({
        "op": "gemm_rs",
        "m": cli.m,
        "n": cli.n,
        "k": cli.k,
        "dtype": dt.to_string(),
        "world_size": s,
        "nnodes": cli.nnodes,
        "mean_ms": mean_ms,
        "max_rel_err": max_err,
        "tolerance": dt.tolerance(),
        "pass": max_err <= f64::from(dt.tolerance()),
    });
    println!("{summary}");
    Ok(())
}
