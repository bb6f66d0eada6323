//! All-gather + GEMM on a simulated multi-rank world.
//!
//! A is sharded along K across the ranks. Each rank gathers the shards
//! while its GEMM consumes them step by step, then checks the full output
//! against a host reference.
//!
//! Usage:
//!   cargo run --example ag_gemm -- --world-size 4 --nnodes 2 --dtype bf16
//!   TILEFUSE_USE_P2P_READ=0 cargo run --example ag_gemm

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use tracing::info;

use tilefuse::args::AllGatherGemmArguments;
use tilefuse::{flag_words, AllGatherGemm, DType, GemmKind, GemmShape, KernelFlavor, OperatorConfig, Result, StreamOps};
use tilefuse_cpu::{builtin_registry, CpuConfig, CpuWorld};
use tilefuse_examples::{init_logging, matmul_accumulate, max_rel_err, random_values};

/// Fused all-gather + GEMM on simulated devices
#[derive(Parser)]
#[command(name = "ag_gemm")]
struct Cli {
    /// Number of simulated devices
    #[arg(long, default_value_t = 4)]
    world_size: usize,

    /// Number of simulated nodes
    #[arg(long, default_value_t = 2)]
    nnodes: usize,

    #[arg(short, default_value_t = 1024)]
    m: usize,

    #[arg(short, default_value_t = 512)]
    n: usize,

    #[arg(short, default_value_t = 256)]
    k: usize,

    /// Input and output dtype
    #[arg(long, default_value = "bf16")]
    dtype: DType,

    /// Operator config JSON; `TILEFUSE_*` variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 3)]
    iters: usize,

    #[arg(long, default_value_t = 7)]
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
    let mut options = config.all_gather;
    options.sub_world_size = cli.world_size;

    let (m, n, k) = (cli.m, cli.n, cli.k);
    let shape = GemmShape::new(m, n, k);
    let dt = cli.dtype;
    let s = cli.world_size;
    let ks = k / s.max(1);
    let a = random_values(cli.seed, m * k, dt);
    let w = random_values(cli.seed + 1, k * n, dt);

    let registry = builtin_registry()?;
    let world = CpuWorld::with_config(s, cli.nnodes, CpuConfig::from_env()?)?;
    info!(?shape, %dt, world_size = s, nnodes = cli.nnodes, ?options, "ag_gemm");

    let results = world.run(|ctx| {
        let rank = ctx.rank();
        let mut op = AllGatherGemm::from_registry(&registry, dt, dt, KernelFlavor::Universal, None)?;
        let tile = op.get_runtime_gemm_hparams().tile_shape;
        let words = flag_words(GemmKind::AllGather, shape, tile, s, options.per_tile_flags);

        let shard: Vec<f32> = (0..m)
            .flat_map(|i| a[i * k + rank * ks..i * k + (rank + 1) * ks].iter().copied())
            .collect();
        let inputs = ctx.alloc_shared(m * ks * dt.size_in_bytes())?;
        inputs[rank].upload_f32(dt, &shard)?;
        let weight = ctx.alloc(k * n * dt.size_in_bytes());
        weight.upload_f32(dt, &w)?;
        let output = ctx.alloc(m * n * dt.size_in_bytes());

        let mut args = AllGatherGemmArguments::new(shape, rank, s, cli.nnodes, dt, weight, output.clone());
        args.input_ptrs = inputs;
        args.gathered_ptrs = ctx.alloc_shared(m * k * dt.size_in_bytes())?;
        args.barrier_ptrs = Some(ctx.alloc_shared(words * 8)?);
        args.all_gather_args.options = options.clone();
        args.all_gather_args.opaque = Some(ctx.comm());
        args.all_gather_args.ag_stream = Some(ctx.new_stream()?);

        let workspace = ctx.alloc(op.get_workspace_size(&args)?);
        let mut elapsed = 0.0;
        for iter in 0..=cli.iters {
            ctx.host_barrier()?;
            let start = Instant::now();
            op.run(&args, &workspace, ctx.stream(), true)?;
            ctx.stream().synchronize()?;
            if iter > 0 {
                elapsed += start.elapsed().as_secs_f64();
            }
        }
        Ok((output.download_f32(dt, m * n)?, elapsed / cli.iters.max(1) as f64))
    })?;

    let mut expected = vec![0.0f64; m * n];
    matmul_accumulate(&a, &w, m, n, k, &mut expected);
    let max_err = max_rel_err(results.iter().flat_map(|(out, _)| out.iter().zip(&expected)));
    let mean_ms = results.iter().map(|(_, t)| t).sum::<f64>() / results.len() as f64 * 1e3;

    let summary = serde_json::json!({
        "op": "ag_gemm",
        "m": m,
        "n": n,
        "k": k,
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
