//! All-gather + GEMM on simulated multi-rank worlds.

mod test_helpers;

use tilefuse::args::{AllGatherGemmArguments, AllGatherOptions};
use tilefuse::barrier::{decode_flag, FlagState};
use tilefuse::{flag_words, AllGatherGemm, DType, Error, GemmKind, GemmShape, KernelFlavor, StreamOps};
use tilefuse_cpu::{builtin_registry, CpuConfig, CpuTileConfig, CpuWorld};

use test_helpers::{assert_close, cols_of, matmul_ref, random_matrix, scalar, test_config, upload};

#[derive(Clone)]
struct AgCase {
    world_size: usize,
    nnodes: usize,
    shape: GemmShape,
    dtype: DType,
    options: AllGatherOptions,
    config: CpuConfig,
    tile: Option<CpuTileConfig>,
    launches: usize,
    side_stream: bool,
}

struct AgResult {
    output: Vec<f32>,
    gathered: Vec<f32>,
}

impl AgCase {
    fn new(world_size: usize, nnodes: usize, shape: GemmShape, dtype: DType) -> Self {
        Self {
            world_size,
            nnodes,
            shape,
            dtype,
            options: AllGatherOptions {
                sub_world_size: world_size,
                ..AllGatherOptions::default()
            },
            config: test_config(),
            tile: None,
            launches: 1,
            side_stream: false,
        }
    }

    fn s(&self) -> usize {
        self.options.sub_world_size
    }

    /// Full A of the sub-group containing `rank`.
    fn full_input(&self, rank: usize) -> Vec<f32> {
        let group = (rank / self.s()) as u64;
        random_matrix(500 + group, self.shape.m, self.shape.k, self.dtype)
    }

    fn shard(&self, rank: usize) -> Vec<f32> {
        let ks = self.shape.k / self.s();
        cols_of(&self.full_input(rank), self.shape.m, self.shape.k, (rank % self.s()) * ks, ks)
    }

    fn weight(&self) -> Vec<f32> {
        random_matrix(600, self.shape.k, self.shape.n, self.dtype)
    }

    fn run(&self) -> tilefuse::Result<Vec<AgResult>> {
        let registry = builtin_registry()?;
        let world = CpuWorld::with_config(self.world_size, self.nnodes, self.config.clone())?;
        let GemmShape { m, n, k } = self.shape;
        let s = self.s();
        let dt = self.dtype;
        let esz = dt.size_in_bytes();
        let hparams = self.tile.map(|t| t.hparams(KernelFlavor::Universal));
        world.run(|ctx| {
            let rank = ctx.rank();
            let mut op = AllGatherGemm::from_registry(&registry, dt, dt, KernelFlavor::Universal, hparams.as_ref())?;
            let tile = op.get_runtime_gemm_hparams().tile_shape;
            let words = flag_words(GemmKind::AllGather, self.shape, tile, s, self.options.per_tile_flags);

            let inputs = ctx.alloc_shared(m * (k / s) * esz)?;
            inputs[rank].upload_f32(dt, &self.shard(rank))?;
            let gathered = ctx.alloc_shared(m * k * esz)?;
            let barriers = ctx.alloc_shared(words * 8)?;
            let output = ctx.alloc(m * n * esz);

            let mut args = AllGatherGemmArguments::new(
                self.shape,
                rank,
                self.world_size,
                self.nnodes,
                dt,
                upload(ctx, dt, &self.weight()),
                output.clone(),
            );
            args.input_ptrs = inputs;
            args.gathered_ptrs = gathered.clone();
            args.barrier_ptrs = (!self.options.use_p2p_read).then_some(barriers);
            args.all_gather_args.options = self.options.clone();
            args.all_gather_args.opaque = Some(ctx.comm());
            if self.side_stream {
                args.all_gather_args.ag_stream = Some(ctx.new_stream()?);
            }

            let workspace = ctx.alloc(op.get_workspace_size(&args)?);
            ctx.host_barrier()?;
            for _ in 0..self.launches {
                op.run(&args, &workspace, ctx.stream(), false)?;
                ctx.stream().synchronize()?;
                ctx.host_barrier()?;
            }
            Ok(AgResult {
                output: output.download_f32(dt, m * n)?,
                gathered: gathered[rank].download_f32(dt, m * k)?,
            })
        })
    }

    fn check(&self) {
        let GemmShape { m, n, k } = self.shape;
        let results = self.run().expect("ag_gemm launch");
        let weight = self.weight();
        for (rank, result) in results.iter().enumerate() {
            let a = self.full_input(rank);
            assert_eq!(result.gathered, a, "rank {rank} gathered A");
            let expected = matmul_ref(&a, &weight, m, n, k);
            assert_close(&result.output, &expected, self.dtype.tolerance(), &format!("rank {rank}"));
        }
    }
}

#[test]
fn single_rank() {
    AgCase::new(1, 1, GemmShape::new(128, 128, 128), DType::F16).check();
}

#[test]
fn two_nodes_ring_bf16() {
    AgCase::new(4, 2, GemmShape::new(1024, 512, 256), DType::BF16).check();
}

#[test]
fn two_nodes_swizzle() {
    let mut case = AgCase::new(4, 2, GemmShape::new(256, 128, 128), DType::F32);
    case.options.use_1d_ring = false;
    case.check();
}

#[test]
fn push_mode() {
    let mut case = AgCase::new(4, 1, GemmShape::new(256, 128, 128), DType::F16);
    case.options.use_p2p_read = false;
    case.check();
    case.options.per_tile_flags = false;
    case.check();
}

#[test]
fn push_without_peer_access() {
    let mut case = AgCase::new(2, 1, GemmShape::new(128, 64, 64), DType::F32);
    case.options.use_p2p_read = false;
    case.config.peer_access = false;
    case.check();
    case.options.use_memcpy_async = true;
    case.check();
}

#[test]
fn coarse_flags_and_n_split() {
    let mut case = AgCase::new(4, 1, GemmShape::new(256, 256, 128), DType::BF16);
    case.tile = Some(CpuTileConfig::T32x32x16);
    case.options.per_tile_flags = false;
    case.check();
    case.options.per_tile_flags = true;
    case.options.n_split = 4;
    case.check();
}

#[test]
fn ragged_tiles() {
    let mut case = AgCase::new(2, 1, GemmShape::new(90, 50, 64), DType::F32);
    case.tile = Some(CpuTileConfig::T32x32x16);
    case.check();
}

#[test]
fn sub_groups_and_repeated_launches() {
    let mut case = AgCase::new(4, 1, GemmShape::new(128, 64, 64), DType::F16);
    case.options.sub_world_size = 2;
    case.launches = 3;
    case.side_stream = true;
    case.check();
}

#[test]
fn epilogue_terms_and_step_signals() {
    let (m, n, k) = (128, 64, 128);
    let shape = GemmShape::new(m, n, k);
    let (alpha, beta) = (0.5f32, 2.0f32);
    let a = random_matrix(70, m, k, DType::F32);
    let w = random_matrix(71, k, n, DType::F32);
    let bias = random_matrix(72, 1, n, DType::F32);
    let vector = random_matrix(73, 1, n, DType::F32);
    let registry = builtin_registry().unwrap();
    let world = CpuWorld::with_config(2, 1, test_config()).unwrap();

    let results = world
        .run(|ctx| {
            let rank = ctx.rank();
            let mut op =
                AllGatherGemm::from_registry(&registry, DType::F32, DType::F32, KernelFlavor::Universal, None)?;
            let inputs = ctx.alloc_shared(m * (k / 2) * 4)?;
            inputs[rank].upload_f32(DType::F32, &cols_of(&a, m, k, rank * (k / 2), k / 2))?;
            let output = ctx.alloc(m * n * 4);
            let aux = ctx.alloc(m * n * 4);
            let signal = ctx.alloc(2 * 8);
            let abs_max = scalar(ctx, 0.0);

            let mut args = AllGatherGemmArguments::new(
                shape,
                rank,
                2,
                1,
                DType::F32,
                upload(ctx, DType::F32, &w),
                output.clone(),
            );
            args.alpha = alpha;
            args.beta = beta;
            args.input_ptrs = inputs;
            args.gathered_ptrs = ctx.alloc_shared(m * k * 4)?;
            args.bias = Some(upload(ctx, DType::F32, &bias));
            args.vector = Some(upload(ctx, DType::F32, &vector));
            args.aux = Some(aux.clone());
            args.abs_max_d = Some(abs_max.clone());
            args.step_signal = Some(signal.clone());
            args.all_gather_args.options.sub_world_size = 2;

            let workspace = ctx.alloc(op.get_workspace_size(&args)?);
            ctx.host_barrier()?;
            op.run(&args, &workspace, ctx.stream(), true)?;
            ctx.stream().synchronize()?;
            let epoch = op.epoch();
            let words: Vec<u64> = signal
                .read_bytes(0, 16)?
                .chunks_exact(8)
                .map(|b| u64::from_ne_bytes(b.try_into().unwrap()))
                .collect();
            Ok((
                output.download_f32(DType::F32, m * n)?,
                aux.download_f32(DType::F32, m * n)?,
                abs_max.download_f32(DType::F32, 1)?[0],
                words.iter().map(|&w| decode_flag(w)).collect::<Vec<_>>(),
                epoch,
            ))
        })
        .unwrap();

    let mut expected = matmul_ref(&a, &w, m, n, k);
    for row in expected.chunks_exact_mut(n) {
        for (j, v) in row.iter_mut().enumerate() {
            *v = f64::from(alpha) * *v + f64::from(beta) * f64::from(bias[j]) + f64::from(vector[j]);
        }
    }
    let max = expected.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    for (output, aux, abs_max, flags, epoch) in results {
        assert_close(&output, &expected, 1e-4, "output");
        assert_close(&aux, &expected, 1e-4, "aux");
        assert!((f64::from(abs_max) - max).abs() <= 1e-4 * max.max(1.0));
        assert_eq!(flags, vec![(FlagState::Produced, epoch); 2]);
    }
}

#[test]
fn fp8_output_is_scaled() {
    let (m, n, k) = (64, 64, 64);
    let shape = GemmShape::new(m, n, k);
    let scale_d = 4.0f32;
    let a = random_matrix(80, m, k, DType::BF16);
    let w = random_matrix(81, k, n, DType::BF16);
    let registry = builtin_registry().unwrap();
    let world = CpuWorld::with_config(2, 1, test_config()).unwrap();

    let outputs = world
        .run(|ctx| {
            let rank = ctx.rank();
            let mut op = AllGatherGemm::from_registry(
                &registry,
                DType::BF16,
                DType::F8E4M3,
                KernelFlavor::Universal,
                None,
            )?;
            let inputs = ctx.alloc_shared(m * (k / 2) * 2)?;
            inputs[rank].upload_f32(DType::BF16, &cols_of(&a, m, k, rank * (k / 2), k / 2))?;
            let output = ctx.alloc(m * n);
            let mut args = AllGatherGemmArguments::new(
                shape,
                rank,
                2,
                1,
                DType::BF16,
                upload(ctx, DType::BF16, &w),
                output.clone(),
            );
            args.output_dtype = DType::F8E4M3;
            args.input_ptrs = inputs;
            args.gathered_ptrs = ctx.alloc_shared(m * k * 2)?;
            args.scale_d = Some(scalar(ctx, scale_d));
            args.all_gather_args.options.sub_world_size = 2;

            let workspace = ctx.alloc(op.get_workspace_size(&args)?);
            ctx.host_barrier()?;
            op.run(&args, &workspace, ctx.stream(), false)?;
            ctx.stream().synchronize()?;
            output.download_f32(DType::F8E4M3, m * n)
        })
        .unwrap();

    let expected: Vec<f64> = matmul_ref(&a, &w, m, n, k)
        .into_iter()
        .map(|v| v * f64::from(scale_d))
        .collect();
    for out in outputs {
        assert_close(&out, &expected, DType::F8E4M3.tolerance(), "fp8 output");
    }
}

#[test]
fn fp8_output_without_scale_is_rejected() {
    let registry = builtin_registry().unwrap();
    let world = CpuWorld::with_config(1, 1, test_config()).unwrap();
    let err = world
        .run(|ctx| {
            let op = AllGatherGemm::from_registry(
                &registry,
                DType::BF16,
                DType::F8E4M3,
                KernelFlavor::Universal,
                None,
            )?;
            let shape = GemmShape::new(64, 64, 64);
            let mut args = AllGatherGemmArguments::new(
                shape,
                0,
                1,
                1,
                DType::BF16,
                ctx.alloc(64 * 64 * 2),
                ctx.alloc(64 * 64),
            );
            args.output_dtype = DType::F8E4M3;
            args.input_ptrs = vec![ctx.alloc(64 * 64 * 2)];
            args.gathered_ptrs = vec![ctx.alloc(64 * 64 * 2)];
            op.get_workspace_size(&args).map(|_| ())
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(ref m) if m.contains("scale")), "{err}");
}

#[test]
fn push_without_barrier_ptrs_is_rejected() {
    let mut case = AgCase::new(2, 1, GemmShape::new(64, 64, 64), DType::F32);
    case.options.use_p2p_read = false;
    let registry = builtin_registry().unwrap();
    let world = CpuWorld::with_config(2, 1, test_config()).unwrap();
    let err = world
        .run(|ctx| {
            let op = AllGatherGemm::from_registry(&registry, DType::F32, DType::F32, KernelFlavor::Universal, None)?;
            let mut args = AllGatherGemmArguments::new(
                case.shape,
                ctx.rank(),
                2,
                1,
                DType::F32,
                ctx.alloc(64 * 64 * 4),
                ctx.alloc(64 * 64 * 4),
            );
            args.input_ptrs = ctx.alloc_shared(64 * 32 * 4)?;
            args.gathered_ptrs = ctx.alloc_shared(64 * 64 * 4)?;
            args.all_gather_args.options = case.options.clone();
            op.get_workspace_size(&args).map(|_| ())
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)), "{err}");
}
