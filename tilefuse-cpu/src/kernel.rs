//! Tile GEMM kernels for the simulated device.
//!
//! `CpuTileGemm<TM, TN, TK>` walks a tile program in waves of at most
//! `avail_sms` tiles. Each wave first waits on the prologue flags of its
//! tiles, then computes them in parallel on the thread pool, then runs the
//! epilogue tile by tile in program order: store, abs-max, and once the
//! last tile covered by a flag word has landed, raise that flag.
//!
//! Universal kernels are persistent and accept programmatic dependent
//! launch; legacy kernels reject it. Neither needs a kernel workspace.

use std::collections::HashMap;
use std::time::Duration;

use rayon::prelude::*;
use tilefuse::ag::AgGemmImpl;
use tilefuse::backend::{BufferView, MatrixView};
use tilefuse::hparams::{GemmSchedule, TileShape, UnifiedGemmHParams};
use tilefuse::kernel::{GemmKernel, KernelArguments, KernelOutput, ProgramView, ScatterTarget};
use tilefuse::operator::{DefaultGemmOperator, GemmOperator, LocalGemmImpl};
use tilefuse::registry::{GemmMeta, KernelFlavor, OpRegistry};
use tilefuse::rs::RsGemmImpl;
use tilefuse::schedule::{GemmKind, GemmShape, TileDesc, TileRect};
use tilefuse::{DType, Error, Result};
use tracing::{debug, trace};

use crate::buffer::{load_matrix, load_scale, store_matrix};
use crate::stream::CpuStream;
use crate::CpuBackend;

const DESC_BYTES: usize = std::mem::size_of::<TileDesc>();

#[derive(Clone)]
struct Launch {
    args: KernelArguments<CpuBackend>,
}

/// A tile GEMM instantiation with a `TM x TN` output tile and a `TK` K step.
pub struct CpuTileGemm<const TM: usize, const TN: usize, const TK: usize> {
    input_dtype: DType,
    output_dtype: DType,
    flavor: KernelFlavor,
    bound: Option<Launch>,
}

impl<const TM: usize, const TN: usize, const TK: usize> CpuTileGemm<TM, TN, TK> {
    pub fn new(input_dtype: DType, output_dtype: DType, flavor: KernelFlavor) -> Self {
        Self {
            input_dtype,
            output_dtype,
            flavor,
            bound: None,
        }
    }

    pub const fn tile_shape() -> TileShape {
        TileShape::new(TM, TN, TK)
    }

    fn persistent(&self) -> bool {
        self.flavor == KernelFlavor::Universal
    }

    fn reject(&self, reason: impl std::fmt::Display) -> Error {
        Error::KernelRejected(format!("{}: {reason}", GemmKernel::<CpuBackend>::name(self)))
    }
}

impl<const TM: usize, const TN: usize, const TK: usize> GemmKernel<CpuBackend> for CpuTileGemm<TM, TN, TK> {
    fn name(&self) -> String {
        format!(
            "cpu_{}_{}_{}_{}x{}x{}",
            match self.flavor {
                KernelFlavor::Legacy => "legacy",
                KernelFlavor::Universal => "universal",
            },
            self.input_dtype,
            self.output_dtype,
            TM,
            TN,
            TK
        )
    }

    fn hparams(&self) -> UnifiedGemmHParams {
        match self.flavor {
            KernelFlavor::Legacy => UnifiedGemmHParams::new(Self::tile_shape(), 2, GemmSchedule::Multistage),
            KernelFlavor::Universal => UnifiedGemmHParams::new(Self::tile_shape(), 3, GemmSchedule::Persistent),
        }
    }

    fn supports_pdl(&self) -> bool {
        self.persistent()
    }

    fn can_implement(&self, args: &KernelArguments<CpuBackend>) -> Result<()> {
        if args.a.dtype != self.input_dtype || args.b.dtype != self.input_dtype {
            return Err(self.reject(format!(
                "operands are {} x {}, kernel takes {}",
                args.a.dtype, args.b.dtype, self.input_dtype
            )));
        }
        if args.a.cols != args.b.rows {
            return Err(self.reject(format!(
                "A has {} columns but B has {} rows",
                args.a.cols, args.b.rows
            )));
        }
        let out_dtypes: Vec<DType> = match &args.output {
            KernelOutput::Store { d } => vec![d.dtype],
            KernelOutput::Scatter { targets, .. } => targets.iter().map(|t| t.dst.dtype).collect(),
        };
        if let Some(dtype) = out_dtypes.iter().find(|&&d| d != self.output_dtype) {
            return Err(self.reject(format!("output is {dtype}, kernel writes {}", self.output_dtype)));
        }
        if let Some(acc) = &args.accumulator {
            if acc.view.dtype != DType::F32 {
                return Err(self.reject("accumulator must be f32"));
            }
        }
        let g = &args.program.geometry;
        if g.tile_m != TM || g.tile_n != TN {
            return Err(self.reject(format!(
                "program tiled {}x{}, kernel tile is {}x{}",
                g.tile_m, g.tile_n, TM, TN
            )));
        }
        if args.avail_sms == 0 || args.avail_sms < -1 {
            return Err(self.reject(format!("avail_sms {}", args.avail_sms)));
        }
        Ok(())
    }

    fn get_workspace_size(&self, _shape: GemmShape) -> usize {
        0
    }

    fn initialize(
        &mut self,
        args: KernelArguments<CpuBackend>,
        _workspace: BufferView<CpuBackend>,
        _stream: &CpuStream,
    ) -> Result<()> {
        self.bound = Some(Launch { args });
        Ok(())
    }

    fn run(&self, stream: &CpuStream, launch_with_pdl: bool) -> Result<()> {
        if launch_with_pdl && !self.persistent() {
            return Err(Error::invalid(format!(
                "{} cannot be launched with PDL",
                GemmKernel::<CpuBackend>::name(self)
            )));
        }
        let launch = self
            .bound
            .clone()
            .ok_or_else(|| Error::invalid("kernel run before initialize"))?;
        let tiles = launch.args.program.range.len();
        if stream.config().log_kernels {
            debug!(kernel = %GemmKernel::<CpuBackend>::name(self), tiles, epoch = launch.args.epoch, "launch");
        } else {
            trace!(kernel = %GemmKernel::<CpuBackend>::name(self), tiles, epoch = launch.args.epoch, "launch");
        }
        let timeout = stream.config().flag_timeout();
        stream.enqueue("gemm", move || execute(&launch, TK, timeout))
    }
}

// ---- Execution ----

fn read_descriptors(program: &ProgramView<CpuBackend>) -> Result<Vec<TileDesc>> {
    let view = &program.descriptors;
    let bytes = view.buffer.read_bytes(
        view.offset + program.range.start * DESC_BYTES,
        program.range.len() * DESC_BYTES,
    )?;
    Ok(bytes
        .chunks_exact(DESC_BYTES)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

/// `A[rect rows, :] . B[:, rect cols]` in f32, stepping K by `tile_k`.
fn compute_tile(a: &MatrixView<CpuBackend>, b: &[f32], n: usize, rect: TileRect, tile_k: usize) -> Result<Vec<f32>> {
    let k = a.cols;
    let a_rows = load_matrix(&a.sub(rect.row0, rect.rows, 0, k))?;
    let mut out = vec![0.0f32; rect.rows * rect.cols];
    for k0 in (0..k).step_by(tile_k.max(1)) {
        let k1 = (k0 + tile_k).min(k);
        for (i, out_row) in out.chunks_exact_mut(rect.cols).enumerate() {
            let a_row = &a_rows[i * k..(i + 1) * k];
            for p in k0..k1 {
                let av = a_row[p];
                let b_row = &b[p * n + rect.col0..p * n + rect.col0 + rect.cols];
                for (o, bv) in out_row.iter_mut().zip(b_row) {
                    *o += av * bv;
                }
            }
        }
    }
    Ok(out)
}

/// Per-launch epilogue constants.
struct EpilogueTerms {
    scale_ab: f32,
    scale_beta: f32,
    scale_d: f32,
    scale_aux: f32,
    bias: Option<Vec<f32>>,
    vector: Option<Vec<f32>>,
}

impl EpilogueTerms {
    fn load(args: &KernelArguments<CpuBackend>) -> Result<Self> {
        let ep = &args.epilogue;
        let s = &ep.scales;
        Ok(Self {
            scale_ab: ep.alpha * load_scale(s.a.as_ref())? * load_scale(s.b.as_ref())?,
            scale_beta: ep.beta * load_scale(s.c.as_ref())?,
            scale_d: load_scale(s.d.as_ref())?,
            scale_aux: load_scale(s.aux.as_ref())?,
            bias: ep.bias.as_ref().map(load_matrix).transpose()?,
            vector: ep.vector.as_ref().map(load_matrix).transpose()?,
        })
    }

    fn apply(&self, values: &mut [f32], rect: TileRect) {
        for row in values.chunks_exact_mut(rect.cols) {
            for (j, v) in row.iter_mut().enumerate() {
                let col = rect.col0 + j;
                *v *= self.scale_ab;
                if let Some(bias) = &self.bias {
                    *v += self.scale_beta * bias[col];
                }
                if let Some(vector) = &self.vector {
                    *v += vector[col];
                }
            }
        }
    }
}

fn abs_max(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

fn scaled(values: &[f32], scale: f32) -> Vec<f32> {
    values.iter().map(|v| v * scale).collect()
}

/// Run the epilogue of one tile. Returns false if the tile only updated
/// the accumulator.
fn finish_tile(
    args: &KernelArguments<CpuBackend>,
    terms: &EpilogueTerms,
    desc: &TileDesc,
    rect: TileRect,
    mut values: Vec<f32>,
    maxima: &mut (f32, f32),
) -> Result<bool> {
    if let Some(acc) = &args.accumulator {
        let view = acc.view.sub(rect.row0, rect.rows, rect.col0, rect.cols);
        if !acc.first {
            let prev = load_matrix(&view)?;
            for (v, p) in values.iter_mut().zip(prev) {
                *v += p;
            }
        }
        if !acc.last {
            store_matrix(&view, &values)?;
            return Ok(false);
        }
    }

    terms.apply(&mut values, rect);
    let tile_max = abs_max(&values);
    if let Some(aux) = &args.epilogue.aux {
        store_matrix(
            &aux.sub(rect.row0, rect.rows, rect.col0, rect.cols),
            &scaled(&values, terms.scale_aux),
        )?;
        maxima.1 = maxima.1.max(tile_max);
    }
    maxima.0 = maxima.0.max(tile_max);
    let out = scaled(&values, terms.scale_d);

    match &args.output {
        KernelOutput::Store { d } => store_matrix(&d.sub(rect.row0, rect.rows, rect.col0, rect.cols), &out),
        KernelOutput::Scatter { group_base, targets } => {
            let g = &args.program.geometry;
            let target = target_of(targets, *group_base, desc)?;
            let row = target.row_base + rect.row0 - g.chunk_of(desc) * g.chunk_rows;
            store_matrix(&target.dst.sub(row, rect.rows, rect.col0, rect.cols), &out)
        }
    }?;
    Ok(true)
}

fn target_of<'a>(
    targets: &'a [ScatterTarget<CpuBackend>],
    group_base: usize,
    desc: &TileDesc,
) -> Result<&'a ScatterTarget<CpuBackend>> {
    (desc.consumer_rank as usize)
        .checked_sub(group_base)
        .and_then(|i| targets.get(i))
        .ok_or_else(|| {
            Error::DeviceFailure(format!(
                "tile for rank {} has no scatter target",
                desc.consumer_rank
            ))
        })
}

fn execute(launch: &Launch, tile_k: usize, timeout: Option<Duration>) -> Result<()> {
    let args = &launch.args;
    let g = args.program.geometry;
    let descs = read_descriptors(&args.program)?;
    let b = load_matrix(&args.b)?;
    let n = args.b.cols;
    let terms = EpilogueTerms::load(args)?;

    // Tiles outstanding per (target, flag word) in this launch.
    let mut remaining: HashMap<(usize, usize), usize> = HashMap::new();
    if let KernelOutput::Scatter { group_base, targets } = &args.output {
        for desc in &descs {
            let idx = (desc.consumer_rank as usize).wrapping_sub(*group_base);
            if let Some(flag) = targets.get(idx).and_then(|t| t.flag.as_ref()) {
                *remaining.entry((idx, flag.slot(&g, desc))).or_default() += 1;
            }
        }
    }

    let wave = usize::try_from(args.avail_sms)
        .ok()
        .filter(|&w| w > 0)
        .unwrap_or_else(rayon::current_num_threads)
        .max(1);
    let mut maxima = (0.0f32, 0.0f32);

    for batch in descs.chunks(wave) {
        if let Some(wait) = &args.wait {
            for desc in batch {
                wait.wait_produced(desc.barrier_slot as usize, args.epoch, timeout)?;
            }
        }
        let tiles: Vec<Result<Vec<f32>>> = batch
            .par_iter()
            .map(|desc| compute_tile(&args.a, &b, n, g.tile_rect(desc), tile_k))
            .collect();

        for (desc, tile) in batch.iter().zip(tiles) {
            let rect = g.tile_rect(desc);
            let stored = finish_tile(args, &terms, desc, rect, tile?, &mut maxima)?;
            if !stored {
                continue;
            }
            if let KernelOutput::Scatter { group_base, targets } = &args.output {
                let idx = (desc.consumer_rank as usize).wrapping_sub(*group_base);
                if let Some(flag) = targets.get(idx).and_then(|t| t.flag.as_ref()) {
                    let slot = flag.slot(&g, desc);
                    if let Some(count) = remaining.get_mut(&(idx, slot)) {
                        *count -= 1;
                        if *count == 0 {
                            flag.barrier.produce(slot, args.epoch);
                        }
                    }
                }
            }
        }
    }

    if let Some(cell) = &args.epilogue.abs_max_d {
        cell.buffer.fetch_max_f32(cell.offset, maxima.0)?;
    }
    if let Some(cell) = &args.epilogue.abs_max_aux {
        cell.buffer.fetch_max_f32(cell.offset, maxima.1)?;
    }
    Ok(())
}

// ---- Instantiations ----

/// Tile shapes compiled into the CPU kernel library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuTileConfig {
    T32x32x16,
    T64x64x32,
    T128x128x32,
}

fn operator<const TM: usize, const TN: usize, const TK: usize>(
    kind: GemmKind,
    input: DType,
    output: DType,
    flavor: KernelFlavor,
) -> Box<dyn GemmOperator<CpuBackend>> {
    let kernel = CpuTileGemm::<TM, TN, TK>::new(input, output, flavor);
    match kind {
        GemmKind::Gemm => Box::new(DefaultGemmOperator::new(LocalGemmImpl::new(kernel))),
        GemmKind::ReduceScatter => Box::new(DefaultGemmOperator::new(RsGemmImpl::new(kernel))),
        GemmKind::AllGather => Box::new(DefaultGemmOperator::new(AgGemmImpl::new(kernel))),
    }
}

impl CpuTileConfig {
    pub const ALL: [Self; 3] = [Self::T64x64x32, Self::T128x128x32, Self::T32x32x16];

    pub fn tile_shape(self) -> TileShape {
        match self {
            Self::T32x32x16 => TileShape::new(32, 32, 16),
            Self::T64x64x32 => TileShape::new(64, 64, 32),
            Self::T128x128x32 => TileShape::new(128, 128, 32),
        }
    }

    pub fn hparams(self, flavor: KernelFlavor) -> UnifiedGemmHParams {
        match flavor {
            KernelFlavor::Legacy => UnifiedGemmHParams::new(self.tile_shape(), 2, GemmSchedule::Multistage),
            KernelFlavor::Universal => UnifiedGemmHParams::new(self.tile_shape(), 3, GemmSchedule::Persistent),
        }
    }

    /// Construct the operator for `meta` with this tile shape.
    pub fn operator(self, meta: GemmMeta) -> Box<dyn GemmOperator<CpuBackend>> {
        let GemmMeta {
            kind,
            input_dtype,
            output_dtype,
            flavor,
        } = meta;
        match self {
            Self::T32x32x16 => operator::<32, 32, 16>(kind, input_dtype, output_dtype, flavor),
            Self::T64x64x32 => operator::<64, 64, 32>(kind, input_dtype, output_dtype, flavor),
            Self::T128x128x32 => operator::<128, 128, 32>(kind, input_dtype, output_dtype, flavor),
        }
    }
}

/// (input, output) dtype pairs instantiated for `kind`.
pub fn dtype_pairs(kind: GemmKind) -> Vec<(DType, DType)> {
    let mut pairs = vec![
        (DType::F32, DType::F32),
        (DType::F16, DType::F16),
        (DType::BF16, DType::BF16),
        (DType::F8E4M3, DType::BF16),
        (DType::F8E4M3, DType::F16),
    ];
    if kind != GemmKind::ReduceScatter {
        pairs.push((DType::BF16, DType::F8E4M3));
        pairs.push((DType::F8E4M3, DType::F8E4M3));
    }
    pairs
}

/// Registry holding every CPU instantiation. The 64x64x32 tile is the
/// default for each meta.
///
/// # Errors
/// Returns `InvalidConfiguration` if an instantiation is registered twice.
pub fn builtin_registry() -> Result<OpRegistry<CpuBackend>> {
    let mut registry = OpRegistry::new();
    for kind in [GemmKind::Gemm, GemmKind::ReduceScatter, GemmKind::AllGather] {
        for (input, output) in dtype_pairs(kind) {
            for flavor in [KernelFlavor::Universal, KernelFlavor::Legacy] {
                let meta = GemmMeta::new(kind, input, output, flavor);
                for tile in CpuTileConfig::ALL {
                    registry.register(meta, tile.hparams(flavor), Box::new(move || tile.operator(meta)))?;
                }
            }
        }
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hparams_follow_flavor() {
        let universal = CpuTileGemm::<64, 64, 32>::new(DType::F16, DType::F16, KernelFlavor::Universal);
        let legacy = CpuTileGemm::<64, 64, 32>::new(DType::F16, DType::F16, KernelFlavor::Legacy);
        assert_eq!(GemmKernel::<CpuBackend>::hparams(&universal).schedule, GemmSchedule::Persistent);
        assert!(GemmKernel::<CpuBackend>::supports_pdl(&universal));
        assert!(!GemmKernel::<CpuBackend>::supports_pdl(&legacy));
    }

    #[test]
    fn test_kernels_need_no_workspace() {
        let shape = GemmShape::new(130, 64, 32);
        for flavor in [KernelFlavor::Universal, KernelFlavor::Legacy] {
            let kernel = CpuTileGemm::<64, 64, 32>::new(DType::F32, DType::F32, flavor);
            assert_eq!(GemmKernel::<CpuBackend>::get_workspace_size(&kernel, shape), 0);
        }
    }

    #[test]
    fn test_registry_defaults_and_lookup() {
        let registry = builtin_registry().unwrap();
        let meta = GemmMeta::new(GemmKind::ReduceScatter, DType::F16, DType::F16, KernelFlavor::Universal);
        let op = registry.get_op(&meta, None).unwrap();
        assert_eq!(op.get_runtime_gemm_hparams().tile_shape, TileShape::new(64, 64, 32));

        let small = CpuTileConfig::T32x32x16.hparams(KernelFlavor::Universal);
        let op = registry.get_op(&meta, Some(&small)).unwrap();
        assert_eq!(op.get_runtime_gemm_hparams(), small);

        let fp8_rs = GemmMeta::new(GemmKind::ReduceScatter, DType::BF16, DType::F8E4M3, KernelFlavor::Universal);
        assert!(registry.get_op(&fp8_rs, None).is_err());
    }
}
