//! Contract between the operator adapters and concrete GEMM kernels.
//!
//! A kernel walks a [`TileProgram`](crate::schedule::TileProgram) that the
//! adapter serialized into the argument workspace. Before a tile it may wait
//! on a flag (all-gather prologue); after a tile it stores through the
//! epilogue and may raise a flag (reduce-scatter producer).

use std::ops::Range;

use crate::backend::{Backend, BufferView, MatrixView, Scales};
use crate::barrier::BarrierArray;
use crate::hparams::UnifiedGemmHParams;
use crate::schedule::{GemmShape, ProgramGeometry, TileDesc};
use crate::{DType, Error, Result};

/// Where a kernel finds its descriptors and which of them to execute.
#[derive(Clone)]
pub struct ProgramView<B: Backend> {
    /// Start of the serialized [`TileDesc`] array.
    pub descriptors: BufferView<B>,
    /// Descriptor indices this launch executes.
    pub range: Range<usize>,
    pub geometry: ProgramGeometry,
}

/// A flag raised after tiles are stored.
#[derive(Clone, Debug)]
pub struct FlagTarget {
    pub barrier: BarrierArray,
    /// First word of the (producer, consumer) pair's range.
    pub slot_base: usize,
}

impl FlagTarget {
    /// Word that `desc` maps to in this target.
    pub fn slot(&self, geometry: &ProgramGeometry, desc: &TileDesc) -> usize {
        self.slot_base + geometry.slot_in_pair(desc)
    }
}

/// Destination of the tiles headed for one consumer.
#[derive(Clone)]
pub struct ScatterTarget<B: Backend> {
    /// Matrix receiving the tiles.
    pub dst: MatrixView<B>,
    /// Row of `dst` where the consumer's chunk begins.
    pub row_base: usize,
    pub flag: Option<FlagTarget>,
}

/// Epilogue output mode.
#[derive(Clone)]
pub enum KernelOutput<B: Backend> {
    /// Tiles land at their own coordinates in a full-size `d`.
    Store { d: MatrixView<B> },
    /// Tiles of chunk `c` land in `targets[c]`, indexed by consumer
    /// sub-rank (`consumer_rank - group_base`).
    Scatter {
        group_base: usize,
        targets: Vec<ScatterTarget<B>>,
    },
}

/// An f32 accumulator carried across launches that split K.
#[derive(Clone)]
pub struct Accumulator<B: Backend> {
    /// `m x n` f32 matrix.
    pub view: MatrixView<B>,
    /// Overwrite instead of accumulate.
    pub first: bool,
    /// Run the epilogue on the accumulated sum and store the output.
    pub last: bool,
}

/// Epilogue: `d = alpha*scaleA*scaleB*(A.B) + beta*scaleC*bias + vector`,
/// `aux = d`, stores `D = d*scaleD` and `Aux = aux*scaleAux`.
#[derive(Clone)]
pub struct Epilogue<B: Backend> {
    pub alpha: f32,
    pub beta: f32,
    /// `1 x n` row broadcast over M.
    pub bias: Option<MatrixView<B>>,
    /// `1 x n` row added unscaled.
    pub vector: Option<MatrixView<B>>,
    /// Full-size auxiliary output.
    pub aux: Option<MatrixView<B>>,
    pub abs_max_d: Option<BufferView<B>>,
    pub abs_max_aux: Option<BufferView<B>>,
    pub scales: Scales<B>,
}

impl<B: Backend> Epilogue<B> {
    pub fn linear(alpha: f32, beta: f32) -> Self {
        Self {
            alpha,
            beta,
            bias: None,
            vector: None,
            aux: None,
            abs_max_d: None,
            abs_max_aux: None,
            scales: Scales::default(),
        }
    }
}

/// Kernel-level arguments produced by an adapter's `to_gemm_args`.
#[derive(Clone)]
pub struct KernelArguments<B: Backend> {
    pub shape: GemmShape,
    /// `m x k`; tile rows index A rows directly.
    pub a: MatrixView<B>,
    /// `k x n`.
    pub b: MatrixView<B>,
    pub epilogue: Epilogue<B>,
    pub accumulator: Option<Accumulator<B>>,
    pub program: ProgramView<B>,
    /// Flags each tile waits on (at its `barrier_slot`) before loading A.
    pub wait: Option<BarrierArray>,
    pub output: KernelOutput<B>,
    pub epoch: u32,
    /// Cap on concurrently resident tiles; -1 means all.
    pub avail_sms: i32,
}

/// A concrete GEMM kernel instantiation.
pub trait GemmKernel<B: Backend>: Send + Sync {
    fn name(&self) -> String;

    fn hparams(&self) -> UnifiedGemmHParams;

    /// Whether the kernel may be launched with programmatic dependent launch.
    fn supports_pdl(&self) -> bool;

    /// # Errors
    /// Returns `KernelRejected` if this instantiation cannot run `args`.
    fn can_implement(&self, args: &KernelArguments<B>) -> Result<()>;

    /// Scratch the kernel needs for a problem of this shape.
    fn get_workspace_size(&self, shape: GemmShape) -> usize;

    /// Bind arguments and kernel workspace for subsequent [`run`](Self::run)s.
    fn initialize(
        &mut self,
        args: KernelArguments<B>,
        workspace: BufferView<B>,
        stream: &B::Stream,
    ) -> Result<()>;

    /// Enqueue the kernel on `stream`.
    fn run(&self, stream: &B::Stream, launch_with_pdl: bool) -> Result<()>;
}

/// fp8 operands need their scale tensors to recover range.
///
/// # Errors
/// Returns `InvalidConfiguration` naming the first missing scale.
pub fn check_fp8_scales<B: Backend>(
    input_dtype: DType,
    output_dtype: DType,
    aux_dtype: Option<DType>,
    scales: &Scales<B>,
) -> Result<()> {
    let missing = |name: &str, dtype: DType| {
        Error::invalid(format!("{name} is required when the tensor is {dtype}"))
    };
    if input_dtype.is_fp8() {
        if scales.a.is_none() {
            return Err(missing("scaleA", input_dtype));
        }
        if scales.b.is_none() {
            return Err(missing("scaleB", input_dtype));
        }
    }
    if output_dtype.is_fp8() && scales.d.is_none() {
        return Err(missing("scaleD", output_dtype));
    }
    if let Some(aux) = aux_dtype {
        if aux.is_fp8() && scales.aux.is_none() {
            return Err(missing("scaleAux", aux));
        }
    }
    Ok(())
}
