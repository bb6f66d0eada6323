//! GEMM operator adapter.
//!
//! An adapter is split in two halves:
//!
//! - [`GemmImpl`] knows one operator (plain, reduce-scatter, all-gather):
//!   how big its argument workspace is, what goes in it, and how operator
//!   arguments translate into [`KernelArguments`].
//! - [`DefaultGemmOperator`] is the generic half shared by all of them:
//!   workspace layout and size checks, `can_implement`, the PDL check, and
//!   the initialize/run lifecycle.
//!
//! Callers hold a `Box<dyn GemmOperator<B>>`, so the concrete kernel type
//! is erased at the call site while each instantiation stays monomorphic.

use std::marker::PhantomData;

use tracing::trace;

use crate::args::{AllGatherGemmArguments, GemmReduceScatterArguments, LocalGemmArguments};
use crate::backend::{Backend, BufferView, DeviceBuffer, MatrixView, MemoryOps};
use crate::hparams::UnifiedGemmHParams;
use crate::kernel::{Epilogue, GemmKernel, KernelArguments, KernelOutput, ProgramView};
use crate::schedule::{build_program, GemmKind, GemmShape, ScheduleConfig, TileProgram};
use crate::topology::Topology;
use crate::workspace::WorkspaceLayout;
use crate::{Error, Result};

/// GEMM-RS arguments as seen by the kernel adapter.
pub struct RsGemmArguments<'a, B: Backend> {
    pub args: &'a GemmReduceScatterArguments<B>,
    pub epoch: u32,
    /// Launch only this program segment; the whole program if `None`.
    pub segment: Option<usize>,
    /// Whether the epilogue raises flags itself.
    pub raise_flags: bool,
}

/// AG-GEMM arguments for the GEMM of one step.
pub struct AgGemmArguments<'a, B: Backend> {
    pub args: &'a AllGatherGemmArguments<B>,
    pub epoch: u32,
    pub step: usize,
}

/// Discriminated union of the argument structs an adapter may receive.
pub enum GemmArguments<'a, B: Backend> {
    Gemm(&'a LocalGemmArguments<B>),
    ReduceScatter(RsGemmArguments<'a, B>),
    AllGather(AgGemmArguments<'a, B>),
}

impl<B: Backend> GemmArguments<'_, B> {
    pub fn kind(&self) -> GemmKind {
        match self {
            Self::Gemm(_) => GemmKind::Gemm,
            Self::ReduceScatter(_) => GemmKind::ReduceScatter,
            Self::AllGather(_) => GemmKind::AllGather,
        }
    }

    pub fn shape(&self) -> GemmShape {
        match self {
            Self::Gemm(a) => a.shape(),
            Self::ReduceScatter(a) => a.args.shape(),
            Self::AllGather(a) => a.args.shape(),
        }
    }
}

/// The three regions of an operator workspace.
#[derive(Clone)]
pub struct WorkspaceRegions<B: Backend> {
    pub args: BufferView<B>,
    pub kernel: BufferView<B>,
    pub barrier: BufferView<B>,
    pub layout: WorkspaceLayout,
}

impl<B: Backend> WorkspaceRegions<B> {
    pub fn new(workspace: &B::Buffer, layout: WorkspaceLayout) -> Self {
        Self {
            args: BufferView::at(workspace.clone(), layout.args.start),
            kernel: BufferView::at(workspace.clone(), layout.kernel.start),
            barrier: BufferView::at(workspace.clone(), layout.barrier.start),
            layout,
        }
    }
}

/// Operator-specific half of an adapter.
pub trait GemmImpl<B: Backend>: Send + Sync {
    type Kernel: GemmKernel<B>;

    /// The one argument variant this adapter accepts.
    fn kind(&self) -> GemmKind;

    fn kernel(&self) -> &Self::Kernel;

    fn kernel_mut(&mut self) -> &mut Self::Kernel;

    fn get_args_workspace_size(&self, args: &GemmArguments<'_, B>) -> Result<usize>;

    fn get_barrier_workspace_size(&self, _args: &GemmArguments<'_, B>) -> Result<usize> {
        Ok(0)
    }

    /// Enqueue writes of per-launch data (tile descriptors, ...) into the
    /// argument workspace.
    fn initialize_args_workspace(
        &self,
        args: &GemmArguments<'_, B>,
        regions: &WorkspaceRegions<B>,
        stream: &B::Stream,
    ) -> Result<()>;

    /// Translate operator arguments into kernel arguments.
    fn to_gemm_args(
        &self,
        args: &GemmArguments<'_, B>,
        regions: &WorkspaceRegions<B>,
    ) -> Result<KernelArguments<B>>;
}

/// Uniform, type-erased interface over adapters.
pub trait GemmOperator<B: Backend>: Send + Sync {
    fn name(&self) -> String;

    fn kind(&self) -> GemmKind;

    /// Bind `args` and `workspace` for later [`run`](Self::run)s.
    ///
    /// # Errors
    /// `InvalidConfiguration` for the wrong argument variant,
    /// `WorkspaceTooSmall` if `workspace` is short, `KernelRejected` if the
    /// kernel refuses the arguments. Nothing is enqueued on error.
    fn initialize(
        &mut self,
        args: &GemmArguments<'_, B>,
        workspace: &B::Buffer,
        stream: &B::Stream,
    ) -> Result<()>;

    /// Launch with the bound arguments.
    ///
    /// # Errors
    /// `InvalidConfiguration` if `launch_with_pdl` is set for a kernel
    /// without PDL support or nothing has been initialized.
    fn run(&self, stream: &B::Stream, launch_with_pdl: bool) -> Result<()>;

    /// `initialize` followed by `run`.
    fn run_with_args(
        &mut self,
        args: &GemmArguments<'_, B>,
        workspace: &B::Buffer,
        stream: &B::Stream,
        launch_with_pdl: bool,
    ) -> Result<()> {
        check_pdl(launch_with_pdl, self.supports_pdl(), &self.name())?;
        self.initialize(args, workspace, stream)?;
        self.run(stream, launch_with_pdl)
    }

    fn workspace_layout(&self, args: &GemmArguments<'_, B>) -> Result<WorkspaceLayout>;

    /// Total workspace bytes for `args`.
    fn get_workspace_size(&self, args: &GemmArguments<'_, B>) -> Result<usize> {
        Ok(self.workspace_layout(args)?.total)
    }

    /// Bytes of the barrier region alone.
    fn get_barrier_workspace_size(&self, args: &GemmArguments<'_, B>) -> Result<usize>;

    fn get_runtime_gemm_hparams(&self) -> UnifiedGemmHParams;

    fn supports_pdl(&self) -> bool;
}

/// Reject PDL launches of kernels that cannot take them.
///
/// # Errors
/// Returns `InvalidConfiguration` if `launch_with_pdl && !supported`.
pub fn check_pdl(launch_with_pdl: bool, supported: bool, name: &str) -> Result<()> {
    if launch_with_pdl && !supported {
        return Err(Error::invalid(format!(
            "{name} does not support programmatic dependent launch"
        )));
    }
    Ok(())
}

/// Generic half of an adapter, wrapping one [`GemmImpl`].
pub struct DefaultGemmOperator<B: Backend, I: GemmImpl<B>> {
    imp: I,
    initialized: bool,
    _backend: PhantomData<B>,
}

impl<B: Backend, I: GemmImpl<B>> DefaultGemmOperator<B, I> {
    pub fn new(imp: I) -> Self {
        Self {
            imp,
            initialized: false,
            _backend: PhantomData,
        }
    }

    pub fn inner(&self) -> &I {
        &self.imp
    }

    fn check_kind(&self, args: &GemmArguments<'_, B>) -> Result<()> {
        if args.kind() == self.imp.kind() {
            Ok(())
        } else {
            Err(Error::invalid(format!(
                "{:?} adapter received {:?} arguments",
                self.imp.kind(),
                args.kind()
            )))
        }
    }
}

impl<B: Backend, I: GemmImpl<B>> GemmOperator<B> for DefaultGemmOperator<B, I> {
    fn name(&self) -> String {
        self.imp.kernel().name()
    }

    fn kind(&self) -> GemmKind {
        self.imp.kind()
    }

    fn initialize(
        &mut self,
        args: &GemmArguments<'_, B>,
        workspace: &B::Buffer,
        stream: &B::Stream,
    ) -> Result<()> {
        let layout = self.workspace_layout(args)?;
        if workspace.len_bytes() < layout.total {
            return Err(Error::WorkspaceTooSmall {
                required: layout.total,
                provided: workspace.len_bytes(),
            });
        }
        let regions = WorkspaceRegions::new(workspace, layout);
        let kernel_args = self.imp.to_gemm_args(args, &regions)?;
        self.imp.kernel().can_implement(&kernel_args)?;

        trace!(
            kernel = %self.imp.kernel().name(),
            tiles = kernel_args.program.range.len(),
            epoch = kernel_args.epoch,
            "initialize gemm operator"
        );
        self.imp.initialize_args_workspace(args, &regions, stream)?;
        self.imp
            .kernel_mut()
            .initialize(kernel_args, regions.kernel.clone(), stream)?;
        self.initialized = true;
        Ok(())
    }

    fn run(&self, stream: &B::Stream, launch_with_pdl: bool) -> Result<()> {
        check_pdl(launch_with_pdl, self.supports_pdl(), &self.name())?;
        if !self.initialized {
            return Err(Error::invalid("run() called before initialize()"));
        }
        self.imp.kernel().run(stream, launch_with_pdl)
    }

    fn workspace_layout(&self, args: &GemmArguments<'_, B>) -> Result<WorkspaceLayout> {
        self.check_kind(args)?;
        let args_bytes = self.imp.get_args_workspace_size(args)?;
        let kernel_bytes = self.imp.kernel().get_workspace_size(args.shape());
        let barrier_bytes = self.imp.get_barrier_workspace_size(args)?;
        Ok(WorkspaceLayout::new(args_bytes, kernel_bytes, barrier_bytes))
    }

    fn get_barrier_workspace_size(&self, args: &GemmArguments<'_, B>) -> Result<usize> {
        self.check_kind(args)?;
        self.imp.get_barrier_workspace_size(args)
    }

    fn get_runtime_gemm_hparams(&self) -> UnifiedGemmHParams {
        self.imp.kernel().hparams()
    }

    fn supports_pdl(&self) -> bool {
        self.imp.kernel().supports_pdl()
    }
}

// ---- Plain GEMM ----

/// Adapter for [`LocalGemmArguments`]: one rank, one step, no flags.
pub struct LocalGemmImpl<K> {
    kernel: K,
}

impl<K> LocalGemmImpl<K> {
    pub fn new(kernel: K) -> Self {
        Self { kernel }
    }
}

impl<K> LocalGemmImpl<K> {
    fn unwrap_args<'a, B: Backend>(args: &GemmArguments<'a, B>) -> Result<&'a LocalGemmArguments<B>> {
        match args {
            GemmArguments::Gemm(a) => Ok(*a),
            other => Err(Error::invalid(format!(
                "Gemm adapter received {:?} arguments",
                other.kind()
            ))),
        }
    }

    fn program<B: Backend>(&self, args: &LocalGemmArguments<B>) -> Result<TileProgram>
    where
        K: GemmKernel<B>,
    {
        let topo = Topology::new(0, 1, 1, 1)?;
        build_program(
            args.shape(),
            self.kernel.hparams().tile_shape,
            &topo,
            &ScheduleConfig::local(),
        )
    }
}

impl<B, K> GemmImpl<B> for LocalGemmImpl<K>
where
    B: MemoryOps,
    K: GemmKernel<B>,
{
    type Kernel = K;

    fn kind(&self) -> GemmKind {
        GemmKind::Gemm
    }

    fn kernel(&self) -> &K {
        &self.kernel
    }

    fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    fn get_args_workspace_size(&self, args: &GemmArguments<'_, B>) -> Result<usize> {
        let args = Self::unwrap_args(args)?;
        Ok(self.program(args)?.descriptor_bytes())
    }

    fn initialize_args_workspace(
        &self,
        args: &GemmArguments<'_, B>,
        regions: &WorkspaceRegions<B>,
        stream: &B::Stream,
    ) -> Result<()> {
        let args = Self::unwrap_args(args)?;
        let program = self.program(args)?;
        B::write_bytes(stream, &regions.args, program.as_bytes().to_vec())
    }

    fn to_gemm_args(
        &self,
        args: &GemmArguments<'_, B>,
        regions: &WorkspaceRegions<B>,
    ) -> Result<KernelArguments<B>> {
        let args = Self::unwrap_args(args)?;
        args.validate()?;
        let program = self.program(args)?;
        let (m, n, k) = (args.m, args.n, args.k);
        let mut epilogue = Epilogue::linear(args.alpha, args.beta);
        epilogue.bias = args
            .bias
            .clone()
            .map(|b| MatrixView::new(b, args.output_dtype, 1, n));
        epilogue.abs_max_d = args.abs_max_d.clone().map(BufferView::new);
        epilogue.scales = args.scales();
        Ok(KernelArguments {
            shape: args.shape(),
            a: MatrixView::new(args.input.clone(), args.input_dtype, m, k),
            b: MatrixView::new(args.weight.clone(), args.input_dtype, k, n),
            epilogue,
            accumulator: None,
            program: ProgramView {
                descriptors: regions.args.clone(),
                range: 0..program.len(),
                geometry: program.geometry,
            },
            wait: None,
            output: KernelOutput::Store {
                d: MatrixView::new(args.output.clone(), args.output_dtype, m, n),
            },
            epoch: 0,
            avail_sms: args.avail_sms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_pdl() {
        assert!(check_pdl(false, false, "k").is_ok());
        assert!(check_pdl(true, true, "k").is_ok());
        assert!(matches!(
            check_pdl(true, false, "legacy"),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
