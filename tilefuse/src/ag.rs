//! All-gather + GEMM.
//!
//! A is sharded along K. Step `s` of the launch multiplies the shard of
//! `step_peer(s)` by the matching rows of the weight and accumulates into
//! an f32 accumulator; the last step runs the epilogue. Meanwhile the
//! gather stream moves shards into each rank's gathered buffer. Once a band
//! of shard rows lands it raises the flag of every output tile that band
//! feeds (or the shard's single flag), which the GEMM's prologue waits on.

use std::ops::Range;

use tracing::{debug, trace};

use crate::args::AllGatherGemmArguments;
use crate::backend::{
    select_copy_engine, transfer_tag, BufferView, CollectiveBackend, CopyEngine, DeviceBuffer, MatrixView,
    StreamOps,
};
use crate::barrier::{BarrierArray, LaunchEpoch};
use crate::hparams::{TileShape, UnifiedGemmHParams};
use crate::kernel::{
    Accumulator, Epilogue, GemmKernel, KernelArguments, KernelOutput, ProgramView,
};
use crate::operator::{
    check_pdl, AgGemmArguments, GemmArguments, GemmImpl, GemmOperator, WorkspaceRegions,
};
use crate::registry::{GemmMeta, KernelFlavor, OpRegistry};
use crate::schedule::{build_program, GemmKind, ScheduleConfig, TileProgram};
use crate::topology::Topology;
use crate::workspace::RegionBuilder;
use crate::{DType, Error, Result};

/// A flag-guarded band of a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardBand {
    /// Band index; also the transfer tag.
    pub index: usize,
    pub row0: usize,
    pub rows: usize,
    /// Flag offsets within the pair's range raised once the band lands.
    pub slots: Range<usize>,
}

impl ShardBand {
    fn words(&self, base: usize) -> Vec<usize> {
        self.slots.clone().map(|s| base + s).collect()
    }
}

#[derive(Debug, Clone)]
pub struct AgPlan {
    pub topo: Topology,
    pub program: TileProgram,
    pub descriptors: Range<usize>,
    pub accumulator: Option<Range<usize>>,
    pub args_bytes: usize,
    pub own_flags: Option<Range<usize>>,
    pub barrier_bytes: usize,
}

impl AgPlan {
    /// # Errors
    /// Returns `InvalidConfiguration` if the arguments fail validation.
    pub fn new<B: CollectiveBackend>(args: &AllGatherGemmArguments<B>, tile: TileShape) -> Result<Self> {
        let topo = args.validate()?;
        let opts = args.options();
        let program = build_program(
            args.shape(),
            tile,
            &topo,
            &ScheduleConfig {
                kind: GemmKind::AllGather,
                sub_world_size: topo.sub_world_size(),
                n_split: opts.n_split,
                use_1d_ring: opts.use_1d_ring,
                use_p2p_read: opts.use_p2p_read,
                per_tile_flags: opts.per_tile_flags,
            },
        )?;
        let multi_step = topo.sub_world_size() > 1;

        let mut args_ws = RegionBuilder::new();
        let descriptors = args_ws.reserve(program.descriptor_bytes());
        let accumulator =
            multi_step.then(|| args_ws.reserve(args.m * args.n * DType::F32.size_in_bytes()));

        let mut barrier_ws = RegionBuilder::new();
        let own_flags = (multi_step && args.barrier_ptrs.is_none())
            .then(|| barrier_ws.reserve(program.num_slots * std::mem::size_of::<u64>()));

        Ok(Self {
            topo,
            program,
            descriptors,
            accumulator,
            args_bytes: args_ws.size(),
            own_flags,
            barrier_bytes: barrier_ws.size(),
        })
    }

    fn spp(&self) -> usize {
        self.program.geometry.slots_per_pair
    }

    /// Descriptor range of one step.
    pub fn step_range(&self, step: usize) -> Range<usize> {
        let mut segs = self.program.segments.iter().filter(|s| s.step == step);
        match segs.next() {
            Some(first) => {
                let end = segs.last().map_or(first.tiles.end, |s| s.tiles.end);
                first.tiles.start..end
            }
            None => 0..0,
        }
    }

    /// Flag-guarded bands of a shard.
    pub fn bands(&self) -> Vec<ShardBand> {
        let g = &self.program.geometry;
        if !g.per_tile_flags {
            return vec![ShardBand {
                index: 0,
                row0: 0,
                rows: g.chunk_rows,
                slots: 0..1,
            }];
        }
        (0..g.tiles_m_chunk)
            .map(|tm| {
                let row0 = tm * g.tile_m;
                ShardBand {
                    index: tm,
                    row0,
                    rows: g.tile_m.min(g.chunk_rows - row0),
                    slots: tm * g.tiles_n..(tm + 1) * g.tiles_n,
                }
            })
            .collect()
    }

    /// Flags of `rank` (external, or internal for self).
    pub fn rank_flags<B: CollectiveBackend>(
        &self,
        args: &AllGatherGemmArguments<B>,
        regions: &WorkspaceRegions<B>,
        rank: usize,
    ) -> Result<BarrierArray> {
        match args.barrier_buffer(&self.topo, rank)? {
            Some(buf) => B::barrier_array(&buf, 0, self.program.num_slots),
            None if rank == self.topo.rank() => {
                let range = self
                    .own_flags
                    .as_ref()
                    .ok_or_else(|| Error::invalid("plan has no own flags"))?;
                B::barrier_array(
                    &regions.barrier.buffer,
                    regions.barrier.offset + range.start,
                    self.program.num_slots,
                )
            }
            None => Err(Error::invalid(format!("no flags for rank {rank}"))),
        }
    }
}

// ---- Kernel adapter ----

/// Adapter running the GEMM of one step.
pub struct AgGemmImpl<K> {
    kernel: K,
}

impl<K> AgGemmImpl<K> {
    pub fn new(kernel: K) -> Self {
        Self { kernel }
    }
}

fn ag_args<'a, 'b, B: CollectiveBackend>(
    args: &'b GemmArguments<'a, B>,
) -> Result<&'b AgGemmArguments<'a, B>> {
    match args {
        GemmArguments::AllGather(a) => Ok(a),
        other => Err(Error::invalid(format!(
            "AllGather adapter received {:?} arguments",
            other.kind()
        ))),
    }
}

impl<B, K> GemmImpl<B> for AgGemmImpl<K>
where
    B: CollectiveBackend,
    K: GemmKernel<B>,
{
    type Kernel = K;

    fn kind(&self) -> GemmKind {
        GemmKind::AllGather
    }

    fn kernel(&self) -> &K {
        &self.kernel
    }

    fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    fn get_args_workspace_size(&self, args: &GemmArguments<'_, B>) -> Result<usize> {
        let a = ag_args(args)?;
        Ok(AgPlan::new(a.args, self.kernel.hparams().tile_shape)?.args_bytes)
    }

    fn get_barrier_workspace_size(&self, args: &GemmArguments<'_, B>) -> Result<usize> {
        let a = ag_args(args)?;
        Ok(AgPlan::new(a.args, self.kernel.hparams().tile_shape)?.barrier_bytes)
    }

    fn initialize_args_workspace(
        &self,
        args: &GemmArguments<'_, B>,
        regions: &WorkspaceRegions<B>,
        stream: &B::Stream,
    ) -> Result<()> {
        let a = ag_args(args)?;
        let plan = AgPlan::new(a.args, self.kernel.hparams().tile_shape)?;
        B::write_bytes(
            stream,
            &regions.args.advance(plan.descriptors.start),
            plan.program.as_bytes().to_vec(),
        )
    }

    fn to_gemm_args(
        &self,
        args: &GemmArguments<'_, B>,
        regions: &WorkspaceRegions<B>,
    ) -> Result<KernelArguments<B>> {
        let a = ag_args(args)?;
        let ag = a.args;
        let plan = AgPlan::new(ag, self.kernel.hparams().tile_shape)?;
        let topo = &plan.topo;
        let s = topo.sub_world_size();
        if a.step >= s {
            return Err(Error::invalid(format!("step {} of {s}", a.step)));
        }
        let (m, n) = (ag.m, ag.n);
        let ks = ag.shard_k();
        let producer = topo.step_peer(a.step, ag.options().use_1d_ring);
        let p_sub = topo.sub_index_of(producer);
        let first = a.step == 0;
        let last = a.step + 1 == s;

        let a_view = if first {
            ag.input_shard(topo, topo.rank())?
        } else {
            ag.gathered(topo, topo.rank())?.sub(0, m, p_sub * ks, ks)
        };
        let b_view = MatrixView::new(ag.weight.clone(), ag.input_dtype, ag.k, n).sub(p_sub * ks, ks, 0, n);

        let mut epilogue = Epilogue::linear(ag.alpha, ag.beta);
        epilogue.scales = ag.scales();
        if last {
            epilogue.bias = ag.bias.clone().map(|b| MatrixView::new(b, ag.output_dtype, 1, n));
            epilogue.vector = ag
                .vector
                .clone()
                .map(|v| MatrixView::new(v, ag.output_dtype, 1, n));
            epilogue.aux = ag.aux.clone().map(|x| MatrixView::new(x, ag.aux_dtype, m, n));
            epilogue.abs_max_d = ag.abs_max_d.clone().map(BufferView::new);
            epilogue.abs_max_aux = ag.abs_max_aux.clone().map(BufferView::new);
        }

        let accumulator = plan.accumulator.as_ref().map(|range| Accumulator {
            view: MatrixView::at(
                regions.args.buffer.clone(),
                regions.args.offset + range.start,
                DType::F32,
                m,
                n,
            ),
            first,
            last,
        });
        let wait = if first {
            None
        } else {
            Some(plan.rank_flags(ag, regions, topo.rank())?)
        };

        Ok(KernelArguments {
            shape: ag.shape(),
            a: a_view,
            b: b_view,
            epilogue,
            accumulator,
            program: ProgramView {
                descriptors: regions.args.advance(plan.descriptors.start),
                range: plan.step_range(a.step),
                geometry: plan.program.geometry,
            },
            wait,
            output: KernelOutput::Store {
                d: MatrixView::new(ag.output.clone(), ag.output_dtype, m, n),
            },
            epoch: a.epoch,
            avail_sms: ag.avail_sms,
        })
    }
}

// ---- Driver ----

/// Fused all-gather + GEMM operator for one rank.
pub struct AllGatherGemm<B: CollectiveBackend> {
    gemm: Box<dyn GemmOperator<B>>,
    epoch: LaunchEpoch,
}

impl<B: CollectiveBackend> AllGatherGemm<B> {
    /// # Errors
    /// Returns `InvalidConfiguration` if `gemm` is not an all-gather adapter.
    pub fn new(gemm: Box<dyn GemmOperator<B>>) -> Result<Self> {
        if gemm.kind() != GemmKind::AllGather {
            return Err(Error::invalid(format!(
                "{} is a {:?} operator, not AllGather",
                gemm.name(),
                gemm.kind()
            )));
        }
        Ok(Self {
            gemm,
            epoch: LaunchEpoch::new(),
        })
    }

    /// # Errors
    /// Returns `InvalidConfiguration` if no matching operator is registered.
    pub fn from_registry(
        registry: &OpRegistry<B>,
        input_dtype: DType,
        output_dtype: DType,
        flavor: KernelFlavor,
        hparams: Option<&UnifiedGemmHParams>,
    ) -> Result<Self> {
        let meta = GemmMeta::new(GemmKind::AllGather, input_dtype, output_dtype, flavor);
        Self::new(registry.get_op(&meta, hparams)?)
    }

    fn gemm_args(args: &AllGatherGemmArguments<B>, epoch: u32, step: usize) -> GemmArguments<'_, B> {
        GemmArguments::AllGather(AgGemmArguments { args, epoch, step })
    }

    /// # Errors
    /// Returns `InvalidConfiguration` if the arguments are invalid.
    pub fn get_workspace_size(&self, args: &AllGatherGemmArguments<B>) -> Result<usize> {
        self.gemm.get_workspace_size(&Self::gemm_args(args, 0, 0))
    }

    /// # Errors
    /// Returns `InvalidConfiguration` if the arguments are invalid.
    pub fn get_barrier_workspace_size(&self, args: &AllGatherGemmArguments<B>) -> Result<usize> {
        self.gemm.get_barrier_workspace_size(&Self::gemm_args(args, 0, 0))
    }

    pub fn get_runtime_gemm_hparams(&self) -> UnifiedGemmHParams {
        self.gemm.get_runtime_gemm_hparams()
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.current()
    }

    /// Enqueue one AG-GEMM launch.
    ///
    /// Inputs on every rank of the sub-group must be ready before any rank
    /// launches, and gathered buffers must not be reused until every rank
    /// has synchronized the previous launch.
    ///
    /// # Errors
    /// `InvalidConfiguration`, `WorkspaceTooSmall` or `KernelRejected` for
    /// bad arguments; backend errors from enqueueing.
    pub fn run(
        &mut self,
        args: &AllGatherGemmArguments<B>,
        workspace: &B::Buffer,
        stream: &B::Stream,
        launch_with_pdl: bool,
    ) -> Result<()> {
        check_pdl(launch_with_pdl, self.gemm.supports_pdl(), &self.gemm.name())?;
        let plan = AgPlan::new(args, self.gemm.get_runtime_gemm_hparams().tile_shape)?;
        let layout = self.gemm.workspace_layout(&Self::gemm_args(args, 0, 0))?;
        if workspace.len_bytes() < layout.total {
            return Err(Error::WorkspaceTooSmall {
                required: layout.total,
                provided: workspace.len_bytes(),
            });
        }
        let regions = WorkspaceRegions::new(workspace, layout);
        let step_flags = args
            .step_signal
            .as_ref()
            .map(|buf| B::barrier_array(buf, 0, plan.topo.sub_world_size()))
            .transpose()?;
        let epoch = self.epoch.next();
        let ag_stream = args
            .all_gather_args
            .ag_stream
            .clone()
            .unwrap_or_else(|| stream.clone());

        debug!(
            rank = plan.topo.rank(),
            epoch,
            steps = plan.topo.sub_world_size(),
            tiles = plan.program.len(),
            pull = args.options().use_p2p_read,
            "ag_gemm launch"
        );

        let start = stream.create_event();
        stream.record(&start)?;
        if !ag_stream.same_queue(stream) {
            ag_stream.wait_event(&start)?;
        }

        Self::enqueue_gather(args, &plan, &regions, &ag_stream, epoch)?;

        for step in 0..plan.topo.sub_world_size() {
            self.gemm.run_with_args(
                &Self::gemm_args(args, epoch, step),
                workspace,
                stream,
                launch_with_pdl,
            )?;
            if let Some(flags) = &step_flags {
                B::signal(stream, flags, vec![step], epoch)?;
            }
            trace!(step, epoch, "ag step enqueued");
        }

        if !ag_stream.same_queue(stream) {
            let done = ag_stream.create_event();
            ag_stream.record(&done)?;
            stream.wait_event(&done)?;
        }
        Ok(())
    }

    fn enqueue_gather(
        args: &AllGatherGemmArguments<B>,
        plan: &AgPlan,
        regions: &WorkspaceRegions<B>,
        ag_stream: &B::Stream,
        epoch: u32,
    ) -> Result<()> {
        let topo = &plan.topo;
        let me = topo.rank();
        let my_sub = topo.sub_rank();
        let s = topo.sub_world_size();
        let ks = args.shard_k();
        let spp = plan.spp();
        let opts = args.options();
        let device = args.weight.device();
        let bands = plan.bands();
        let own_shard = args.input_shard(topo, me)?;
        let own_gathered = args.gathered(topo, me)?;

        B::copy_2d(
            ag_stream,
            &own_shard,
            &own_gathered.sub(0, args.m, my_sub * ks, ks),
            CopyEngine::P2p,
        )?;
        if s == 1 {
            return Ok(());
        }
        let own_flags = plan.rank_flags(args, regions, me)?;

        // Outgoing: pushes to same-node peers and sends to remote ones, in
        // the order consumers need them.
        for step in 1..s {
            let consumer = topo.step_source(step, opts.use_1d_ring);
            let same_node = topo.is_same_node(consumer);
            if same_node && opts.use_p2p_read {
                continue;
            }
            if same_node {
                let dst = args.gathered(topo, consumer)?;
                let dst_flags = plan.rank_flags(args, regions, consumer)?;
                let engine =
                    select_copy_engine(B::can_access_peer(device, &dst.buffer), opts.use_memcpy_async);
                for band in &bands {
                    B::copy_2d(
                        ag_stream,
                        &own_shard.sub(band.row0, band.rows, 0, ks),
                        &dst.sub(band.row0, band.rows, my_sub * ks, ks),
                        engine,
                    )?;
                    B::signal(ag_stream, &dst_flags, band.words(my_sub * spp), epoch)?;
                }
            } else {
                let comm = Self::comm(args)?;
                for band in &bands {
                    B::comm_send(
                        ag_stream,
                        comm,
                        consumer,
                        transfer_tag(epoch, band.index),
                        &own_shard.sub(band.row0, band.rows, 0, ks),
                    )?;
                }
            }
        }

        // Incoming: pulls from same-node peers and receives from remote ones.
        for step in 1..s {
            let producer = topo.step_peer(step, opts.use_1d_ring);
            let p_sub = topo.sub_index_of(producer);
            let same_node = topo.is_same_node(producer);
            if same_node && !opts.use_p2p_read {
                continue;
            }
            if same_node {
                let src = args.input_shard(topo, producer)?;
                let engine =
                    select_copy_engine(B::can_access_peer(device, &src.buffer), opts.use_memcpy_async);
                for band in &bands {
                    B::copy_2d(
                        ag_stream,
                        &src.sub(band.row0, band.rows, 0, ks),
                        &own_gathered.sub(band.row0, band.rows, p_sub * ks, ks),
                        engine,
                    )?;
                    B::signal(ag_stream, &own_flags, band.words(p_sub * spp), epoch)?;
                }
            } else {
                let comm = Self::comm(args)?;
                for band in &bands {
                    B::comm_recv(
                        ag_stream,
                        comm,
                        producer,
                        transfer_tag(epoch, band.index),
                        &own_gathered.sub(band.row0, band.rows, p_sub * ks, ks),
                    )?;
                    B::signal(ag_stream, &own_flags, band.words(p_sub * spp), epoch)?;
                }
            }
        }
        Ok(())
    }

    fn comm(args: &AllGatherGemmArguments<B>) -> Result<&B::Comm> {
        args.all_gather_args
            .opaque
            .as_ref()
            .ok_or_else(|| Error::invalid("cross-node transfer without an opaque communicator"))
    }
}
