//! GEMM + reduce-scatter.
//!
//! Every rank's GEMM produces a partial tile for every consumer's row chunk
//! and hands it over through one of these routes:
//!
//! - **local**: this rank's own chunk, stored in its own reduce buffer.
//! - **pull**: stored in this rank's reduce buffer; the consumer reads it.
//! - **push-direct**: the epilogue stores into the consumer's slot and
//!   raises the consumer's flag.
//! - **push-staged**: the epilogue stores into workspace staging; a copy
//!   on the reduce stream moves the tile and raises the consumer's flag.
//! - **cross-node**: tiles travel over the opaque channel and the receiver
//!   raises its own flags.
//!
//! The consumer then waits on every producer's flags for each tile of its
//! chunk and sums them in ring order into `output_scatter[rank]`.

use std::collections::BTreeMap;
use std::ops::Range;

use tracing::{debug, trace};

use crate::args::GemmReduceScatterArguments;
use crate::backend::{
    select_copy_engine, transfer_tag, BufferView, CollectiveBackend, CopyEngine, DeviceBuffer, MatrixView,
    ReduceArgs, StreamOps,
};
use crate::barrier::{BarrierArray, LaunchEpoch};
use crate::hparams::{TileShape, UnifiedGemmHParams};
use crate::kernel::{
    Epilogue, FlagTarget, GemmKernel, KernelArguments, KernelOutput, ProgramView, ScatterTarget,
};
use crate::operator::{
    check_pdl, GemmArguments, GemmImpl, GemmOperator, RsGemmArguments, WorkspaceRegions,
};
use crate::registry::{GemmMeta, KernelFlavor, OpRegistry};
use crate::ring::ring_order;
use crate::schedule::{build_program, GemmKind, ScheduleConfig, TileProgram};
use crate::topology::Topology;
use crate::workspace::RegionBuilder;
use crate::{Error, Result};

const FLAG_BYTES: usize = std::mem::size_of::<u64>();

/// How tiles reach one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Pull,
    PushDirect,
    PushStaged(CopyEngine),
    CrossNode,
}

/// A flag-guarded region of one chunk, in chunk-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRegion {
    /// Flag offset within the pair's range; also the transfer tag.
    pub slot: usize,
    pub row0: usize,
    pub rows: usize,
    pub col0: usize,
    pub cols: usize,
}

/// Everything derived from one set of arguments: topology, tile program,
/// routes, and where each piece lives in the workspace.
#[derive(Debug, Clone)]
pub struct RsPlan {
    pub topo: Topology,
    pub program: TileProgram,
    /// Indexed by consumer sub-rank.
    pub routes: Vec<Route>,
    /// Producers write into consumers' buffers (false: consumers read).
    pub push: bool,
    pub descriptors: Range<usize>,
    pub staging: Option<Range<usize>>,
    pub recv: Option<Range<usize>>,
    pub args_bytes: usize,
    pub own_flags: Option<Range<usize>>,
    pub staging_flags: Option<Range<usize>>,
    pub recv_flags: Option<Range<usize>>,
    pub barrier_bytes: usize,
}

impl RsPlan {
    /// # Errors
    /// Returns `InvalidConfiguration` if the arguments fail validation.
    pub fn new<B: CollectiveBackend>(args: &GemmReduceScatterArguments<B>, tile: TileShape) -> Result<Self> {
        let topo = args.validate()?;
        let opts = args.options();
        let program = build_program(
            args.shape(),
            tile,
            &topo,
            &ScheduleConfig {
                kind: GemmKind::ReduceScatter,
                sub_world_size: topo.sub_world_size(),
                n_split: opts.n_split,
                use_1d_ring: opts.use_1d_ring,
                use_p2p_read: opts.use_p2p_read,
                per_tile_flags: opts.per_tile_flags,
            },
        )?;

        let local_device = args.input.device();
        let mut routes = Vec::with_capacity(topo.sub_world_size());
        for c_sub in 0..topo.sub_world_size() {
            let consumer = topo.group_rank(c_sub);
            let route = if consumer == topo.rank() {
                Route::Local
            } else if !topo.is_same_node(consumer) {
                Route::CrossNode
            } else if opts.use_p2p_read {
                Route::Pull
            } else {
                let dst = args.reduce_buffer(&topo, consumer)?;
                let peer_access = B::can_access_peer(local_device, &dst.buffer);
                if opts.use_gemmk && peer_access {
                    Route::PushDirect
                } else {
                    Route::PushStaged(select_copy_engine(peer_access, opts.use_memcpy_async))
                }
            };
            routes.push(route);
        }

        let push = !opts.use_p2p_read;
        let needs_staging = push
            && routes
                .iter()
                .any(|r| matches!(r, Route::PushStaged(_) | Route::CrossNode));
        let needs_recv = !push && routes.iter().any(|r| *r == Route::CrossNode);
        let matrix_bytes = args.m * args.n * args.output_dtype.size_in_bytes();
        let flag_bytes = program.num_slots * FLAG_BYTES;

        let mut args_ws = RegionBuilder::new();
        let descriptors = args_ws.reserve(program.descriptor_bytes());
        let staging = needs_staging.then(|| args_ws.reserve(matrix_bytes));
        let recv = needs_recv.then(|| args_ws.reserve(matrix_bytes));

        let mut barrier_ws = RegionBuilder::new();
        let own_flags = args.barrier_ptrs.is_none().then(|| barrier_ws.reserve(flag_bytes));
        let staging_flags = needs_staging.then(|| barrier_ws.reserve(flag_bytes));
        let recv_flags = needs_recv.then(|| barrier_ws.reserve(flag_bytes));

        Ok(Self {
            topo,
            program,
            routes,
            push,
            descriptors,
            staging,
            recv,
            args_bytes: args_ws.size(),
            own_flags,
            staging_flags,
            recv_flags,
            barrier_bytes: barrier_ws.size(),
        })
    }

    fn spp(&self) -> usize {
        self.program.geometry.slots_per_pair
    }

    fn chunk_rows(&self) -> usize {
        self.program.geometry.chunk_rows
    }

    fn route(&self, rank: usize) -> Route {
        self.routes[self.topo.sub_index_of(rank)]
    }

    /// Flag-guarded regions of `chunk`, in program order.
    pub fn chunk_regions(&self, chunk: usize) -> Vec<ChunkRegion> {
        let g = &self.program.geometry;
        if !g.per_tile_flags {
            return vec![ChunkRegion {
                slot: 0,
                row0: 0,
                rows: g.chunk_rows,
                col0: 0,
                cols: g.n,
            }];
        }
        let mut seen = vec![false; g.tiles_per_chunk()];
        let mut regions = Vec::with_capacity(g.tiles_per_chunk());
        for desc in &self.program.tiles {
            if g.chunk_of(desc) != chunk {
                continue;
            }
            let t = g.local_tile_index(desc);
            if std::mem::replace(&mut seen[t], true) {
                continue;
            }
            let rect = g.tile_rect(desc);
            regions.push(ChunkRegion {
                slot: t,
                row0: rect.row0 - chunk * g.chunk_rows,
                rows: rect.rows,
                col0: rect.col0,
                cols: rect.cols,
            });
        }
        regions
    }

    fn flags_at<B: CollectiveBackend>(
        &self,
        regions: &WorkspaceRegions<B>,
        range: Option<&Range<usize>>,
        what: &str,
    ) -> Result<BarrierArray> {
        let range = range.ok_or_else(|| Error::invalid(format!("plan has no {what} flags")))?;
        B::barrier_array(
            &regions.barrier.buffer,
            regions.barrier.offset + range.start,
            self.program.num_slots,
        )
    }

    /// Flags of `rank` in the sub-group (external or, for self, internal).
    pub fn rank_flags<B: CollectiveBackend>(
        &self,
        args: &GemmReduceScatterArguments<B>,
        regions: &WorkspaceRegions<B>,
        rank: usize,
    ) -> Result<BarrierArray> {
        match args.barrier_buffer(&self.topo, rank)? {
            Some(buf) => B::barrier_array(&buf, 0, self.program.num_slots),
            None if rank == self.topo.rank() => self.flags_at(regions, self.own_flags.as_ref(), "own"),
            None => Err(Error::invalid(format!("no flags for rank {rank}"))),
        }
    }

    pub fn staging_flags<B: CollectiveBackend>(&self, regions: &WorkspaceRegions<B>) -> Result<BarrierArray> {
        self.flags_at(regions, self.staging_flags.as_ref(), "staging")
    }

    pub fn recv_flags<B: CollectiveBackend>(&self, regions: &WorkspaceRegions<B>) -> Result<BarrierArray> {
        self.flags_at(regions, self.recv_flags.as_ref(), "receive")
    }

    fn matrix_at<B: CollectiveBackend>(
        &self,
        args: &GemmReduceScatterArguments<B>,
        regions: &WorkspaceRegions<B>,
        range: Option<&Range<usize>>,
        what: &str,
    ) -> Result<MatrixView<B>> {
        let range = range.ok_or_else(|| Error::invalid(format!("plan has no {what} area")))?;
        Ok(MatrixView::at(
            regions.args.buffer.clone(),
            regions.args.offset + range.start,
            args.output_dtype,
            args.m,
            args.n,
        ))
    }

    pub fn staging_view<B: CollectiveBackend>(
        &self,
        args: &GemmReduceScatterArguments<B>,
        regions: &WorkspaceRegions<B>,
    ) -> Result<MatrixView<B>> {
        self.matrix_at(args, regions, self.staging.as_ref(), "staging")
    }

    pub fn recv_view<B: CollectiveBackend>(
        &self,
        args: &GemmReduceScatterArguments<B>,
        regions: &WorkspaceRegions<B>,
    ) -> Result<MatrixView<B>> {
        self.matrix_at(args, regions, self.recv.as_ref(), "receive")
    }

    /// Epilogue destinations, one per consumer sub-rank.
    pub fn scatter_targets<B: CollectiveBackend>(
        &self,
        args: &GemmReduceScatterArguments<B>,
        regions: &WorkspaceRegions<B>,
    ) -> Result<Vec<ScatterTarget<B>>> {
        let me = self.topo.rank();
        let my_sub = self.topo.sub_rank();
        let own_buffer = args.reduce_buffer(&self.topo, me)?;
        let own_flags = self.rank_flags(args, regions, me)?;
        let chunk = self.chunk_rows();
        let spp = self.spp();

        let mut targets = Vec::with_capacity(self.routes.len());
        for (c_sub, route) in self.routes.iter().enumerate() {
            let consumer = self.topo.group_rank(c_sub);
            let staged = matches!(route, Route::PushStaged(_))
                || (*route == Route::CrossNode && self.push);
            let target = if staged {
                ScatterTarget {
                    dst: self.staging_view(args, regions)?,
                    row_base: c_sub * chunk,
                    flag: Some(FlagTarget {
                        barrier: self.staging_flags(regions)?,
                        slot_base: c_sub * spp,
                    }),
                }
            } else if *route == Route::PushDirect {
                ScatterTarget {
                    dst: args.reduce_buffer(&self.topo, consumer)?,
                    row_base: my_sub * chunk,
                    flag: Some(FlagTarget {
                        barrier: self.rank_flags(args, regions, consumer)?,
                        slot_base: my_sub * spp,
                    }),
                }
            } else {
                // Local, pull, and cross-node pull all land in our own buffer
                // at the chunk's natural rows.
                ScatterTarget {
                    dst: own_buffer.clone(),
                    row_base: c_sub * chunk,
                    flag: Some(FlagTarget {
                        barrier: own_flags.clone(),
                        slot_base: c_sub * spp,
                    }),
                }
            };
            targets.push(target);
        }
        Ok(targets)
    }

    /// For each segment, the (target, slot) flags whose last tile it holds.
    fn segment_flags(&self) -> Vec<Vec<(usize, usize)>> {
        let g = &self.program.geometry;
        let mut last_segment: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        for (i, seg) in self.program.segments.iter().enumerate() {
            for desc in &self.program.tiles[seg.tiles.clone()] {
                let c_sub = self.topo.sub_index_of(desc.consumer_rank as usize);
                last_segment.insert((c_sub, g.slot_in_pair(desc)), i);
            }
        }
        let mut per_segment = vec![Vec::new(); self.program.segments.len()];
        for ((c_sub, slot), seg) in last_segment {
            per_segment[seg].push((c_sub, slot));
        }
        per_segment
    }
}

// ---- Kernel adapter ----

/// Adapter turning [`RsGemmArguments`] into a scatter-epilogue kernel launch.
pub struct RsGemmImpl<K> {
    kernel: K,
}

impl<K> RsGemmImpl<K> {
    pub fn new(kernel: K) -> Self {
        Self { kernel }
    }
}

fn rs_args<'a, 'b, B: CollectiveBackend>(
    args: &'b GemmArguments<'a, B>,
) -> Result<&'b RsGemmArguments<'a, B>> {
    match args {
        GemmArguments::ReduceScatter(a) => Ok(a),
        other => Err(Error::invalid(format!(
            "ReduceScatter adapter received {:?} arguments",
            other.kind()
        ))),
    }
}

impl<B, K> GemmImpl<B> for RsGemmImpl<K>
where
    B: CollectiveBackend,
    K: GemmKernel<B>,
{
    type Kernel = K;

    fn kind(&self) -> GemmKind {
        GemmKind::ReduceScatter
    }

    fn kernel(&self) -> &K {
        &self.kernel
    }

    fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    fn get_args_workspace_size(&self, args: &GemmArguments<'_, B>) -> Result<usize> {
        let a = rs_args(args)?;
        Ok(RsPlan::new(a.args, self.kernel.hparams().tile_shape)?.args_bytes)
    }

    fn get_barrier_workspace_size(&self, args: &GemmArguments<'_, B>) -> Result<usize> {
        let a = rs_args(args)?;
        Ok(RsPlan::new(a.args, self.kernel.hparams().tile_shape)?.barrier_bytes)
    }

    fn initialize_args_workspace(
        &self,
        args: &GemmArguments<'_, B>,
        regions: &WorkspaceRegions<B>,
        stream: &B::Stream,
    ) -> Result<()> {
        let a = rs_args(args)?;
        let plan = RsPlan::new(a.args, self.kernel.hparams().tile_shape)?;
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
        let a = rs_args(args)?;
        let rs = a.args;
        let plan = RsPlan::new(rs, self.kernel.hparams().tile_shape)?;
        let (m, n, k) = (rs.m, rs.n, rs.k);

        let mut targets = plan.scatter_targets(rs, regions)?;
        if !a.raise_flags {
            for t in &mut targets {
                t.flag = None;
            }
        }
        let range = match a.segment {
            Some(i) => plan
                .program
                .segments
                .get(i)
                .map(|s| s.tiles.clone())
                .ok_or_else(|| Error::invalid(format!("segment {i} out of range")))?,
            None => 0..plan.program.len(),
        };

        // scaleD and abs_max_D belong to the reduced result, not the partials.
        let mut scales = rs.scales();
        scales.d = None;
        let mut epilogue = Epilogue::linear(rs.alpha, rs.beta);
        epilogue.scales = scales;
        if plan.topo.sub_rank() == 0 {
            epilogue.bias = rs.bias.clone().map(|b| MatrixView::new(b, rs.output_dtype, 1, n));
            epilogue.vector = rs
                .vector
                .clone()
                .map(|v| MatrixView::new(v, rs.output_dtype, 1, n));
        }
        epilogue.aux = rs.aux.clone().map(|x| MatrixView::new(x, rs.aux_dtype, m, n));
        epilogue.abs_max_aux = rs.abs_max_aux.clone().map(BufferView::new);

        Ok(KernelArguments {
            shape: rs.shape(),
            a: MatrixView::new(rs.input.clone(), rs.input_dtype, m, k),
            b: MatrixView::new(rs.weight.clone(), rs.input_dtype, k, n),
            epilogue,
            accumulator: None,
            program: ProgramView {
                descriptors: regions.args.advance(plan.descriptors.start),
                range,
                geometry: plan.program.geometry,
            },
            wait: None,
            output: KernelOutput::Scatter {
                group_base: plan.topo.group_base(),
                targets,
            },
            epoch: a.epoch,
            avail_sms: rs.avail_sms,
        })
    }
}

// ---- Driver ----

/// Fused GEMM + reduce-scatter operator for one rank.
pub struct GemmReduceScatter<B: CollectiveBackend> {
    gemm: Box<dyn GemmOperator<B>>,
    epoch: LaunchEpoch,
}

impl<B: CollectiveBackend> GemmReduceScatter<B> {
    /// # Errors
    /// Returns `InvalidConfiguration` if `gemm` is not a reduce-scatter adapter.
    pub fn new(gemm: Box<dyn GemmOperator<B>>) -> Result<Self> {
        if gemm.kind() != GemmKind::ReduceScatter {
            return Err(Error::invalid(format!(
                "{} is a {:?} operator, not ReduceScatter",
                gemm.name(),
                gemm.kind()
            )));
        }
        Ok(Self {
            gemm,
            epoch: LaunchEpoch::new(),
        })
    }

    /// Pick an adapter from `registry`.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if no matching operator is registered.
    pub fn from_registry(
        registry: &OpRegistry<B>,
        input_dtype: crate::DType,
        output_dtype: crate::DType,
        flavor: KernelFlavor,
        hparams: Option<&UnifiedGemmHParams>,
    ) -> Result<Self> {
        let meta = GemmMeta::new(GemmKind::ReduceScatter, input_dtype, output_dtype, flavor);
        Self::new(registry.get_op(&meta, hparams)?)
    }

    fn gemm_args<'a>(
        args: &'a GemmReduceScatterArguments<B>,
        epoch: u32,
        segment: Option<usize>,
        raise_flags: bool,
    ) -> GemmArguments<'a, B> {
        GemmArguments::ReduceScatter(RsGemmArguments {
            args,
            epoch,
            segment,
            raise_flags,
        })
    }

    /// # Errors
    /// Returns `InvalidConfiguration` if the arguments are invalid.
    pub fn get_workspace_size(&self, args: &GemmReduceScatterArguments<B>) -> Result<usize> {
        self.gemm.get_workspace_size(&Self::gemm_args(args, 0, None, true))
    }

    /// # Errors
    /// Returns `InvalidConfiguration` if the arguments are invalid.
    pub fn get_barrier_workspace_size(&self, args: &GemmReduceScatterArguments<B>) -> Result<usize> {
        self.gemm
            .get_barrier_workspace_size(&Self::gemm_args(args, 0, None, true))
    }

    pub fn get_runtime_gemm_hparams(&self) -> UnifiedGemmHParams {
        self.gemm.get_runtime_gemm_hparams()
    }

    /// Epoch of the most recent launch.
    pub fn epoch(&self) -> u32 {
        self.epoch.current()
    }

    /// Enqueue one GEMM-RS launch.
    ///
    /// All configuration and workspace errors are returned before anything
    /// is enqueued. On return the launch stream is ordered after the
    /// reducer; the caller synchronizes.
    ///
    /// # Errors
    /// `InvalidConfiguration`, `WorkspaceTooSmall` or `KernelRejected` for
    /// bad arguments; backend errors from enqueueing.
    pub fn run(
        &mut self,
        args: &GemmReduceScatterArguments<B>,
        workspace: &B::Buffer,
        stream: &B::Stream,
        launch_with_pdl: bool,
    ) -> Result<()> {
        check_pdl(launch_with_pdl, self.gemm.supports_pdl(), &self.gemm.name())?;
        let plan = RsPlan::new(args, self.gemm.get_runtime_gemm_hparams().tile_shape)?;
        let layout = self.gemm.workspace_layout(&Self::gemm_args(args, 0, None, true))?;
        if workspace.len_bytes() < layout.total {
            return Err(Error::WorkspaceTooSmall {
                required: layout.total,
                provided: workspace.len_bytes(),
            });
        }
        let regions = WorkspaceRegions::new(workspace, layout);
        let opts = args.options();
        let epoch = self.epoch.next();

        let rs_stream = args
            .reduce_scatter_args
            .rs_stream
            .clone()
            .unwrap_or_else(|| stream.clone());
        let barrier_stream = args
            .reduce_scatter_args
            .barrier_stream
            .clone()
            .unwrap_or_else(|| rs_stream.clone());

        debug!(
            rank = plan.topo.rank(),
            epoch,
            tiles = plan.program.len(),
            routes = ?plan.routes,
            barrier_queue = opts.use_barrier_queue,
            "gemm_rs launch"
        );

        let start = args
            .reduce_scatter_args
            .event
            .clone()
            .unwrap_or_else(|| stream.create_event());
        stream.record(&start)?;
        if !rs_stream.same_queue(stream) {
            rs_stream.wait_event(&start)?;
        }
        if opts.use_barrier_queue && !barrier_stream.same_queue(stream) && !barrier_stream.same_queue(&rs_stream) {
            barrier_stream.wait_event(&start)?;
        }
        if opts.use_barrier_queue {
            self.run_gemm_queued(args, &plan, &regions, workspace, stream, &barrier_stream, epoch, launch_with_pdl)?;
        } else {
            self.gemm.run_with_args(
                &Self::gemm_args(args, epoch, None, true),
                workspace,
                stream,
                launch_with_pdl,
            )?;
        }

        Self::enqueue_transfers(args, &plan, &regions, &rs_stream, epoch)?;
        Self::enqueue_reduce(args, &plan, &regions, &rs_stream, epoch)?;

        if !rs_stream.same_queue(stream) {
            let done = rs_stream.create_event();
            rs_stream.record(&done)?;
            stream.wait_event(&done)?;
        }
        if opts.use_barrier_queue && !barrier_stream.same_queue(stream) && !barrier_stream.same_queue(&rs_stream) {
            let done = barrier_stream.create_event();
            barrier_stream.record(&done)?;
            stream.wait_event(&done)?;
        }
        Ok(())
    }

    /// One GEMM launch per program segment; flags follow on the barrier
    /// stream once the segment's event fires.
    #[allow(clippy::too_many_arguments)]
    fn run_gemm_queued(
        &mut self,
        args: &GemmReduceScatterArguments<B>,
        plan: &RsPlan,
        regions: &WorkspaceRegions<B>,
        workspace: &B::Buffer,
        stream: &B::Stream,
        barrier_stream: &B::Stream,
        epoch: u32,
        launch_with_pdl: bool,
    ) -> Result<()> {
        let targets = plan.scatter_targets(args, regions)?;
        for (i, flags) in plan.segment_flags().into_iter().enumerate() {
            self.gemm.run_with_args(
                &Self::gemm_args(args, epoch, Some(i), false),
                workspace,
                stream,
                launch_with_pdl,
            )?;
            let event = stream.create_event();
            stream.record(&event)?;
            barrier_stream.wait_event(&event)?;

            let mut by_consumer: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for (c_sub, slot) in flags {
                by_consumer.entry(c_sub).or_default().push(slot);
            }
            for (c_sub, slots) in by_consumer {
                if let Some(flag) = &targets[c_sub].flag {
                    let words = slots.into_iter().map(|s| flag.slot_base + s).collect();
                    B::signal(barrier_stream, &flag.barrier, words, epoch)?;
                }
            }
            trace!(segment = i, epoch, "queued segment flags");
        }
        Ok(())
    }

    /// Staged copies and cross-node sends, then cross-node receives.
    fn enqueue_transfers(
        args: &GemmReduceScatterArguments<B>,
        plan: &RsPlan,
        regions: &WorkspaceRegions<B>,
        rs_stream: &B::Stream,
        epoch: u32,
    ) -> Result<()> {
        let topo = &plan.topo;
        let me = topo.rank();
        let my_sub = topo.sub_rank();
        let chunk = plan.chunk_rows();
        let spp = plan.spp();
        let opts = args.options();
        let s = topo.sub_world_size();
        let own_buffer = args.reduce_buffer(topo, me)?;

        for step in 1..s {
            let consumer = topo.step_peer(step, opts.use_1d_ring);
            let c_sub = topo.sub_index_of(consumer);
            match plan.route(consumer) {
                Route::PushStaged(engine) => {
                    let staging = plan.staging_view(args, regions)?;
                    let staging_flags = plan.staging_flags(regions)?;
                    let dst = args.reduce_buffer(topo, consumer)?;
                    let dst_flags = plan.rank_flags(args, regions, consumer)?;
                    for r in plan.chunk_regions(c_sub) {
                        let src_slot = c_sub * spp + r.slot;
                        B::wait(rs_stream, &staging_flags, vec![src_slot], epoch)?;
                        B::copy_2d(
                            rs_stream,
                            &staging.sub(c_sub * chunk + r.row0, r.rows, r.col0, r.cols),
                            &dst.sub(my_sub * chunk + r.row0, r.rows, r.col0, r.cols),
                            engine,
                        )?;
                        B::signal(rs_stream, &dst_flags, vec![my_sub * spp + r.slot], epoch)?;
                        B::consume(rs_stream, &staging_flags, vec![src_slot], epoch)?;
                    }
                }
                Route::CrossNode => {
                    let comm = Self::comm(args)?;
                    let (src, src_flags) = if plan.push {
                        (plan.staging_view(args, regions)?, plan.staging_flags(regions)?)
                    } else {
                        (own_buffer.clone(), plan.rank_flags(args, regions, me)?)
                    };
                    for r in plan.chunk_regions(c_sub) {
                        let src_slot = c_sub * spp + r.slot;
                        B::wait(rs_stream, &src_flags, vec![src_slot], epoch)?;
                        B::comm_send(
                            rs_stream,
                            comm,
                            consumer,
                            transfer_tag(epoch, r.slot),
                            &src.sub(c_sub * chunk + r.row0, r.rows, r.col0, r.cols),
                        )?;
                        B::consume(rs_stream, &src_flags, vec![src_slot], epoch)?;
                    }
                }
                Route::Local | Route::Pull | Route::PushDirect => {}
            }
        }

        for step in 1..s {
            let producer = topo.step_source(step, opts.use_1d_ring);
            if topo.is_same_node(producer) {
                continue;
            }
            let comm = Self::comm(args)?;
            let p_sub = topo.sub_index_of(producer);
            let (dst, dst_flags) = if plan.push {
                (own_buffer.clone(), plan.rank_flags(args, regions, me)?)
            } else {
                (plan.recv_view(args, regions)?, plan.recv_flags(regions)?)
            };
            for r in plan.chunk_regions(my_sub) {
                B::comm_recv(
                    rs_stream,
                    comm,
                    producer,
                    transfer_tag(epoch, r.slot),
                    &dst.sub(p_sub * chunk + r.row0, r.rows, r.col0, r.cols),
                )?;
                B::signal(rs_stream, &dst_flags, vec![p_sub * spp + r.slot], epoch)?;
            }
        }
        Ok(())
    }

    fn comm(args: &GemmReduceScatterArguments<B>) -> Result<&B::Comm> {
        args.reduce_scatter_args
            .opaque
            .as_ref()
            .ok_or_else(|| Error::invalid("cross-node transfer without an opaque communicator"))
    }

    /// Wait for every producer's partial of each region, then sum them in
    /// ring order into this rank's output shard.
    fn enqueue_reduce(
        args: &GemmReduceScatterArguments<B>,
        plan: &RsPlan,
        regions: &WorkspaceRegions<B>,
        rs_stream: &B::Stream,
        epoch: u32,
    ) -> Result<()> {
        let topo = &plan.topo;
        let me = topo.rank();
        let my_sub = topo.sub_rank();
        let chunk = plan.chunk_rows();
        let spp = plan.spp();
        let s = topo.sub_world_size();
        let push = plan.push;

        // (matrix, row base, flags, slot base) per producer, in ring order.
        let mut sources = Vec::with_capacity(s);
        for p_sub in ring_order(my_sub, s) {
            let producer = topo.group_rank(p_sub);
            let source = if producer == me || push {
                (
                    args.reduce_buffer(topo, me)?,
                    p_sub * chunk,
                    plan.rank_flags(args, regions, me)?,
                    p_sub * spp,
                )
            } else if topo.is_same_node(producer) {
                (
                    args.reduce_buffer(topo, producer)?,
                    my_sub * chunk,
                    plan.rank_flags(args, regions, producer)?,
                    my_sub * spp,
                )
            } else {
                (
                    plan.recv_view(args, regions)?,
                    p_sub * chunk,
                    plan.recv_flags(regions)?,
                    p_sub * spp,
                )
            };
            sources.push(source);
        }

        let output = MatrixView::new(
            crate::args::resolve_ptr(&args.output_scatter_ptrs, topo, me, "output_scatter_ptrs")?.clone(),
            args.output_dtype,
            chunk,
            args.n,
        );
        let scale = args.scale_d.clone().map(BufferView::new);
        let abs_max = args.abs_max_d.clone().map(BufferView::new);
        let num_blocks = args.options().reduce_scatter_num_blocks;

        for r in plan.chunk_regions(my_sub) {
            for (_, _, flags, base) in &sources {
                B::wait(rs_stream, flags, vec![base + r.slot], epoch)?;
            }
            B::reduce(
                rs_stream,
                ReduceArgs {
                    sources: sources
                        .iter()
                        .map(|(m, row_base, _, _)| m.sub(row_base + r.row0, r.rows, r.col0, r.cols))
                        .collect(),
                    output: output.sub(r.row0, r.rows, r.col0, r.cols),
                    num_blocks,
                    scale: scale.clone(),
                    abs_max: abs_max.clone(),
                },
            )?;
            for (_, _, flags, base) in &sources {
                B::consume(rs_stream, flags, vec![base + r.slot], epoch)?;
            }
        }
        trace!(rank = me, epoch, regions = plan.chunk_regions(my_sub).len(), "reduce enqueued");
        Ok(())
    }
}
