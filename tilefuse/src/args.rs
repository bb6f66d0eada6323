//! Operator-level argument structures and their host-side validation.
//!
//! Pointer arrays (`output_scatter_ptrs`, `reduce_buffer_ptrs`,
//! `barrier_ptrs`, ...) may hold either `world_size` entries indexed by
//! global rank or `sub_world_size` entries indexed by sub-rank.

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, BufferView, DeviceBuffer, MatrixView, Scales};
use crate::kernel::check_fp8_scales;
use crate::schedule::GemmShape;
use crate::topology::Topology;
use crate::{DType, Error, Result};

/// Reducer block cap used when none is configured.
pub const DEFAULT_REDUCE_SCATTER_NUM_BLOCKS: usize = 12;

fn default_num_blocks() -> usize {
    DEFAULT_REDUCE_SCATTER_NUM_BLOCKS
}

fn default_one() -> usize {
    1
}

fn default_true() -> bool {
    true
}

// ---- Reduce-scatter ----

/// Reduce-scatter policy knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceScatterOptions {
    /// Upper bound on reducer blocks.
    #[serde(default = "default_num_blocks")]
    pub reduce_scatter_num_blocks: usize,

    /// Move flag writes to a separate barrier stream, launching the GEMM
    /// once per program segment.
    #[serde(default)]
    pub use_barrier_queue: bool,

    /// Let the GEMM epilogue write straight into the consumer's slot.
    #[serde(default = "default_true")]
    pub use_gemmk: bool,

    /// One flag per tile (true) or per (producer, consumer) pair (false).
    #[serde(default = "default_true")]
    pub per_tile_flags: bool,

    /// Use the memcpy engine when the peer is not directly addressable.
    #[serde(default, alias = "use_cudaMemcpyAsync")]
    pub use_memcpy_async: bool,

    /// N-axis strip factor.
    #[serde(default = "default_one")]
    pub n_split: usize,

    #[serde(default = "default_one")]
    pub sub_world_size: usize,

    /// Ring routing (true) or the two-level node swizzle (false).
    #[serde(default = "default_true")]
    pub use_1d_ring: bool,

    /// Consumers pull from producers (true) or producers push (false).
    #[serde(default = "default_true")]
    pub use_p2p_read: bool,
}

impl Default for ReduceScatterOptions {
    fn default() -> Self {
        Self {
            reduce_scatter_num_blocks: DEFAULT_REDUCE_SCATTER_NUM_BLOCKS,
            use_barrier_queue: false,
            use_gemmk: true,
            per_tile_flags: true,
            use_memcpy_async: false,
            n_split: 1,
            sub_world_size: 1,
            use_1d_ring: true,
            use_p2p_read: true,
        }
    }
}

/// Reduce-scatter options plus the runtime handles that cannot be serialized.
#[derive(Clone)]
pub struct ReduceScatterArguments<B: Backend> {
    pub options: ReduceScatterOptions,
    /// Stream for copies and the reducer; the launch stream if absent.
    pub rs_stream: Option<B::Stream>,
    /// Event recorded on the launch stream before the GEMM; created if absent.
    pub event: Option<B::Event>,
    /// Stream for flag writes under `use_barrier_queue`.
    pub barrier_stream: Option<B::Stream>,
    /// Channel for peers on other nodes.
    pub opaque: Option<B::Comm>,
}

impl<B: Backend> Default for ReduceScatterArguments<B> {
    fn default() -> Self {
        Self::from_options(ReduceScatterOptions::default())
    }
}

impl<B: Backend> ReduceScatterArguments<B> {
    pub fn from_options(options: ReduceScatterOptions) -> Self {
        Self {
            options,
            rs_stream: None,
            event: None,
            barrier_stream: None,
            opaque: None,
        }
    }
}

/// Arguments of a GEMM-RS launch on one rank.
///
/// `input` is this rank's `m x k` slice, `weight` its `k x n` slice. Every
/// rank produces a full `m x n` partial; afterwards `output_scatter[rank]`
/// holds the `m / sub_world_size` row band of the sum owned by this rank.
#[derive(Clone)]
pub struct GemmReduceScatterArguments<B: Backend> {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub rank: usize,
    pub world_size: usize,
    pub nnodes: usize,
    pub alpha: f32,
    pub beta: f32,
    pub input: B::Buffer,
    pub weight: B::Buffer,
    /// `1 x n` in the output dtype.
    pub bias: Option<B::Buffer>,
    /// `m / sub_world_size x n` per rank.
    pub output_scatter_ptrs: Vec<B::Buffer>,
    /// `m x n` per rank.
    pub reduce_buffer_ptrs: Vec<B::Buffer>,
    /// Flag words per rank; internal flags are used when absent.
    pub barrier_ptrs: Option<Vec<B::Buffer>>,
    pub avail_sms: i32,
    /// `m x n` copy of this rank's partial, in `aux_dtype`.
    pub aux: Option<B::Buffer>,
    /// `1 x n` added after the bias, in the output dtype.
    pub vector: Option<B::Buffer>,
    pub abs_max_aux: Option<B::Buffer>,
    pub abs_max_d: Option<B::Buffer>,
    pub scale_a: Option<B::Buffer>,
    pub scale_b: Option<B::Buffer>,
    pub scale_c: Option<B::Buffer>,
    /// Required if D is fp8.
    pub scale_d: Option<B::Buffer>,
    /// Required if Aux is fp8.
    pub scale_aux: Option<B::Buffer>,
    pub input_dtype: DType,
    pub output_dtype: DType,
    pub aux_dtype: DType,
    pub reduce_scatter_args: ReduceScatterArguments<B>,
}

impl<B: Backend> GemmReduceScatterArguments<B> {
    /// Arguments with default policy and every optional tensor absent.
    pub fn new(
        shape: GemmShape,
        rank: usize,
        world_size: usize,
        nnodes: usize,
        dtype: DType,
        input: B::Buffer,
        weight: B::Buffer,
    ) -> Self {
        Self {
            m: shape.m,
            n: shape.n,
            k: shape.k,
            rank,
            world_size,
            nnodes,
            alpha: 1.0,
            beta: 0.0,
            input,
            weight,
            bias: None,
            output_scatter_ptrs: Vec::new(),
            reduce_buffer_ptrs: Vec::new(),
            barrier_ptrs: None,
            avail_sms: -1,
            aux: None,
            vector: None,
            abs_max_aux: None,
            abs_max_d: None,
            scale_a: None,
            scale_b: None,
            scale_c: None,
            scale_d: None,
            scale_aux: None,
            input_dtype: dtype,
            output_dtype: dtype,
            aux_dtype: dtype,
            reduce_scatter_args: ReduceScatterArguments::default(),
        }
    }

    pub fn shape(&self) -> GemmShape {
        GemmShape::new(self.m, self.n, self.k)
    }

    pub fn options(&self) -> &ReduceScatterOptions {
        &self.reduce_scatter_args.options
    }

    pub fn topology(&self) -> Result<Topology> {
        Topology::new(
            self.rank,
            self.world_size,
            self.nnodes,
            self.options().sub_world_size,
        )
    }

    pub fn scales(&self) -> Scales<B> {
        Scales {
            a: self.scale_a.clone().map(BufferView::new),
            b: self.scale_b.clone().map(BufferView::new),
            c: self.scale_c.clone().map(BufferView::new),
            d: self.scale_d.clone().map(BufferView::new),
            aux: self.scale_aux.clone().map(BufferView::new),
        }
    }

    /// Reduce buffer of `rank` viewed as `m x n`.
    pub fn reduce_buffer(&self, topo: &Topology, rank: usize) -> Result<MatrixView<B>> {
        let buf = resolve_ptr(&self.reduce_buffer_ptrs, topo, rank, "reduce_buffer_ptrs")?;
        Ok(MatrixView::new(buf.clone(), self.output_dtype, self.m, self.n))
    }

    /// Flag buffer of `rank`, if flags are external.
    pub fn barrier_buffer(&self, topo: &Topology, rank: usize) -> Result<Option<B::Buffer>> {
        self.barrier_ptrs
            .as_ref()
            .map(|ptrs| resolve_ptr(ptrs, topo, rank, "barrier_ptrs").cloned())
            .transpose()
    }

    /// Check everything that can be checked before launch.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` for any unsupported combination.
    pub fn validate(&self) -> Result<Topology> {
        let topo = self.topology()?;
        let opts = self.options();
        let s = topo.sub_world_size();
        if self.m == 0 || self.n == 0 || self.k == 0 {
            return Err(Error::invalid(format!(
                "empty problem {}x{}x{}",
                self.m, self.n, self.k
            )));
        }
        if self.m % s != 0 {
            return Err(Error::invalid(format!(
                "sub_world_size {s} does not divide m {}",
                self.m
            )));
        }
        if opts.reduce_scatter_num_blocks == 0 {
            return Err(Error::invalid("reduce_scatter_num_blocks must be at least 1"));
        }
        if opts.n_split == 0 {
            return Err(Error::invalid("n_split must be at least 1"));
        }
        if self.output_dtype.is_fp8() {
            return Err(Error::invalid(
                "fp8 output is not supported for reduce-scatter partials",
            ));
        }
        let aux_dtype = self.aux.as_ref().map(|_| self.aux_dtype);
        check_fp8_scales(self.input_dtype, self.output_dtype, aux_dtype, &self.scales())?;

        check_ptr_array(self.output_scatter_ptrs.len(), &topo, "output_scatter_ptrs")?;
        check_ptr_array(self.reduce_buffer_ptrs.len(), &topo, "reduce_buffer_ptrs")?;

        let (m, n, k) = (self.m, self.n, self.k);
        let isz = self.input_dtype.size_in_bytes();
        let osz = self.output_dtype.size_in_bytes();
        check_len(&self.input, m * k * isz, "input")?;
        check_len(&self.weight, k * n * isz, "weight")?;
        check_len(
            resolve_ptr(&self.output_scatter_ptrs, &topo, topo.rank(), "output_scatter_ptrs")?,
            (m / s) * n * osz,
            "output_scatter",
        )?;
        for sub in 0..s {
            let rank = topo.group_rank(sub);
            check_len(
                resolve_ptr(&self.reduce_buffer_ptrs, &topo, rank, "reduce_buffer_ptrs")?,
                m * n * osz,
                "reduce_buffer",
            )?;
        }
        for (buf, what) in [(&self.bias, "bias"), (&self.vector, "vector")] {
            if let Some(buf) = buf {
                check_len(buf, n * osz, what)?;
            }
        }
        if let Some(aux) = &self.aux {
            check_len(aux, m * n * self.aux_dtype.size_in_bytes(), "aux")?;
        }
        check_scalars(&[
            (&self.scale_a, "scaleA"),
            (&self.scale_b, "scaleB"),
            (&self.scale_c, "scaleC"),
            (&self.scale_d, "scaleD"),
            (&self.scale_aux, "scaleAux"),
            (&self.abs_max_d, "abs_max_D"),
            (&self.abs_max_aux, "abs_max_Aux"),
        ])?;

        match &self.barrier_ptrs {
            Some(ptrs) => check_ptr_array(ptrs.len(), &topo, "barrier_ptrs")?,
            None if s > 1 => {
                return Err(Error::invalid(
                    "barrier_ptrs are required when peers observe the flags (sub_world_size > 1)",
                ));
            }
            None => {}
        }

        let crosses_nodes = (0..s).any(|i| !topo.is_same_node(topo.group_rank(i)));
        if crosses_nodes && self.reduce_scatter_args.opaque.is_none() {
            return Err(Error::invalid(
                "sub-group spans nodes but no opaque communicator was given",
            ));
        }
        Ok(topo)
    }
}

// ---- All-gather ----

/// All-gather policy knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllGatherOptions {
    #[serde(default = "default_true")]
    pub use_1d_ring: bool,

    /// Each rank copies shards into its own gathered buffer (true), or each
    /// rank writes its shard into its peers' buffers (false).
    #[serde(default = "default_true")]
    pub use_p2p_read: bool,

    /// One flag per M tile band (true) or per shard (false).
    #[serde(default = "default_true")]
    pub per_tile_flags: bool,

    #[serde(default, alias = "use_cudaMemcpyAsync")]
    pub use_memcpy_async: bool,

    #[serde(default = "default_one")]
    pub n_split: usize,

    #[serde(default = "default_one")]
    pub sub_world_size: usize,
}

impl Default for AllGatherOptions {
    fn default() -> Self {
        Self {
            use_1d_ring: true,
            use_p2p_read: true,
            per_tile_flags: true,
            use_memcpy_async: false,
            n_split: 1,
            sub_world_size: 1,
        }
    }
}

/// All-gather options plus runtime handles.
#[derive(Clone)]
pub struct AllGatherArguments<B: Backend> {
    pub options: AllGatherOptions,
    /// Stream for gather copies; the launch stream if absent.
    pub ag_stream: Option<B::Stream>,
    pub opaque: Option<B::Comm>,
}

impl<B: Backend> Default for AllGatherArguments<B> {
    fn default() -> Self {
        Self::from_options(AllGatherOptions::default())
    }
}

impl<B: Backend> AllGatherArguments<B> {
    pub fn from_options(options: AllGatherOptions) -> Self {
        Self {
            options,
            ag_stream: None,
            opaque: None,
        }
    }
}

/// Arguments of an AG-GEMM launch on one rank.
///
/// A is sharded along K: `input_ptrs[r]` is rank r's `m x k/S` shard and
/// `gathered_ptrs[r]` its `m x k` gathered copy. Every rank computes the
/// full `m x n` output from its gathered A and the `k x n` weight.
#[derive(Clone)]
pub struct AllGatherGemmArguments<B: Backend> {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub rank: usize,
    pub world_size: usize,
    pub nnodes: usize,
    pub alpha: f32,
    pub beta: f32,
    pub input_ptrs: Vec<B::Buffer>,
    pub gathered_ptrs: Vec<B::Buffer>,
    pub weight: B::Buffer,
    pub bias: Option<B::Buffer>,
    pub vector: Option<B::Buffer>,
    pub output: B::Buffer,
    pub aux: Option<B::Buffer>,
    /// Required when shards are pushed; internal flags are used otherwise.
    pub barrier_ptrs: Option<Vec<B::Buffer>>,
    /// Word `s` is raised after the GEMM of step `s`.
    pub step_signal: Option<B::Buffer>,
    pub avail_sms: i32,
    pub abs_max_d: Option<B::Buffer>,
    pub abs_max_aux: Option<B::Buffer>,
    pub scale_a: Option<B::Buffer>,
    pub scale_b: Option<B::Buffer>,
    pub scale_c: Option<B::Buffer>,
    pub scale_d: Option<B::Buffer>,
    pub scale_aux: Option<B::Buffer>,
    pub input_dtype: DType,
    pub output_dtype: DType,
    pub aux_dtype: DType,
    pub all_gather_args: AllGatherArguments<B>,
}

impl<B: Backend> AllGatherGemmArguments<B> {
    /// Arguments with default policy and every optional tensor absent.
    pub fn new(
        shape: GemmShape,
        rank: usize,
        world_size: usize,
        nnodes: usize,
        dtype: DType,
        weight: B::Buffer,
        output: B::Buffer,
    ) -> Self {
        Self {
            m: shape.m,
            n: shape.n,
            k: shape.k,
            rank,
            world_size,
            nnodes,
            alpha: 1.0,
            beta: 0.0,
            input_ptrs: Vec::new(),
            gathered_ptrs: Vec::new(),
            weight,
            bias: None,
            vector: None,
            output,
            aux: None,
            barrier_ptrs: None,
            step_signal: None,
            avail_sms: -1,
            abs_max_d: None,
            abs_max_aux: None,
            scale_a: None,
            scale_b: None,
            scale_c: None,
            scale_d: None,
            scale_aux: None,
            input_dtype: dtype,
            output_dtype: dtype,
            aux_dtype: dtype,
            all_gather_args: AllGatherArguments::default(),
        }
    }

    pub fn shape(&self) -> GemmShape {
        GemmShape::new(self.m, self.n, self.k)
    }

    pub fn options(&self) -> &AllGatherOptions {
        &self.all_gather_args.options
    }

    pub fn topology(&self) -> Result<Topology> {
        Topology::new(
            self.rank,
            self.world_size,
            self.nnodes,
            self.options().sub_world_size,
        )
    }

    /// Columns of A per shard.
    pub fn shard_k(&self) -> usize {
        self.k / self.options().sub_world_size.max(1)
    }

    pub fn scales(&self) -> Scales<B> {
        Scales {
            a: self.scale_a.clone().map(BufferView::new),
            b: self.scale_b.clone().map(BufferView::new),
            c: self.scale_c.clone().map(BufferView::new),
            d: self.scale_d.clone().map(BufferView::new),
            aux: self.scale_aux.clone().map(BufferView::new),
        }
    }

    /// Shard of `rank` viewed as `m x k/S`.
    pub fn input_shard(&self, topo: &Topology, rank: usize) -> Result<MatrixView<B>> {
        let buf = resolve_ptr(&self.input_ptrs, topo, rank, "input_ptrs")?;
        Ok(MatrixView::new(buf.clone(), self.input_dtype, self.m, self.shard_k()))
    }

    /// Gathered A of `rank` viewed as `m x k`.
    pub fn gathered(&self, topo: &Topology, rank: usize) -> Result<MatrixView<B>> {
        let buf = resolve_ptr(&self.gathered_ptrs, topo, rank, "gathered_ptrs")?;
        Ok(MatrixView::new(buf.clone(), self.input_dtype, self.m, self.k))
    }

    pub fn barrier_buffer(&self, topo: &Topology, rank: usize) -> Result<Option<B::Buffer>> {
        self.barrier_ptrs
            .as_ref()
            .map(|ptrs| resolve_ptr(ptrs, topo, rank, "barrier_ptrs").cloned())
            .transpose()
    }

    /// # Errors
    /// Returns `InvalidConfiguration` for any unsupported combination.
    pub fn validate(&self) -> Result<Topology> {
        let topo = self.topology()?;
        let opts = self.options();
        let s = topo.sub_world_size();
        if self.m == 0 || self.n == 0 || self.k == 0 {
            return Err(Error::invalid(format!(
                "empty problem {}x{}x{}",
                self.m, self.n, self.k
            )));
        }
        if self.k % s != 0 {
            return Err(Error::invalid(format!(
                "sub_world_size {s} does not divide k {}",
                self.k
            )));
        }
        if opts.n_split == 0 {
            return Err(Error::invalid("n_split must be at least 1"));
        }
        let aux_dtype = self.aux.as_ref().map(|_| self.aux_dtype);
        check_fp8_scales(self.input_dtype, self.output_dtype, aux_dtype, &self.scales())?;

        check_ptr_array(self.input_ptrs.len(), &topo, "input_ptrs")?;
        check_ptr_array(self.gathered_ptrs.len(), &topo, "gathered_ptrs")?;
        let (m, n, k) = (self.m, self.n, self.k);
        let isz = self.input_dtype.size_in_bytes();
        let osz = self.output_dtype.size_in_bytes();
        for sub in 0..s {
            let rank = topo.group_rank(sub);
            check_len(
                resolve_ptr(&self.input_ptrs, &topo, rank, "input_ptrs")?,
                m * self.shard_k() * isz,
                "input shard",
            )?;
            check_len(
                resolve_ptr(&self.gathered_ptrs, &topo, rank, "gathered_ptrs")?,
                m * k * isz,
                "gathered",
            )?;
        }
        check_len(&self.weight, k * n * isz, "weight")?;
        check_len(&self.output, m * n * osz, "output")?;
        for (buf, what) in [(&self.bias, "bias"), (&self.vector, "vector")] {
            if let Some(buf) = buf {
                check_len(buf, n * osz, what)?;
            }
        }
        if let Some(aux) = &self.aux {
            check_len(aux, m * n * self.aux_dtype.size_in_bytes(), "aux")?;
        }
        if let Some(signal) = &self.step_signal {
            check_len(signal, s * std::mem::size_of::<u64>(), "step_signal")?;
        }
        check_scalars(&[
            (&self.scale_a, "scaleA"),
            (&self.scale_b, "scaleB"),
            (&self.scale_c, "scaleC"),
            (&self.scale_d, "scaleD"),
            (&self.scale_aux, "scaleAux"),
            (&self.abs_max_d, "abs_max_D"),
            (&self.abs_max_aux, "abs_max_Aux"),
        ])?;

        match &self.barrier_ptrs {
            Some(ptrs) => check_ptr_array(ptrs.len(), &topo, "barrier_ptrs")?,
            None if !opts.use_p2p_read && s > 1 => {
                return Err(Error::invalid(
                    "barrier_ptrs are required when shards are pushed to peers",
                ));
            }
            None => {}
        }

        let crosses_nodes = (0..s).any(|i| !topo.is_same_node(topo.group_rank(i)));
        if crosses_nodes && self.all_gather_args.opaque.is_none() {
            return Err(Error::invalid(
                "sub-group spans nodes but no opaque communicator was given",
            ));
        }
        Ok(topo)
    }
}

// ---- Plain GEMM ----

/// A single-rank GEMM through the same adapter machinery.
#[derive(Clone)]
pub struct LocalGemmArguments<B: Backend> {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f32,
    pub beta: f32,
    pub input: B::Buffer,
    pub weight: B::Buffer,
    pub bias: Option<B::Buffer>,
    pub output: B::Buffer,
    pub avail_sms: i32,
    pub abs_max_d: Option<B::Buffer>,
    pub scale_a: Option<B::Buffer>,
    pub scale_b: Option<B::Buffer>,
    pub scale_c: Option<B::Buffer>,
    pub scale_d: Option<B::Buffer>,
    pub input_dtype: DType,
    pub output_dtype: DType,
}

impl<B: Backend> LocalGemmArguments<B> {
    pub fn new(
        shape: GemmShape,
        dtype: DType,
        input: B::Buffer,
        weight: B::Buffer,
        output: B::Buffer,
    ) -> Self {
        Self {
            m: shape.m,
            n: shape.n,
            k: shape.k,
            alpha: 1.0,
            beta: 0.0,
            input,
            weight,
            bias: None,
            output,
            avail_sms: -1,
            abs_max_d: None,
            scale_a: None,
            scale_b: None,
            scale_c: None,
            scale_d: None,
            input_dtype: dtype,
            output_dtype: dtype,
        }
    }

    pub fn shape(&self) -> GemmShape {
        GemmShape::new(self.m, self.n, self.k)
    }

    pub fn scales(&self) -> Scales<B> {
        Scales {
            a: self.scale_a.clone().map(BufferView::new),
            b: self.scale_b.clone().map(BufferView::new),
            c: self.scale_c.clone().map(BufferView::new),
            d: self.scale_d.clone().map(BufferView::new),
            aux: None,
        }
    }

    /// # Errors
    /// Returns `InvalidConfiguration` for undersized buffers or missing scales.
    pub fn validate(&self) -> Result<()> {
        let (m, n, k) = (self.m, self.n, self.k);
        if m == 0 || n == 0 || k == 0 {
            return Err(Error::invalid(format!("empty problem {m}x{n}x{k}")));
        }
        check_fp8_scales(self.input_dtype, self.output_dtype, None, &self.scales())?;
        let isz = self.input_dtype.size_in_bytes();
        let osz = self.output_dtype.size_in_bytes();
        check_len(&self.input, m * k * isz, "input")?;
        check_len(&self.weight, k * n * isz, "weight")?;
        check_len(&self.output, m * n * osz, "output")?;
        if let Some(bias) = &self.bias {
            check_len(bias, n * osz, "bias")?;
        }
        check_scalars(&[
            (&self.scale_a, "scaleA"),
            (&self.scale_b, "scaleB"),
            (&self.scale_c, "scaleC"),
            (&self.scale_d, "scaleD"),
            (&self.abs_max_d, "abs_max_D"),
        ])
    }
}

// ---- Helpers ----

/// Pick `rank`'s entry of a world- or sub-world-indexed pointer array.
///
/// # Errors
/// Returns `InvalidConfiguration` if the array has neither length or
/// `rank` is outside the sub-group.
pub fn resolve_ptr<'a, T>(ptrs: &'a [T], topo: &Topology, rank: usize, what: &str) -> Result<&'a T> {
    check_ptr_array(ptrs.len(), topo, what)?;
    if ptrs.len() == topo.world_size() {
        return ptrs
            .get(rank)
            .ok_or_else(|| Error::invalid(format!("{what}: rank {rank} out of range")));
    }
    if !topo.contains(rank) {
        return Err(Error::invalid(format!(
            "{what}: rank {rank} is outside the sub-group"
        )));
    }
    Ok(&ptrs[topo.sub_index_of(rank)])
}

fn check_ptr_array(len: usize, topo: &Topology, what: &str) -> Result<()> {
    if len == topo.world_size() || len == topo.sub_world_size() {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "{what} has {len} entries, expected world_size {} or sub_world_size {}",
            topo.world_size(),
            topo.sub_world_size()
        )))
    }
}

fn check_len<D: DeviceBuffer>(buf: &D, needed: usize, what: &str) -> Result<()> {
    if buf.len_bytes() < needed {
        return Err(Error::invalid(format!(
            "{what} holds {} bytes, needs {needed}",
            buf.len_bytes()
        )));
    }
    Ok(())
}

fn check_scalars<D: DeviceBuffer>(scalars: &[(&Option<D>, &str)]) -> Result<()> {
    for (buf, what) in scalars {
        if let Some(buf) = buf {
            check_len(buf, std::mem::size_of::<f32>(), what)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rs_option_defaults() {
        let opts = ReduceScatterOptions::default();
        assert_eq!(opts.reduce_scatter_num_blocks, 12);
        assert!(opts.use_gemmk && opts.per_tile_flags && opts.use_1d_ring && opts.use_p2p_read);
        assert!(!opts.use_barrier_queue && !opts.use_memcpy_async);
        assert_eq!((opts.n_split, opts.sub_world_size), (1, 1));
    }

    #[test]
    fn test_rs_options_from_partial_json() {
        let opts: ReduceScatterOptions =
            serde_json::from_str(r#"{"sub_world_size": 4, "use_cudaMemcpyAsync": true}"#).unwrap();
        assert_eq!(opts.sub_world_size, 4);
        assert!(opts.use_memcpy_async);
        assert_eq!(opts.reduce_scatter_num_blocks, 12);
        assert!(opts.use_gemmk);
    }

    #[test]
    fn test_ag_option_defaults() {
        let opts: AllGatherOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts, AllGatherOptions::default());
    }

    #[test]
    fn test_resolve_ptr_world_and_sub_indexed() {
        let topo = Topology::new(5, 8, 2, 4).unwrap();
        let world: Vec<usize> = (0..8).collect();
        let sub: Vec<usize> = (100..104).collect();
        assert_eq!(*resolve_ptr(&world, &topo, 6, "x").unwrap(), 6);
        assert_eq!(*resolve_ptr(&sub, &topo, 6, "x").unwrap(), 102);
        assert!(resolve_ptr(&sub, &topo, 1, "x").is_err());
        assert!(resolve_ptr(&[0usize; 3], &topo, 5, "x").is_err());
    }
}
