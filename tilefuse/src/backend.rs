//! Backend trait and op trait definitions.
//!
//! The fused operators are generic over `B: Backend` and express what they
//! need from the device through op traits, the same way models ask for
//! `MatmulOps` or `NormOps`. Every op here *enqueues* work on a stream and
//! returns once it is queued; ordering across streams goes through events.
//!
//! # Design notes
//!
//! - Buffers are cheap, cloneable, peer-visible handles. Views carry a byte
//!   offset plus (for matrices) dtype, shape and leading dimension.
//! - Flag words are exposed as [`BarrierArray`]s so the barrier protocol is
//!   implemented once, in this crate, over whatever memory the backend maps.
//! - Kernels are not an op trait: they are values behind [`GemmKernel`]
//!   registered per instantiation.
//!
//! [`GemmKernel`]: crate::kernel::GemmKernel

use crate::barrier::BarrierArray;
use crate::{DType, Error, Result};

// ---- Core backend trait ----

/// A device backend.
pub trait Backend: Clone + Send + Sync + 'static {
    /// Peer-mapped device allocation.
    type Buffer: DeviceBuffer;

    /// In-order work queue.
    type Stream: StreamOps<Event = Self::Event>;

    /// Marker recorded on one stream and waited on by another.
    type Event: Clone + Send + Sync + 'static;

    /// Host-side collective channel used for transfers between nodes.
    type Comm: Clone + Send + Sync + 'static;
}

/// Handle to device memory. Clones alias the same allocation.
pub trait DeviceBuffer: Clone + Send + Sync + 'static {
    fn len_bytes(&self) -> usize;

    /// Device (rank) that owns the allocation.
    fn device(&self) -> usize;
}

/// An in-order queue of device work.
pub trait StreamOps: Clone + Send + Sync + 'static {
    type Event;

    /// Device this stream executes on.
    fn device(&self) -> usize;

    fn create_event(&self) -> Self::Event;

    /// Enqueue a marker that completes when all prior work on this stream has.
    fn record(&self, event: &Self::Event) -> Result<()>;

    /// Make later work on this stream wait for `event`.
    fn wait_event(&self, event: &Self::Event) -> Result<()>;

    /// Block the host until the stream drains.
    ///
    /// # Errors
    /// Returns `DeviceFailure` (or a backend `Timeout`) if any queued work
    /// failed since the last synchronize.
    fn synchronize(&self) -> Result<()>;

    /// Whether both handles feed the same queue.
    fn same_queue(&self, other: &Self) -> bool;
}

// ---- Views ----

/// A byte offset into a buffer.
#[derive(Clone)]
pub struct BufferView<B: Backend> {
    pub buffer: B::Buffer,
    pub offset: usize,
}

impl<B: Backend> BufferView<B> {
    pub fn new(buffer: B::Buffer) -> Self {
        Self { buffer, offset: 0 }
    }

    pub fn at(buffer: B::Buffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// Bytes from `offset` to the end of the buffer.
    pub fn available(&self) -> usize {
        self.buffer.len_bytes().saturating_sub(self.offset)
    }

    #[must_use]
    pub fn advance(&self, bytes: usize) -> Self {
        Self {
            buffer: self.buffer.clone(),
            offset: self.offset + bytes,
        }
    }
}

/// A row-major 2-D region of a buffer.
#[derive(Clone)]
pub struct MatrixView<B: Backend> {
    pub buffer: B::Buffer,
    pub offset: usize,
    pub dtype: DType,
    pub rows: usize,
    pub cols: usize,
    /// Row stride in elements.
    pub ld: usize,
}

impl<B: Backend> MatrixView<B> {
    /// Densely packed `rows x cols` matrix at the start of `buffer`.
    pub fn new(buffer: B::Buffer, dtype: DType, rows: usize, cols: usize) -> Self {
        Self {
            buffer,
            offset: 0,
            dtype,
            rows,
            cols,
            ld: cols,
        }
    }

    /// Same, starting at byte `offset`.
    pub fn at(buffer: B::Buffer, offset: usize, dtype: DType, rows: usize, cols: usize) -> Self {
        Self {
            offset,
            ..Self::new(buffer, dtype, rows, cols)
        }
    }

    /// Byte offset of element `(row, col)` within the buffer.
    pub fn byte_offset(&self, row: usize, col: usize) -> usize {
        self.offset + (row * self.ld + col) * self.dtype.size_in_bytes()
    }

    /// Sub-matrix view sharing this view's leading dimension.
    ///
    /// # Panics
    /// Panics if the window does not fit inside this view.
    #[must_use]
    pub fn sub(&self, row0: usize, rows: usize, col0: usize, cols: usize) -> Self {
        assert!(
            row0 + rows <= self.rows && col0 + cols <= self.cols,
            "sub-view {row0}+{rows} x {col0}+{cols} exceeds {}x{}",
            self.rows,
            self.cols
        );
        Self {
            buffer: self.buffer.clone(),
            offset: self.byte_offset(row0, col0),
            dtype: self.dtype,
            rows,
            cols,
            ld: self.ld,
        }
    }

    /// Bytes spanned from the first to one past the last element.
    pub fn span_bytes(&self) -> usize {
        if self.rows == 0 || self.cols == 0 {
            return 0;
        }
        ((self.rows - 1) * self.ld + self.cols) * self.dtype.size_in_bytes()
    }

    /// Check the view lies inside its buffer.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` naming `what` if it does not.
    pub fn check_fits(&self, what: &str) -> Result<()> {
        if self.cols > self.ld {
            return Err(Error::invalid(format!(
                "{what}: {} columns exceed leading dimension {}",
                self.cols, self.ld
            )));
        }
        let end = self.offset + self.span_bytes();
        if end > self.buffer.len_bytes() {
            return Err(Error::invalid(format!(
                "{what}: {}x{} {} view needs {end} bytes, buffer has {}",
                self.rows,
                self.cols,
                self.dtype,
                self.buffer.len_bytes()
            )));
        }
        Ok(())
    }
}

/// Per-tensor f32 scale scalars living in device memory.
#[derive(Clone)]
pub struct Scales<B: Backend> {
    pub a: Option<BufferView<B>>,
    pub b: Option<BufferView<B>>,
    pub c: Option<BufferView<B>>,
    pub d: Option<BufferView<B>>,
    pub aux: Option<BufferView<B>>,
}

impl<B: Backend> Default for Scales<B> {
    fn default() -> Self {
        Self {
            a: None,
            b: None,
            c: None,
            d: None,
            aux: None,
        }
    }
}

// ---- Op traits ----

/// How a 2-D copy is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEngine {
    /// Direct load/store through a peer mapping.
    P2p,
    /// The driver's async memcpy engine.
    MemcpyAsync,
    /// A dedicated copy kernel.
    CopyKernel,
}

/// Pick a copy engine: direct peer access when available, otherwise the
/// memcpy engine if requested, otherwise the copy kernel.
#[must_use]
pub fn select_copy_engine(peer_access: bool, use_memcpy_async: bool) -> CopyEngine {
    if peer_access {
        CopyEngine::P2p
    } else if use_memcpy_async {
        CopyEngine::MemcpyAsync
    } else {
        CopyEngine::CopyKernel
    }
}

/// Memory movement.
pub trait MemoryOps: Backend {
    /// Upload host bytes to `dst`.
    fn write_bytes(stream: &Self::Stream, dst: &BufferView<Self>, bytes: Vec<u8>) -> Result<()>;

    /// Zero `len` bytes at `dst`.
    fn fill_zero(stream: &Self::Stream, dst: &BufferView<Self>, len: usize) -> Result<()>;

    /// Copy `src` into `dst` (same dtype and shape).
    fn copy_2d(
        stream: &Self::Stream,
        src: &MatrixView<Self>,
        dst: &MatrixView<Self>,
        engine: CopyEngine,
    ) -> Result<()>;

    /// Whether kernels running on `device` can load/store `buffer` directly.
    fn can_access_peer(device: usize, buffer: &Self::Buffer) -> bool;
}

/// Barrier flag manipulation, ordered with other work on the stream.
pub trait FlagOps: Backend {
    /// View `words` flag words starting at `byte_offset` of `buffer`.
    fn barrier_array(buffer: &Self::Buffer, byte_offset: usize, words: usize) -> Result<BarrierArray>;

    /// Raise `slots` to `PRODUCED` for `epoch`.
    fn signal(stream: &Self::Stream, barrier: &BarrierArray, slots: Vec<usize>, epoch: u32) -> Result<()>;

    /// Stall the stream until every slot is produced for `epoch`.
    fn wait(stream: &Self::Stream, barrier: &BarrierArray, slots: Vec<usize>, epoch: u32) -> Result<()>;

    /// Mark `slots` `CONSUMED` for `epoch`.
    fn consume(stream: &Self::Stream, barrier: &BarrierArray, slots: Vec<usize>, epoch: u32) -> Result<()>;

    /// Return every word to `EMPTY`.
    fn reset(stream: &Self::Stream, barrier: &BarrierArray) -> Result<()>;
}

/// Arguments of an elementwise reduction.
#[derive(Clone)]
pub struct ReduceArgs<B: Backend> {
    /// Summed in order; all share the output's shape.
    pub sources: Vec<MatrixView<B>>,
    pub output: MatrixView<B>,
    /// Upper bound on parallel blocks.
    pub num_blocks: usize,
    /// Optional f32 multiplier applied to the sum.
    pub scale: Option<BufferView<B>>,
    /// Optional f32 cell raised to the max |sum| (before `scale`).
    pub abs_max: Option<BufferView<B>>,
}

/// Elementwise reductions.
pub trait ReduceOps: Backend {
    /// `output = scale * sum(sources)`.
    fn reduce(stream: &Self::Stream, args: ReduceArgs<Self>) -> Result<()>;
}

/// Host-side collective channel for transfers the device cannot address.
pub trait CommOps: Backend {
    /// Send `src` to `peer`. Does not wait for the receiver.
    fn comm_send(
        stream: &Self::Stream,
        comm: &Self::Comm,
        peer: usize,
        tag: u64,
        src: &MatrixView<Self>,
    ) -> Result<()>;

    /// Receive the matching message from `peer` into `dst`.
    fn comm_recv(
        stream: &Self::Stream,
        comm: &Self::Comm,
        peer: usize,
        tag: u64,
        dst: &MatrixView<Self>,
    ) -> Result<()>;
}

/// Message tag: launch epoch in the high half, region slot in the low half.
pub fn transfer_tag(epoch: u32, slot: usize) -> u64 {
    (u64::from(epoch) << 32) | (slot as u64 & 0xffff_ffff)
}

/// Everything the fused operators need.
pub trait CollectiveBackend: MemoryOps + FlagOps + ReduceOps + CommOps {}

impl<B: MemoryOps + FlagOps + ReduceOps + CommOps> CollectiveBackend for B {}
