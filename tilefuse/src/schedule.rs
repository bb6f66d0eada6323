//! Tile scheduler: maps the output tile grid onto (producer, consumer,
//! step) triples and assigns barrier slots.
//!
//! For reduce-scatter the M axis is cut into `sub_world_size` chunks, one
//! per consumer; every rank computes a partial tile for every chunk. For
//! all-gather the K axis is cut into shards and every step multiplies one
//! gathered shard into the full output.

use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::hparams::TileShape;
use crate::topology::Topology;
use crate::{Error, Result};

/// Which fused operator a program or kernel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GemmKind {
    /// Plain local GEMM, no communication.
    Gemm,
    ReduceScatter,
    AllGather,
}

/// GEMM problem shape. For fused operators `k` is the local reduction
/// length of one rank (GEMM-RS) or the full gathered length (AG-GEMM).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemmShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl GemmShape {
    pub const fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }
}

/// Scheduling knobs taken from the operator options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub kind: GemmKind,
    pub sub_world_size: usize,
    pub n_split: usize,
    pub use_1d_ring: bool,
    pub use_p2p_read: bool,
    pub per_tile_flags: bool,
}

impl ScheduleConfig {
    /// Single-rank plain GEMM.
    pub fn local() -> Self {
        Self {
            kind: GemmKind::Gemm,
            sub_world_size: 1,
            n_split: 1,
            use_1d_ring: true,
            use_p2p_read: true,
            per_tile_flags: true,
        }
    }
}

/// One entry of a tile program, laid out for the kernel to read from the
/// argument workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct TileDesc {
    /// Tile row in a chunk-aligned grid: `chunk * tiles_m_chunk + local`.
    pub tile_m: u32,
    pub tile_n: u32,
    pub producer_rank: u32,
    pub consumer_rank: u32,
    pub step_index: u32,
    pub barrier_slot: u32,
}

/// Rectangle of the output covered by a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub row0: usize,
    pub rows: usize,
    pub col0: usize,
    pub cols: usize,
}

/// Shape parameters a kernel needs to interpret [`TileDesc`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramGeometry {
    pub tile_m: usize,
    pub tile_n: usize,
    /// Rows per chunk (`m / sub_world_size` for reduce-scatter, `m` otherwise).
    pub chunk_rows: usize,
    pub tiles_m_chunk: usize,
    pub tiles_n: usize,
    pub n: usize,
    /// Flag words per (producer, consumer) pair.
    pub slots_per_pair: usize,
    pub per_tile_flags: bool,
}

impl ProgramGeometry {
    /// Output rectangle of `desc`, in global output coordinates.
    #[must_use]
    pub fn tile_rect(&self, desc: &TileDesc) -> TileRect {
        let tile_m = desc.tile_m as usize;
        let chunk = tile_m / self.tiles_m_chunk;
        let local = tile_m % self.tiles_m_chunk;
        let local_row = local * self.tile_m;
        let col0 = desc.tile_n as usize * self.tile_n;
        TileRect {
            row0: chunk * self.chunk_rows + local_row,
            rows: self.tile_m.min(self.chunk_rows - local_row),
            col0,
            cols: self.tile_n.min(self.n - col0),
        }
    }

    /// Chunk (consumer sub-rank for reduce-scatter) a tile belongs to.
    pub fn chunk_of(&self, desc: &TileDesc) -> usize {
        desc.tile_m as usize / self.tiles_m_chunk
    }

    /// Tile index within its chunk, `local_m * tiles_n + tile_n`.
    pub fn local_tile_index(&self, desc: &TileDesc) -> usize {
        (desc.tile_m as usize % self.tiles_m_chunk) * self.tiles_n + desc.tile_n as usize
    }

    pub fn tiles_per_chunk(&self) -> usize {
        self.tiles_m_chunk * self.tiles_n
    }

    /// Slot offset of `desc` within its pair's flag range.
    pub fn slot_in_pair(&self, desc: &TileDesc) -> usize {
        desc.barrier_slot as usize % self.slots_per_pair
    }
}

/// A contiguous run of the program belonging to one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSegment {
    pub step: usize,
    pub tiles: Range<usize>,
}

/// Totally ordered tile program for one rank.
#[derive(Debug, Clone)]
pub struct TileProgram {
    pub kind: GemmKind,
    pub geometry: ProgramGeometry,
    pub tiles: Vec<TileDesc>,
    /// Contiguous per-step runs, in launch order.
    pub segments: Vec<ProgramSegment>,
    /// Flag words the program addresses per barrier array.
    pub num_slots: usize,
}

impl TileProgram {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Size of the serialized descriptor array.
    pub fn descriptor_bytes(&self) -> usize {
        self.tiles.len() * std::mem::size_of::<TileDesc>()
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.tiles)
    }

    /// Descriptors with the given step index, in program order.
    pub fn step_tiles(&self, step: usize) -> impl Iterator<Item = &TileDesc> + '_ {
        self.tiles
            .iter()
            .filter(move |d| d.step_index as usize == step)
    }
}

fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

/// Contiguous strips of `tiles_n` column tiles.
fn strips(tiles_n: usize, n_split: usize) -> Vec<Range<usize>> {
    (0..n_split)
        .map(|j| (j * tiles_n / n_split)..((j + 1) * tiles_n / n_split))
        .collect()
}

#[allow(clippy::cast_possible_truncation)]
fn u32_of(v: usize) -> u32 {
    v as u32
}

/// Flag words per (producer, consumer) pair: one per output tile of a
/// chunk, or a single word with coarse flags.
fn pair_slots(per_tile_flags: bool, tiles_m_chunk: usize, tiles_n: usize) -> usize {
    if per_tile_flags {
        tiles_m_chunk * tiles_n
    } else {
        1
    }
}

/// Flag words in one rank's barrier array, for sizing `barrier_ptrs`.
///
/// With per-tile flags this equals the number of tiles in the rank's
/// program, for both directions.
pub fn flag_words(
    kind: GemmKind,
    shape: GemmShape,
    tile: TileShape,
    sub_world_size: usize,
    per_tile_flags: bool,
) -> usize {
    let s = sub_world_size.max(1);
    let chunk_rows = match kind {
        GemmKind::ReduceScatter => shape.m / s,
        GemmKind::AllGather | GemmKind::Gemm => shape.m,
    };
    let tiles_m_chunk = ceil_div(chunk_rows, tile.m.max(1));
    let tiles_n = ceil_div(shape.n, tile.n.max(1));
    s * pair_slots(per_tile_flags, tiles_m_chunk, tiles_n)
}

/// Build the tile program of `topo.rank()`.
///
/// # Errors
/// Returns `InvalidConfiguration` if the partitioned axis is not divisible
/// by `sub_world_size`, the shape is empty, or `n_split` is zero or larger
/// than the number of column tiles.
pub fn build_program(
    shape: GemmShape,
    tile: TileShape,
    topo: &Topology,
    config: &ScheduleConfig,
) -> Result<TileProgram> {
    let s = config.sub_world_size;
    if s != topo.sub_world_size() {
        return Err(Error::invalid(format!(
            "schedule sub_world_size {s} does not match topology {}",
            topo.sub_world_size()
        )));
    }
    if shape.m == 0 || shape.n == 0 || shape.k == 0 {
        return Err(Error::invalid(format!(
            "empty problem {}x{}x{}",
            shape.m, shape.n, shape.k
        )));
    }
    if tile.m == 0 || tile.n == 0 || tile.k == 0 {
        return Err(Error::invalid("tile shape must be positive"));
    }
    match config.kind {
        GemmKind::ReduceScatter if shape.m % s != 0 => {
            return Err(Error::invalid(format!(
                "sub_world_size {s} does not divide m {}",
                shape.m
            )));
        }
        GemmKind::AllGather if shape.k % s != 0 => {
            return Err(Error::invalid(format!(
                "sub_world_size {s} does not divide k {}",
                shape.k
            )));
        }
        GemmKind::Gemm if s != 1 => {
            return Err(Error::invalid("plain GEMM runs on a single rank"));
        }
        _ => {}
    }

    let tiles_n = ceil_div(shape.n, tile.n);
    if config.n_split == 0 || config.n_split > tiles_n {
        return Err(Error::invalid(format!(
            "n_split {} must be in 1..={tiles_n}",
            config.n_split
        )));
    }
    let chunk_rows = match config.kind {
        GemmKind::ReduceScatter => shape.m / s,
        GemmKind::AllGather | GemmKind::Gemm => shape.m,
    };
    let tiles_m_chunk = ceil_div(chunk_rows, tile.m);
    let slots_per_pair = pair_slots(config.per_tile_flags, tiles_m_chunk, tiles_n);
    let geometry = ProgramGeometry {
        tile_m: tile.m,
        tile_n: tile.n,
        chunk_rows,
        tiles_m_chunk,
        tiles_n,
        n: shape.n,
        slots_per_pair,
        per_tile_flags: config.per_tile_flags,
    };

    let strips = strips(tiles_n, config.n_split);
    let mut tiles = Vec::with_capacity(tiles_m_chunk * tiles_n * s);
    let mut segments = Vec::new();
    let mut push_segment = |tiles: &Vec<TileDesc>, step: usize, start: usize| {
        if tiles.len() > start {
            segments.push(ProgramSegment {
                step,
                tiles: start..tiles.len(),
            });
        }
    };

    match config.kind {
        GemmKind::ReduceScatter | GemmKind::Gemm => {
            let me = topo.rank();
            for strip in &strips {
                for step in 0..s {
                    let start = tiles.len();
                    let consumer = topo.step_peer(step, config.use_1d_ring);
                    let c_sub = topo.sub_index_of(consumer);
                    let pair = if config.use_p2p_read {
                        c_sub
                    } else {
                        topo.sub_rank()
                    };
                    for tm in 0..tiles_m_chunk {
                        for tn in strip.clone() {
                            let t = tm * tiles_n + tn;
                            let slot = pair * slots_per_pair + if config.per_tile_flags { t } else { 0 };
                            tiles.push(TileDesc {
                                tile_m: u32_of(c_sub * tiles_m_chunk + tm),
                                tile_n: u32_of(tn),
                                producer_rank: u32_of(me),
                                consumer_rank: u32_of(consumer),
                                step_index: u32_of(step),
                                barrier_slot: u32_of(slot),
                            });
                        }
                    }
                    push_segment(&tiles, step, start);
                }
            }
        }
        GemmKind::AllGather => {
            let me = topo.rank();
            for step in 0..s {
                let start = tiles.len();
                let producer = topo.step_peer(step, config.use_1d_ring);
                let p_sub = topo.sub_index_of(producer);
                for strip in &strips {
                    for tm in 0..tiles_m_chunk {
                        for tn in strip.clone() {
                            let t = tm * tiles_n + tn;
                            let slot = p_sub * slots_per_pair + if config.per_tile_flags { t } else { 0 };
                            tiles.push(TileDesc {
                                tile_m: u32_of(tm),
                                tile_n: u32_of(tn),
                                producer_rank: u32_of(producer),
                                consumer_rank: u32_of(me),
                                step_index: u32_of(step),
                                barrier_slot: u32_of(slot),
                            });
                        }
                    }
                }
                push_segment(&tiles, step, start);
            }
        }
    }

    Ok(TileProgram {
        kind: config.kind,
        geometry,
        tiles,
        segments,
        num_slots: s * slots_per_pair,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn rs_config(s: usize) -> ScheduleConfig {
        ScheduleConfig {
            kind: GemmKind::ReduceScatter,
            sub_world_size: s,
            n_split: 1,
            use_1d_ring: true,
            use_p2p_read: false,
            per_tile_flags: true,
        }
    }

    #[test]
    fn test_tile_desc_is_pod() {
        assert_eq!(std::mem::size_of::<TileDesc>(), 24);
        let desc = TileDesc {
            tile_m: 3,
            barrier_slot: 9,
            ..TileDesc::default()
        };
        let bytes = bytemuck::bytes_of(&desc);
        assert_eq!(bytemuck::pod_read_unaligned::<TileDesc>(bytes), desc);
    }

    #[test]
    fn test_rs_program_covers_every_tile_once() {
        let topo = Topology::new(1, 4, 1, 4).unwrap();
        let program =
            build_program(GemmShape::new(256, 128, 64), TileShape::new(32, 64, 16), &topo, &rs_config(4)).unwrap();
        let g = program.geometry;
        assert_eq!(g.chunk_rows, 64);
        assert_eq!(g.tiles_m_chunk, 2);
        assert_eq!(program.len(), 4 * 2 * 2);
        let rects: HashSet<(usize, usize)> = program
            .tiles
            .iter()
            .map(|d| {
                let r = g.tile_rect(d);
                (r.row0, r.col0)
            })
            .collect();
        assert_eq!(rects.len(), program.len());
        // Step 0 is local and comes first.
        assert_eq!(program.tiles[0].consumer_rank, 1);
        assert_eq!(program.segments[0].step, 0);
    }

    #[test]
    fn test_rs_chunks_follow_consumer() {
        let topo = Topology::new(2, 4, 1, 4).unwrap();
        let program =
            build_program(GemmShape::new(128, 64, 64), TileShape::new(16, 64, 16), &topo, &rs_config(4)).unwrap();
        for desc in &program.tiles {
            let rect = program.geometry.tile_rect(desc);
            let chunk = rect.row0 / 32;
            assert_eq!(chunk, desc.consumer_rank as usize);
            assert_eq!(program.geometry.chunk_of(desc), chunk);
            // Push mode: slots are indexed by the producer.
            assert_eq!(desc.barrier_slot as usize / program.geometry.slots_per_pair, 2);
        }
    }

    #[test]
    fn test_partial_tiles_are_clipped() {
        let topo = Topology::new(0, 2, 1, 2).unwrap();
        let program =
            build_program(GemmShape::new(20, 10, 8), TileShape::new(8, 8, 8), &topo, &rs_config(2)).unwrap();
        let g = program.geometry;
        let last = program.step_tiles(0).last().unwrap();
        let rect = g.tile_rect(last);
        assert_eq!(rect, TileRect { row0: 8, rows: 2, col0: 8, cols: 2 });
    }

    #[test]
    fn test_flag_words_match_program() {
        let topo = Topology::new(1, 4, 1, 4).unwrap();
        let shape = GemmShape::new(256, 96, 32);
        let tile = TileShape::new(32, 32, 16);
        for per_tile in [true, false] {
            let mut cfg = rs_config(4);
            cfg.per_tile_flags = per_tile;
            let program = build_program(shape, tile, &topo, &cfg).unwrap();
            assert_eq!(flag_words(GemmKind::ReduceScatter, shape, tile, 4, per_tile), program.num_slots);
        }
        assert_eq!(flag_words(GemmKind::AllGather, shape, tile, 4, true), 4 * 8 * 3);
    }

    #[test]
    fn test_flag_words_equal_tile_count_with_many_column_tiles() {
        let shape = GemmShape::new(256, 256, 128);
        let tile = TileShape::new(64, 64, 32);
        let topo = Topology::new(0, 2, 1, 2).unwrap();
        for kind in [GemmKind::ReduceScatter, GemmKind::AllGather] {
            let cfg = ScheduleConfig {
                kind,
                sub_world_size: 2,
                n_split: 2,
                use_1d_ring: true,
                use_p2p_read: true,
                per_tile_flags: true,
            };
            let program = build_program(shape, tile, &topo, &cfg).unwrap();
            assert!(program.geometry.tiles_n > 1);
            let words = flag_words(kind, shape, tile, 2, true);
            assert_eq!(words, program.len(), "{kind:?}");
            assert_eq!(words, program.num_slots, "{kind:?}");
            let slots: HashSet<u32> = program.tiles.iter().map(|d| d.barrier_slot).collect();
            assert_eq!(slots.len(), program.len(), "{kind:?}: every tile has its own flag");
        }
        assert_eq!(flag_words(GemmKind::ReduceScatter, shape, tile, 2, true), 2 * 2 * 4);
        assert_eq!(flag_words(GemmKind::AllGather, shape, tile, 2, true), 2 * 4 * 4);
        assert_eq!(flag_words(GemmKind::AllGather, shape, tile, 2, false), 2);
    }

    #[test]
    fn test_n_split_reorders_only() {
        let topo = Topology::new(0, 2, 1, 2).unwrap();
        let shape = GemmShape::new(64, 128, 32);
        let tile = TileShape::new(16, 32, 16);
        let one = build_program(shape, tile, &topo, &rs_config(2)).unwrap();
        let mut cfg = rs_config(2);
        cfg.n_split = 2;
        let two = build_program(shape, tile, &topo, &cfg).unwrap();
        let as_set = |p: &TileProgram| p.tiles.iter().copied().map(|d| (d.tile_m, d.tile_n, d.barrier_slot)).collect::<HashSet<_>>();
        assert_eq!(as_set(&one), as_set(&two));
        assert_eq!(two.segments.len(), 4);
        assert!(two.tiles[..two.segments[0].tiles.end].iter().all(|d| d.tile_n < 2));
    }

    #[test]
    fn test_pull_slots_indexed_by_consumer() {
        let topo = Topology::new(0, 4, 1, 4).unwrap();
        let mut cfg = rs_config(4);
        cfg.use_p2p_read = true;
        cfg.per_tile_flags = false;
        let program = build_program(GemmShape::new(64, 32, 32), TileShape::new(16, 32, 16), &topo, &cfg).unwrap();
        assert_eq!(program.geometry.slots_per_pair, 1);
        assert_eq!(program.num_slots, 4);
        for desc in &program.tiles {
            assert_eq!(desc.barrier_slot, desc.consumer_rank);
        }
    }

    #[test]
    fn test_ag_program_per_step_producers() {
        let topo = Topology::new(3, 4, 2, 4).unwrap();
        let cfg = ScheduleConfig {
            kind: GemmKind::AllGather,
            sub_world_size: 4,
            n_split: 1,
            use_1d_ring: true,
            use_p2p_read: true,
            per_tile_flags: true,
        };
        let program = build_program(GemmShape::new(64, 64, 64), TileShape::new(32, 32, 16), &topo, &cfg).unwrap();
        assert_eq!(program.segments.len(), 4);
        assert_eq!(program.geometry.slots_per_pair, 4);
        for seg in &program.segments {
            let producer = topo.step_peer(seg.step, true);
            for desc in &program.tiles[seg.tiles.clone()] {
                assert_eq!(desc.producer_rank as usize, producer);
                assert_eq!(desc.consumer_rank, 3);
                assert_eq!(
                    desc.barrier_slot as usize,
                    producer * 4 + desc.tile_m as usize * 2 + desc.tile_n as usize
                );
            }
        }
    }

    #[test]
    fn test_indivisible_axis_rejected() {
        let topo = Topology::new(0, 3, 1, 3).unwrap();
        let err = build_program(GemmShape::new(16, 64, 64), TileShape::new(16, 16, 16), &topo, &rs_config(3)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_n_split_bounds() {
        let topo = Topology::new(0, 1, 1, 1).unwrap();
        let mut cfg = rs_config(1);
        cfg.n_split = 5;
        assert!(build_program(GemmShape::new(16, 64, 16), TileShape::new(16, 16, 16), &topo, &cfg).is_err());
        cfg.n_split = 0;
        assert!(build_program(GemmShape::new(16, 64, 16), TileShape::new(16, 16, 16), &topo, &cfg).is_err());
    }
}
