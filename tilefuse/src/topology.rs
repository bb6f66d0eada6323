//! Rank topology and per-step peer routing.
//!
//! A world of `W = nnodes * local_size` ranks is split into contiguous
//! sub-groups of `sub_world_size` ranks. Collectives run within a
//! sub-group; each step of a collective pairs every rank with one peer.

use crate::{Error, Result};

/// Unused entries in [`NODES_SWIZZLE`].
pub const SWIZZLE_SENTINEL: i32 = -1;

/// Largest node count with a fixed swizzle table.
pub const MAX_SWIZZLE_NODES: usize = 4;

/// Node permutation tables for 1, 2 and 4 nodes, row-major with a row
/// stride of `nnodes`: entry `[node * nnodes + step]` is the remote node
/// that `node` addresses at `step`.
pub static NODES_SWIZZLE: [[i32; MAX_SWIZZLE_NODES * MAX_SWIZZLE_NODES]; 3] = [
    [0, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1],
    [0, 1, 1, 0, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1],
    [0, 3, 2, 1, 1, 0, 3, 2, 2, 1, 0, 3, 3, 2, 1, 0],
];

fn swizzle_table(nnodes: usize) -> Option<&'static [i32]> {
    match nnodes {
        1 => Some(&NODES_SWIZZLE[0]),
        2 => Some(&NODES_SWIZZLE[1]),
        4 => Some(&NODES_SWIZZLE[2]),
        _ => None,
    }
}

/// Remote node addressed by `node` at `step`.
///
/// Uses the fixed table for 1, 2 and 4 nodes and a plain rotation
/// `(node + step) % nnodes` otherwise.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn swizzle_node(nnodes: usize, node: usize, step: usize) -> usize {
    let step = step % nnodes;
    match swizzle_table(nnodes) {
        Some(table) => {
            let entry = table[node * nnodes + step];
            debug_assert_ne!(entry, SWIZZLE_SENTINEL);
            entry as usize
        }
        None => (node + step) % nnodes,
    }
}

/// Identity of one rank within the world and its collective sub-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    rank: usize,
    world_size: usize,
    nnodes: usize,
    sub_world_size: usize,
}

impl Topology {
    /// # Errors
    /// Returns `InvalidConfiguration` if the rank is out of range, `nnodes`
    /// does not divide `world_size`, or the sub-group would straddle a node
    /// boundary without covering whole nodes.
    pub fn new(rank: usize, world_size: usize, nnodes: usize, sub_world_size: usize) -> Result<Self> {
        if world_size == 0 || nnodes == 0 || sub_world_size == 0 {
            return Err(Error::invalid(format!(
                "world_size {world_size}, nnodes {nnodes} and sub_world_size {sub_world_size} must be positive"
            )));
        }
        if rank >= world_size {
            return Err(Error::invalid(format!(
                "rank {rank} out of range for world_size {world_size}"
            )));
        }
        if world_size % nnodes != 0 {
            return Err(Error::invalid(format!(
                "nnodes {nnodes} does not divide world_size {world_size}"
            )));
        }
        if world_size % sub_world_size != 0 {
            return Err(Error::invalid(format!(
                "sub_world_size {sub_world_size} does not divide world_size {world_size}"
            )));
        }
        let local_size = world_size / nnodes;
        let aligned = if sub_world_size <= local_size {
            local_size % sub_world_size == 0
        } else {
            sub_world_size % local_size == 0
        };
        if !aligned {
            return Err(Error::invalid(format!(
                "sub_world_size {sub_world_size} is not aligned to the {local_size} ranks per node"
            )));
        }
        Ok(Self {
            rank,
            world_size,
            nnodes,
            sub_world_size,
        })
    }

    /// Same world, viewed from another rank.
    ///
    /// # Panics
    /// Panics if `rank >= world_size`.
    #[must_use]
    pub fn with_rank(&self, rank: usize) -> Self {
        assert!(rank < self.world_size, "rank {rank} out of range");
        Self { rank, ..*self }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn nnodes(&self) -> usize {
        self.nnodes
    }

    pub fn sub_world_size(&self) -> usize {
        self.sub_world_size
    }

    /// Ranks per node.
    pub fn local_size(&self) -> usize {
        self.world_size / self.nnodes
    }

    pub fn node(&self) -> usize {
        self.rank / self.local_size()
    }

    pub fn local(&self) -> usize {
        self.rank % self.local_size()
    }

    /// Index of this rank within its sub-group.
    pub fn sub_rank(&self) -> usize {
        self.rank % self.sub_world_size
    }

    /// First global rank of this rank's sub-group.
    pub fn group_base(&self) -> usize {
        self.rank - self.sub_rank()
    }

    /// Global rank of the `sub_rank`-th member of this sub-group.
    pub fn group_rank(&self, sub_rank: usize) -> usize {
        self.group_base() + sub_rank
    }

    /// Sub-group index of a global rank in this sub-group.
    pub fn sub_index_of(&self, rank: usize) -> usize {
        debug_assert!(self.contains(rank));
        rank - self.group_base()
    }

    /// Whether `rank` is a member of this sub-group.
    pub fn contains(&self, rank: usize) -> bool {
        (self.group_base()..self.group_base() + self.sub_world_size).contains(&rank)
    }

    pub fn is_same_node(&self, rank: usize) -> bool {
        rank / self.local_size() == self.node()
    }

    /// Remote node addressed by this rank's node at `step`.
    pub fn peer_node(&self, step: usize) -> usize {
        swizzle_node(self.nnodes, self.node(), step)
    }

    /// World rank with local index `local` on the node `node` addresses at `step`.
    pub fn swizzle_peer(&self, node: usize, step: usize, local: usize) -> usize {
        swizzle_node(self.nnodes, node, step) * self.local_size() + local
    }

    /// World-level step function: the same local index on the node visited
    /// at `step`. Step 0 is always this rank.
    pub fn peer(&self, step: usize) -> usize {
        self.swizzle_peer(self.node(), step, self.local())
    }

    /// Peer this rank exchanges with at collective `step` of its sub-group.
    ///
    /// With `use_1d_ring` the sub-group is a ring. Otherwise the intra-node
    /// part of the sub-group is swept first and the node permutation table
    /// orders the outer, inter-node sweep.
    pub fn step_peer(&self, step: usize, use_1d_ring: bool) -> usize {
        let s = self.sub_world_size;
        let step = step % s;
        if use_1d_ring {
            return self.group_rank((self.sub_rank() + step) % s);
        }
        let lg = s.min(self.local_size());
        let ng = s / lg;
        let gl = self.sub_rank() % lg;
        let gn = self.sub_rank() / lg;
        let peer_gn = swizzle_node(ng, gn, step / lg);
        let peer_gl = (gl + step % lg) % lg;
        self.group_rank(peer_gn * lg + peer_gl)
    }

    /// The rank whose `step_peer(step)` is this rank.
    pub fn step_source(&self, step: usize, use_1d_ring: bool) -> usize {
        if use_1d_ring {
            let s = self.sub_world_size;
            return self.group_rank((self.sub_rank() + s - step % s) % s);
        }
        (0..self.sub_world_size)
            .map(|i| self.group_rank(i))
            .find(|&r| self.with_rank(r).step_peer(step, false) == self.rank)
            .unwrap_or(self.rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_permutation(values: &[usize], n: usize) -> bool {
        let mut seen = vec![false; n];
        for &v in values {
            if v >= n || seen[v] {
                return false;
            }
            seen[v] = true;
        }
        values.len() == n
    }

    #[test]
    fn test_swizzle_completeness() {
        for nnodes in [1, 2, 4] {
            for node in 0..nnodes {
                let visited: Vec<usize> =
                    (0..nnodes).map(|s| swizzle_node(nnodes, node, s)).collect();
                assert!(is_permutation(&visited, nnodes), "nnodes={nnodes} node={node}");
                assert_eq!(visited[0], node, "step 0 must address self");
            }
        }
    }

    #[test]
    fn test_four_node_table() {
        let topo = Topology::new(0, 4, 4, 1).unwrap();
        assert_eq!(topo.peer_node(2), 2);
        assert_eq!(topo.peer_node(1), 3);
        assert_eq!(topo.peer(2), 2);
    }

    #[test]
    fn test_unlisted_node_counts_rotate() {
        for step in 0..8 {
            assert_eq!(swizzle_node(8, 3, step), (3 + step) % 8);
            assert_eq!(swizzle_node(3, 1, step), (1 + step) % 3);
        }
    }

    #[test]
    fn test_node_and_local() {
        let topo = Topology::new(5, 8, 2, 4).unwrap();
        assert_eq!(topo.local_size(), 4);
        assert_eq!(topo.node(), 1);
        assert_eq!(topo.local(), 1);
        assert_eq!(topo.sub_rank(), 1);
        assert_eq!(topo.group_base(), 4);
        assert!(topo.is_same_node(7));
        assert!(!topo.is_same_node(3));
    }

    #[test]
    fn test_world_peer_visits_every_node() {
        let topo = Topology::new(6, 8, 4, 1).unwrap();
        let nodes: Vec<usize> = (0..4).map(|s| topo.peer(s) / topo.local_size()).collect();
        assert!(is_permutation(&nodes, 4));
        assert!((0..4).all(|s| topo.peer(s) % 2 == topo.local()));
    }

    #[test]
    fn test_step_peer_is_permutation() {
        for ring in [true, false] {
            for (world, nnodes, sub) in [(4, 1, 4), (4, 2, 4), (8, 4, 8), (8, 2, 2), (16, 4, 8)] {
                for rank in 0..world {
                    let topo = Topology::new(rank, world, nnodes, sub).unwrap();
                    let peers: Vec<usize> = (0..sub)
                        .map(|s| topo.step_peer(s, ring) - topo.group_base())
                        .collect();
                    assert!(
                        is_permutation(&peers, sub),
                        "ring={ring} world={world} nnodes={nnodes} sub={sub} rank={rank}: {peers:?}"
                    );
                    assert_eq!(topo.step_peer(0, ring), rank);
                }
            }
        }
    }

    #[test]
    fn test_two_level_sweeps_local_first() {
        // 2 nodes x 2 ranks: the first step stays on-node.
        let topo = Topology::new(0, 4, 2, 4).unwrap();
        assert_eq!(topo.step_peer(1, false), 1);
        assert!(!topo.is_same_node(topo.step_peer(2, false)));
    }

    #[test]
    fn test_step_source_inverts_step_peer() {
        for ring in [true, false] {
            for rank in 0..8 {
                let topo = Topology::new(rank, 8, 2, 8).unwrap();
                for step in 0..8 {
                    let src = topo.step_source(step, ring);
                    assert_eq!(topo.with_rank(src).step_peer(step, ring), rank);
                }
            }
        }
    }

    #[test]
    fn test_invalid_topologies() {
        assert!(Topology::new(4, 4, 1, 1).is_err());
        assert!(Topology::new(0, 6, 4, 1).is_err());
        assert!(Topology::new(0, 4, 1, 3).is_err());
        // 4-rank groups would straddle the 6-rank nodes.
        assert!(Topology::new(0, 12, 2, 4).is_err());
        assert!(Topology::new(0, 0, 1, 1).is_err());
    }
}
