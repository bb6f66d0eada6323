//! Kernel hyperparameters, erased from concrete kernel types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Output tile of one kernel work unit, plus the K step of its main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl TileShape {
    pub const fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }
}

/// Thread-block cluster shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterShape {
    pub m: usize,
    pub n: usize,
}

impl Default for ClusterShape {
    fn default() -> Self {
        Self { m: 1, n: 1 }
    }
}

/// Main-loop scheduling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GemmSchedule {
    /// Multistage software pipeline, one tile per block.
    #[default]
    Multistage,
    /// Persistent blocks that walk the tile program.
    Persistent,
}

/// Uniform view over a kernel instantiation's tuning parameters.
///
/// The tile scheduler reads the tile shape from here; the op registry keys
/// on the whole struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnifiedGemmHParams {
    pub tile_shape: TileShape,
    #[serde(default)]
    pub cluster_shape: ClusterShape,
    pub stages: usize,
    #[serde(default)]
    pub schedule: GemmSchedule,
}

impl UnifiedGemmHParams {
    pub const fn new(tile_shape: TileShape, stages: usize, schedule: GemmSchedule) -> Self {
        Self {
            tile_shape,
            cluster_shape: ClusterShape { m: 1, n: 1 },
            stages,
            schedule,
        }
    }
}

impl fmt::Display for UnifiedGemmHParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.tile_shape;
        let c = self.cluster_shape;
        write!(
            f,
            "tile{}x{}x{}_cluster{}x{}_stages{}_{:?}",
            t.m, t.n, t.k, c.m, c.n, self.stages, self.schedule
        )
    }
}
