//! Operator workspace layout: `[ args | kernel | barrier ]`.

use std::ops::Range;

/// Every workspace region starts on this boundary.
pub const MIN_WORKSPACE_ALIGNMENT: usize = 256;

/// Round `value` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Byte ranges of the three workspace regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub args: Range<usize>,
    pub kernel: Range<usize>,
    pub barrier: Range<usize>,
    pub total: usize,
}

impl WorkspaceLayout {
    /// Lay the regions out back to back, each aligned.
    #[must_use]
    pub fn new(args_bytes: usize, kernel_bytes: usize, barrier_bytes: usize) -> Self {
        let args = 0..args_bytes;
        let kernel_start = align_up(args.end, MIN_WORKSPACE_ALIGNMENT);
        let kernel = kernel_start..kernel_start + kernel_bytes;
        let barrier_start = align_up(kernel.end, MIN_WORKSPACE_ALIGNMENT);
        let barrier = barrier_start..barrier_start + barrier_bytes;
        let total = align_up(barrier.end, MIN_WORKSPACE_ALIGNMENT);
        Self {
            args,
            kernel,
            barrier,
            total,
        }
    }
}

/// Sequential sub-allocator for carving one region into aligned pieces.
#[derive(Debug, Default)]
pub struct RegionBuilder {
    cursor: usize,
}

impl RegionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `bytes` at the next aligned offset.
    pub fn reserve(&mut self, bytes: usize) -> Range<usize> {
        let start = align_up(self.cursor, MIN_WORKSPACE_ALIGNMENT);
        self.cursor = start + bytes;
        start..self.cursor
    }

    /// Bytes used so far.
    pub fn size(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disjoint(a: &Range<usize>, b: &Range<usize>) -> bool {
        a.end <= b.start || b.end <= a.start
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_regions_aligned_and_disjoint() {
        let layout = WorkspaceLayout::new(1000, 17, 64);
        for r in [&layout.args, &layout.kernel, &layout.barrier] {
            assert_eq!(r.start % MIN_WORKSPACE_ALIGNMENT, 0);
            assert!(r.end <= layout.total);
        }
        assert!(disjoint(&layout.args, &layout.kernel));
        assert!(disjoint(&layout.kernel, &layout.barrier));
        assert_eq!(layout.total, 1024 + 256 + 256);
    }

    #[test]
    fn test_empty_layout() {
        let layout = WorkspaceLayout::new(0, 0, 0);
        assert_eq!(layout.total, 0);
    }

    #[test]
    fn test_region_builder() {
        let mut b = RegionBuilder::new();
        let a = b.reserve(10);
        let c = b.reserve(300);
        assert_eq!(a, 0..10);
        assert_eq!(c, 256..556);
        assert_eq!(b.size(), 556);
    }
}
