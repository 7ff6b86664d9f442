//! Uniform reconstruction lattice

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};

/// A uniform axis-aligned grid of vertices in world space.
///
/// The grid is defined by a reference point, a spacing, and per-axis integer
/// extents `[lo, hi)` measured in cells. Vertex `v` on an axis sits at world
/// coordinate `reference + spacing * (lo + v)`. Subgrids share the reference
/// point and spacing of their parent, so vertex coordinates remain comparable
/// across recursion levels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    reference: Vec3,
    spacing: f32,
    extents: [(i32, i32); 3],
}

impl Grid {
    /// Create a grid.
    ///
    /// Panics if `spacing <= 0` or any extent is empty; both are programmer
    /// errors.
    pub fn new(reference: Vec3, spacing: f32, extents: [(i32, i32); 3]) -> Self {
        assert!(spacing > 0.0, "grid spacing must be positive");
        for (lo, hi) in extents {
            assert!(lo < hi, "grid extents must be non-empty");
        }
        Self {
            reference,
            spacing,
            extents,
        }
    }

    pub fn reference(&self) -> Vec3 {
        self.reference
    }

    pub fn spacing(&self) -> f32 {
        self.spacing
    }

    /// Extent `[lo, hi)` of the given axis, in cells.
    pub fn extent(&self, axis: usize) -> (i32, i32) {
        self.extents[axis]
    }

    /// Number of vertices along the given axis (one more than cells).
    pub fn num_vertices(&self, axis: usize) -> u32 {
        let (lo, hi) = self.extents[axis];
        (hi as i64 - lo as i64 + 1) as u32
    }

    /// Number of cells along the given axis.
    pub fn num_cells(&self, axis: usize) -> u32 {
        let (lo, hi) = self.extents[axis];
        (hi as i64 - lo as i64) as u32
    }

    /// Cell counts for all three axes.
    pub fn dims(&self) -> [u32; 3] {
        [self.num_cells(0), self.num_cells(1), self.num_cells(2)]
    }

    /// Largest cell count over the three axes.
    pub fn max_dim(&self) -> u32 {
        self.dims().into_iter().max().unwrap_or(0)
    }

    /// Total number of cells in the grid.
    pub fn num_cells_total(&self) -> u64 {
        self.dims().iter().map(|&d| d as u64).product()
    }

    /// World position of the vertex with the given grid-local coordinates.
    ///
    /// Coordinates may lie beyond the last vertex (used when querying the far
    /// corner of a cell range).
    pub fn vertex_world(&self, v: [u32; 3]) -> Vec3 {
        let mut out = [0.0f32; 3];
        for i in 0..3 {
            let (lo, _) = self.extents[i];
            out[i] = self.reference[i] + self.spacing * (lo as i64 + v[i] as i64) as f32;
        }
        Vec3::from(out)
    }

    /// Convert a world position to continuous grid-local vertex coordinates.
    pub fn world_to_vertex(&self, world: Vec3) -> Vec3 {
        let mut out = [0.0f32; 3];
        for i in 0..3 {
            let (lo, _) = self.extents[i];
            out[i] = (world[i] - self.reference[i]) / self.spacing - lo as f32;
        }
        Vec3::from(out)
    }

    /// Subgrid spanning cells `[lower, upper)` of this grid.
    ///
    /// The subgrid inherits reference point and spacing. Panics if the range
    /// is empty or escapes this grid; fails with a `Range` error if the
    /// resulting extents overflow the coordinate type.
    pub fn sub_grid(&self, lower: [u32; 3], upper: [u32; 3]) -> Result<Grid> {
        let mut extents = [(0i32, 0i32); 3];
        for i in 0..3 {
            assert!(
                lower[i] < upper[i] && upper[i] <= self.num_cells(i),
                "subgrid range escapes parent grid"
            );
            let (lo, _) = self.extents[i];
            let new_lo = lo as i64 + lower[i] as i64;
            let new_hi = lo as i64 + upper[i] as i64;
            if new_lo < i32::MIN as i64 || new_hi > i32::MAX as i64 {
                return Err(Error::Range("subgrid extent overflow"));
            }
            extents[i] = (new_lo as i32, new_hi as i32);
        }
        Ok(Grid {
            reference: self.reference,
            spacing: self.spacing,
            extents,
        })
    }
}
