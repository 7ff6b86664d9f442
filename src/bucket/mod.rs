//! Recursive bucketing of splats into GPU-sized work units
//!
//! Subdivides a grid and the splats it contains into buckets that satisfy both
//! a splat-count cap and a side-length cap, without materialising the splats:
//! membership travels between recursion levels as run-length encoded ID
//! ranges. Each level tiles its grid with power-of-two "microblocks", builds a
//! histogram over the implicit octree above them, picks cells, and routes the
//! splat ranges into the picked cells for the next level.

pub mod node;
pub mod range;

pub use node::{for_each_node, Node};
pub use range::{RangeCollector, RangeCounter, SplatRange};

use bytemuck::Zeroable;

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::math::{div_up, mul_sat, Grid};
use crate::splat::set::{make_splat_id, FileSet};
use crate::splat::Splat;

/// Splats read per I/O request when streaming ranges.
const SPLAT_BUFFER: usize = 8192;

/// Marker for octree cells that were not picked as buckets.
const BAD_BLOCK: usize = usize::MAX;

/// Conservative test of a splat's influence box against a cell range's world
/// bounds. No sphere refinement; extra splats are filtered downstream.
fn splat_cell_intersect(splat: &Splat, lower: [u32; 3], upper: [u32; 3], grid: &Grid) -> bool {
    let lo = grid.vertex_world(lower);
    let hi = grid.vertex_world(upper);
    for i in 0..3 {
        if splat.position[i] + splat.radius < lo[i] || splat.position[i] - splat.radius > hi[i] {
            return false;
        }
    }
    true
}

/// Stream the splats named by `ranges` through `func` in ID order.
///
/// Non-finite splats are skipped; ranges produced by the bucketing passes
/// never contain any, since streams drop them before IDs are assigned.
pub fn for_each_splat<F>(files: &FileSet, ranges: &[SplatRange], mut func: F) -> Result<()>
where
    F: FnMut(u64, &Splat) -> Result<()>,
{
    let mut buffer = vec![Splat::zeroed(); SPLAT_BUFFER];
    for range in ranges {
        let mut start = range.start;
        let mut remaining = range.size as usize;
        while remaining > 0 {
            let chunk = remaining.min(SPLAT_BUFFER);
            files.read_range(start, &mut buffer[..chunk])?;
            for (j, splat) in buffer[..chunk].iter().enumerate() {
                if splat.is_finite() {
                    func(start + j as u64, splat)?;
                }
            }
            start += chunk as u64;
            remaining -= chunk;
        }
    }
    Ok(())
}

/// Ranges covering every splat of every file, plus the total count.
///
/// The count includes non-finite splats (they are discovered lazily during
/// streaming), so it is an upper bound on what the recursion will see.
pub fn make_root(files: &FileSet) -> (Vec<SplatRange>, u64) {
    let mut root = Vec::new();
    let mut total = 0u64;
    for file_id in 0..files.num_files() as u32 {
        let len = files.file(file_id).len();
        total += len;
        let mut start = 0u64;
        while start < len {
            let size = (len - start).min(u32::MAX as u64) as u32;
            root.push(SplatRange::new(make_splat_id(file_id, start), size));
            start += size as u64;
        }
    }
    (root, total)
}

/// Scan the files once and build a bounding grid: the reference point is the
/// minimum sample position, the extents cover every influence region.
pub fn make_grid(files: &FileSet, spacing: f32) -> Result<Grid> {
    assert!(spacing > 0.0);
    let (root, _) = make_root(files);
    let mut low = [f32::INFINITY; 3];
    let mut bbox_min = [f32::INFINITY; 3];
    let mut bbox_max = [f32::NEG_INFINITY; 3];
    let mut any = false;
    for_each_splat(files, &root, |_, splat| {
        any = true;
        for i in 0..3 {
            let p = splat.position[i];
            low[i] = low[i].min(p);
            bbox_min[i] = bbox_min[i].min(p - splat.radius);
            bbox_max[i] = bbox_max[i].max(p + splat.radius);
        }
        Ok(())
    })?;
    if !any {
        return Err(Error::State("input contains no splats"));
    }
    let mut extents = [(0i32, 0i32); 3];
    for i in 0..3 {
        let l = ((bbox_min[i] - low[i]) / spacing).floor() as i32;
        let h = ((bbox_max[i] - low[i]) / spacing).ceil() as i32;
        extents[i] = (l, h);
    }
    Ok(Grid::new(Vec3::from(low), spacing, extents))
}

struct CellState {
    counter: RangeCounter,
    block_id: usize,
}

impl Default for CellState {
    fn default() -> Self {
        Self {
            counter: RangeCounter::new(),
            block_id: BAD_BLOCK,
        }
    }
}

struct LevelCells {
    dims: [u32; 3],
    cells: Vec<CellState>,
}

impl LevelCells {
    fn new(dims: [u32; 3]) -> Self {
        let len = dims.iter().map(|&d| d as usize).product();
        let mut cells = Vec::with_capacity(len);
        cells.resize_with(len, CellState::default);
        Self { dims, cells }
    }

    fn index(&self, c: [u32; 3]) -> usize {
        debug_assert!(c[0] < self.dims[0] && c[1] < self.dims[1] && c[2] < self.dims[2]);
        (c[2] as usize * self.dims[1] as usize + c[1] as usize) * self.dims[0] as usize
            + c[0] as usize
    }
}

/// Per-recursion-level octree histograms and pick results.
struct BucketState {
    levels: Vec<LevelCells>,
    picked: Vec<Node>,
    picked_offset: Vec<u64>,
    next_offset: u64,
}

impl BucketState {
    fn new(micro_dims: [u32; 3], macro_levels: u32) -> Self {
        let levels = (0..macro_levels)
            .map(|level| {
                LevelCells::new([
                    div_up(micro_dims[0] as u64, 1 << level) as u32,
                    div_up(micro_dims[1] as u64, 1 << level) as u32,
                    div_up(micro_dims[2] as u64, 1 << level) as u32,
                ])
            })
            .collect();
        Self {
            levels,
            picked: Vec::new(),
            picked_offset: Vec::new(),
            next_offset: 0,
        }
    }

    fn cell(&self, node: &Node) -> &CellState {
        let level = &self.levels[node.level() as usize];
        &level.cells[level.index(node.coords())]
    }

    fn cell_mut(&mut self, node: &Node) -> &mut CellState {
        let level = &mut self.levels[node.level() as usize];
        let idx = level.index(node.coords());
        &mut level.cells[idx]
    }
}

/// Subdivide `grid` and the splats it contains into buckets satisfying
/// `max_splats` and `max_cells`, calling `process` for each.
///
/// `process` receives the splat store, the bucket's splat count, its ID
/// ranges (ordered by splat ID) and a grid covering exactly the bucket.
/// `max_split` caps the fan-out of one recursion level, bounding the memory
/// the histograms take. All splats intersecting a bucket are passed to it, but
/// the intersection test is conservative so there may be extras; a splat
/// crossing bucket boundaries is passed to each bucket it touches.
///
/// Fails with [`Error::Density`] if some single cell holds more than
/// `max_splats` splats.
pub fn bucket<F>(
    files: &FileSet,
    grid: &Grid,
    max_splats: u64,
    max_cells: u32,
    max_split: usize,
    mut process: F,
) -> Result<()>
where
    F: FnMut(&FileSet, u64, &[SplatRange], &Grid) -> Result<()>,
{
    assert!(max_splats > 0 && max_cells > 0);
    assert!(max_split >= 8, "fan-out must allow a full octant split");
    let (root, num_splats) = make_root(files);
    if num_splats == 0 {
        return Ok(());
    }
    bucket_recurse(
        files,
        &root,
        num_splats,
        grid,
        max_splats,
        max_cells,
        max_split,
        &mut process,
    )
}

#[allow(clippy::too_many_arguments)]
fn bucket_recurse<F>(
    files: &FileSet,
    ranges: &[SplatRange],
    num_splats: u64,
    grid: &Grid,
    max_splats: u64,
    max_cells: u32,
    max_split: usize,
    process: &mut F,
) -> Result<()>
where
    F: FnMut(&FileSet, u64, &[SplatRange], &Grid) -> Result<()>,
{
    let dims = grid.dims();
    let max_dim = grid.max_dim();

    if num_splats <= max_splats && max_dim <= max_cells {
        process(files, num_splats, ranges, grid)?;
        return Ok(());
    }

    // Smallest power-of-two microblock size whose tiling respects the fan-out
    // cap. The saturating multiply keeps gigantic grids from overflowing.
    let mut micro_size: u64 = 1;
    loop {
        let blocks = dims
            .iter()
            .fold(1u64, |acc, &d| mul_sat(acc, div_up(d as u64, micro_size)));
        if blocks <= max_split as u64 {
            break;
        }
        micro_size *= 2;
    }
    let micro_size = micro_size as u32;

    let mut macro_levels = 1u32;
    while (micro_size as u64) << (macro_levels - 1) < max_dim as u64 {
        macro_levels += 1;
    }

    let micro_dims = [
        div_up(dims[0] as u64, micro_size as u64) as u32,
        div_up(dims[1] as u64, micro_size as u64) as u32,
        div_up(dims[2] as u64, micro_size as u64) as u32,
    ];

    let mut state = BucketState::new(micro_dims, macro_levels);

    // Histogram pass: every splat bumps the counter of every octree node its
    // influence box intersects, down to microblock level.
    for_each_splat(files, ranges, |id, splat| {
        for_each_node(micro_dims, macro_levels, &mut |n| {
            let (clo, chi) = n.to_cells_clamped(micro_size, grid);
            if !splat_cell_intersect(splat, clo, chi, grid) {
                return false;
            }
            state.cell_mut(n).counter.append(id);
            n.level() > 0
        });
        Ok(())
    })?;

    // Pick pass: keep cells that fit both caps, force microblocks, prune
    // empties. Offsets into the shared output-range buffer accumulate.
    for_each_node(micro_dims, macro_levels, &mut |n| {
        let (splats, range_count) = {
            let cs = state.cell(n);
            (cs.counter.count_splats(), cs.counter.count_ranges())
        };
        if splats == 0 {
            return false;
        }
        let side_cells = n.size() as u64 * micro_size as u64;
        if n.level() == 0 || (side_cells <= max_cells as u64 && splats <= max_splats) {
            let block_id = state.picked.len();
            state.cell_mut(n).block_id = block_id;
            state.picked.push(*n);
            state.picked_offset.push(state.next_offset);
            state.next_offset += range_count;
            false
        } else {
            true
        }
    });

    state.picked_offset.push(state.next_offset); // sentinel
    let num_picked = state.picked.len();

    let mut child_ranges = vec![SplatRange::empty(); state.next_offset as usize];
    {
        let mut collectors: Vec<RangeCollector<'_>> = Vec::with_capacity(num_picked);
        let mut rest: &mut [SplatRange] = &mut child_ranges;
        for i in 0..num_picked {
            let len = (state.picked_offset[i + 1] - state.picked_offset[i]) as usize;
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
            collectors.push(RangeCollector::new(head));
            rest = tail;
        }

        // Partition pass: route each splat into every picked cell it
        // intersects, descending through unpicked cells.
        for_each_splat(files, ranges, |id, splat| {
            for_each_node(micro_dims, macro_levels, &mut |n| {
                let (clo, chi) = n.to_cells_clamped(micro_size, grid);
                if !splat_cell_intersect(splat, clo, chi, grid) {
                    return false;
                }
                let block = state.cell(n).block_id;
                if block == BAD_BLOCK {
                    true
                } else {
                    collectors[block].append(id);
                    false
                }
            });
            Ok(())
        })?;

        for (i, collector) in collectors.iter_mut().enumerate() {
            let written = collector.flush();
            debug_assert_eq!(
                written as u64,
                state.picked_offset[i + 1] - state.picked_offset[i]
            );
        }
    }

    // Keep what the recursion needs and release the histograms.
    let picked = std::mem::take(&mut state.picked);
    let offsets = std::mem::take(&mut state.picked_offset);
    let counts: Vec<u64> = picked
        .iter()
        .map(|n| state.cell(n).counter.count_splats())
        .collect();
    drop(state);

    for i in 0..num_picked {
        let (clo, chi) = picked[i].to_cells_clamped(micro_size, grid);
        if clo == [0, 0, 0] && chi == dims {
            // The picked cell covers the entire current grid: a single cell
            // exceeded the splat cap and no subdivision can help.
            return Err(Error::Density {
                cell_splats: counts[i],
            });
        }
        let child_grid = grid.sub_grid(clo, chi)?;
        let first = offsets[i] as usize;
        let last = offsets[i + 1] as usize;
        bucket_recurse(
            files,
            &child_ranges[first..last],
            counts[i],
            &child_grid,
            max_splats,
            max_cells,
            max_split,
            process,
        )?;
    }
    Ok(())
}
