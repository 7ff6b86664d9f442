//! Per-bucket splat octree
//!
//! For each bucket a small octree indexes its splats by the grid vertices they
//! influence. Construction happens host-side; the resulting `commands` and
//! `start` arrays are shipped to the device, where a vertex lookup yields a
//! starting offset into a traversal program: splat IDs until a sentinel, which
//! either terminates (`-1`) or jumps to the parent cell's run (`-2 - parent`).

use crate::core::error::Error;
use crate::core::types::Result;
use crate::math::{make_code, Grid};
use crate::splat::Splat;

/// Transient construction record: one octree cell touched by one splat.
#[derive(Debug, Clone, Copy)]
struct Entry {
    level: u32,
    code: u64,
    splat_id: i32,
}

/// Host-built splat tree for one bucket.
pub struct SplatTree {
    num_levels: u32,
    dims: [u32; 3],
    commands: Vec<i32>,
    start: Vec<i32>,
}

impl SplatTree {
    /// Build the tree for `splats` against the bucket's `grid`.
    ///
    /// Splat influence regions must map into the grid's vertex range; the
    /// bucketing pass guarantees this for the buckets it emits.
    pub fn build(splats: &[Splat], grid: &Grid) -> Result<SplatTree> {
        if splats.len() >= i32::MAX as usize / 16 {
            return Err(Error::Resource("too many splats for a splat tree".into()));
        }
        let dims = [
            grid.num_vertices(0),
            grid.num_vertices(1),
            grid.num_vertices(2),
        ];
        let size = dims.into_iter().max().unwrap_or(1);
        let mut max_level = 0u32;
        while (1u32 << max_level) < size {
            max_level += 1;
        }
        let num_levels = max_level + 1;

        let mut entries: Vec<Entry> = Vec::with_capacity(8 * splats.len());
        'splats: for (splat_id, splat) in splats.iter().enumerate() {
            let vlo = grid.world_to_vertex(splat.lower());
            let vhi = grid.world_to_vertex(splat.upper());

            // Buckets are conservative, so influence regions may poke past
            // the grid; clamp to the vertices this bucket owns. A splat
            // influencing no vertex here contributes nothing.
            let mut ilo = [0i32; 3];
            let mut ihi = [0i32; 3];
            let mut shift = 0u32;
            for i in 0..3 {
                ilo[i] = (vlo[i].ceil() as i32).max(0);
                ihi[i] = (vhi[i].floor() as i32).min(dims[i] as i32 - 1);
                if ilo[i] > ihi[i] {
                    continue 'splats;
                }
            }
            // Start at the deepest level, then coarsen until the splat takes
            // at most two cells in every direction.
            for i in 0..3 {
                while (ihi[i] >> shift) - (ilo[i] >> shift) > 1 {
                    shift += 1;
                }
            }
            debug_assert!(shift < num_levels);
            let level = max_level - shift;
            for i in 0..3 {
                ilo[i] >>= shift;
                ihi[i] >>= shift;
            }
            for z in ilo[2]..=ihi[2] {
                for y in ilo[1]..=ihi[1] {
                    for x in ilo[0]..=ihi[0] {
                        entries.push(Entry {
                            level,
                            code: make_code(x as u32, y as u32, z as u32)?,
                            splat_id: splat_id as i32,
                        });
                    }
                }
            }
        }

        // Level ascending, code descending. The descending codes let the
        // emission below update the shared start array in place: a slot is
        // read for its parent value before the pass reaches the slot itself.
        entries.sort_by(|a, b| a.level.cmp(&b.level).then(b.code.cmp(&a.code)));

        let mut distinct = 0usize;
        for (i, e) in entries.iter().enumerate() {
            if i == 0 || e.level != entries[i - 1].level || e.code != entries[i - 1].code {
                distinct += 1;
            }
        }
        let mut commands: Vec<i32> = Vec::with_capacity(entries.len() + distinct);
        let mut start = vec![-1i32; 1usize << (3 * max_level)];

        let mut p = 0usize;
        for level in 0..num_levels {
            let level_codes = 1u64 << (3 * level);
            for code in (0..level_codes).rev() {
                let mut q = p;
                while q < entries.len() && entries[q].level == level && entries[q].code == code {
                    q += 1;
                }
                let up = start[(code >> 3) as usize];
                let mut first = up;
                if p < q {
                    first = commands.len() as i32;
                    for e in &entries[p..q] {
                        commands.push(e.splat_id);
                    }
                    commands.push(if up == -1 { -1 } else { -2 - up });
                    p = q;
                }
                start[code as usize] = first;
            }
        }

        // Flatten the finest-level slots into a dense (x, y, z) lookup table
        // for the device image.
        let mut table = vec![-1i32; dims.iter().map(|&d| d as usize).product()];
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    let idx = ((z as usize * dims[1] as usize) + y as usize) * dims[0] as usize
                        + x as usize;
                    table[idx] = start[make_code(x, y, z)? as usize];
                }
            }
        }

        Ok(SplatTree {
            num_levels,
            dims,
            commands,
            start: table,
        })
    }

    pub fn num_levels(&self) -> u32 {
        self.num_levels
    }

    /// Vertex dimensions of the lookup table.
    pub fn dims(&self) -> [u32; 3] {
        self.dims
    }

    /// The traversal program shipped to the device.
    pub fn commands(&self) -> &[i32] {
        self.commands.as_slice()
    }

    /// Dense per-vertex lookup table of command offsets.
    pub fn start_table(&self) -> &[i32] {
        self.start.as_slice()
    }

    /// Command offset for a vertex, `-1` for empty or out-of-range lookups.
    pub fn start_at(&self, x: u32, y: u32, z: u32) -> i32 {
        if x >= self.dims[0] || y >= self.dims[1] || z >= self.dims[2] {
            return -1;
        }
        let idx =
            ((z as usize * self.dims[1] as usize) + y as usize) * self.dims[0] as usize + x as usize;
        self.start[idx]
    }

    /// Replay the traversal program for a vertex, as the device kernel would.
    pub fn splats_at(&self, x: u32, y: u32, z: u32) -> Vec<i32> {
        let mut out = Vec::new();
        let mut pos = self.start_at(x, y, z);
        while pos >= 0 {
            let mut p = pos as usize;
            loop {
                let cmd = self.commands[p];
                if cmd >= 0 {
                    out.push(cmd);
                    p += 1;
                } else {
                    pos = if cmd == -1 { -1 } else { -(cmd + 2) };
                    break;
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;

    #[test]
    fn test_single_vertex_splat() {
        // One splat influencing exactly one vertex: the whole program is one
        // run terminated by -1
        let grid = Grid::new(Vec3::ZERO, 1.0, [(0, 2), (0, 2), (0, 2)]);
        let splats = [Splat::new(Vec3::new(1.0, 1.0, 1.0), Vec3::Z, 0.9)];
        let tree = SplatTree::build(&splats, &grid).unwrap();
        assert_eq!(tree.commands(), &[0, -1]);
        assert_eq!(tree.splats_at(1, 1, 1), vec![0]);
        assert_eq!(tree.start_at(0, 0, 0), -1);
    }

    #[test]
    fn test_two_by_two_coverage() {
        // A splat covering vertices [0,1]^3 yields one run per covered cell,
        // each terminating with -1, and every covered lookup finds it
        let grid = Grid::new(Vec3::ZERO, 1.0, [(0, 1), (0, 1), (0, 1)]);
        let splats = [Splat::new(Vec3::new(0.5, 0.5, 0.5), Vec3::Z, 0.6)];
        let tree = SplatTree::build(&splats, &grid).unwrap();
        for z in 0..2 {
            for y in 0..2 {
                for x in 0..2 {
                    assert_eq!(tree.splats_at(x, y, z), vec![0]);
                    let run = tree.start_at(x, y, z);
                    assert!(run >= 0);
                    assert_eq!(tree.commands()[run as usize], 0);
                    assert_eq!(tree.commands()[run as usize + 1], -1);
                }
            }
        }
        assert_eq!(tree.start_at(2, 0, 0), -1);
        assert_eq!(tree.splats_at(5, 5, 5), Vec::<i32>::new());
    }

    #[test]
    fn test_jump_to_parent_run() {
        // A coarse splat and a fine splat in the same corner: the fine lookup
        // walks its own run, then jumps up to the coarse one
        let grid = Grid::new(Vec3::ZERO, 1.0, [(0, 4), (0, 4), (0, 4)]);
        let splats = [
            Splat::new(Vec3::new(2.0, 2.0, 2.0), Vec3::Z, 2.5), // covers all vertices
            Splat::new(Vec3::new(0.0, 0.0, 0.0), Vec3::Z, 0.4), // vertex (0,0,0) only
        ];
        let tree = SplatTree::build(&splats, &grid).unwrap();
        assert_eq!(tree.splats_at(0, 0, 0), vec![1, 0]);
        // Vertices away from the corner see only the coarse splat
        assert_eq!(tree.splats_at(3, 3, 3), vec![0]);
        assert_eq!(tree.splats_at(4, 4, 4), vec![0]);
    }

    #[test]
    fn test_splat_outside_grid_contributes_nothing() {
        let grid = Grid::new(Vec3::ZERO, 1.0, [(0, 2), (0, 2), (0, 2)]);
        let splats = [Splat::new(Vec3::new(10.0, 0.0, 0.0), Vec3::Z, 0.5)];
        let tree = SplatTree::build(&splats, &grid).unwrap();
        assert!(tree.commands().is_empty());
        assert!(tree.start_table().iter().all(|&s| s == -1));
    }

    #[test]
    fn test_boundary_splat_is_clamped() {
        // Influence pokes past the grid on the low side; the covered part of
        // the grid still indexes it
        let grid = Grid::new(Vec3::ZERO, 1.0, [(0, 4), (0, 4), (0, 4)]);
        let splats = [Splat::new(Vec3::new(0.1, 2.0, 2.0), Vec3::Z, 1.0)];
        let tree = SplatTree::build(&splats, &grid).unwrap();
        assert_eq!(tree.splats_at(0, 2, 2), vec![0]);
    }

    #[test]
    fn test_empty_bucket() {
        let grid = Grid::new(Vec3::ZERO, 1.0, [(0, 2), (0, 2), (0, 2)]);
        let tree = SplatTree::build(&[], &grid).unwrap();
        assert!(tree.commands().is_empty());
        assert!(tree.start_table().iter().all(|&s| s == -1));
    }

    #[test]
    fn test_all_starts_reference_valid_commands() {
        let grid = Grid::new(Vec3::ZERO, 1.0, [(0, 8), (0, 8), (0, 8)]);
        let splats: Vec<Splat> = (0..20)
            .map(|i| {
                let t = i as f32 * 0.37;
                Splat::new(
                    Vec3::new(
                        4.0 + 3.0 * t.sin(),
                        4.0 + 3.0 * t.cos(),
                        1.0 + (i % 7) as f32,
                    ),
                    Vec3::Z,
                    0.3 + 0.1 * (i % 3) as f32,
                )
            })
            .collect();
        let tree = SplatTree::build(&splats, &grid).unwrap();
        for z in 0..9 {
            for y in 0..9 {
                for x in 0..9 {
                    let run = tree.start_at(x, y, z);
                    assert!(run >= -1 && run < tree.commands().len() as i32);
                    for id in tree.splats_at(x, y, z) {
                        assert!((id as usize) < splats.len());
                    }
                }
            }
        }
    }
}
