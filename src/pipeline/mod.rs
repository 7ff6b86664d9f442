//! Multi-stage streaming pipeline
//!
//! ```text
//! files ──► [reader] ──raw chunks──► [bucket-loader] ──splat+grid──► [copy]
//!                                                                      │
//!                                              (least-loaded device)   ▼
//!                                     [device × N GPUs] ──mesh blocks──► [mesher]
//! ```
//!
//! Each stage is a pool of workers behind a bounded queue; byte arenas cap the
//! memory each stage may hold. The driver buckets the input, queues the
//! buckets to the reader, and winds the stages down front to back.

pub mod buffer;
pub mod copy;
pub mod device;
pub mod group;
pub mod loader;
pub mod mesher;
pub mod queue;
pub mod reader;

use std::collections::HashMap;
use std::sync::Arc;

use crate::bucket::{self, SplatRange};
use crate::core::chunk::ChunkId;
use crate::core::error::Error;
use crate::core::progress::{ProgressCounter, ProgressMeter};
use crate::core::types::Result;
use crate::math::Grid;
use crate::splat::blob::FastBlobSet;
use crate::splat::Splat;

use buffer::CircularBuffer;
use copy::CopyGroup;
use device::{DeviceWorkerGroup, GpuDevice, PopSignal};
use loader::LoaderGroup;
use mesher::{MeshWriter, MesherGroup};
use reader::ReaderGroup;

/// One bucket emitted by the recursion, as queued to the reader stage.
pub struct BucketWork {
    pub chunk_id: ChunkId,
    pub grid: Grid,
    /// Splat ranges, ordered by splat ID
    pub ranges: Vec<SplatRange>,
    pub splat_count: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Splat cap per bucket; also sizes the device items
    pub max_bucket_splats: u64,
    /// Cell cap per bucket side
    pub max_cells: u32,
    /// Fan-out cap of one bucket recursion level
    pub max_split: usize,
    /// Output chunk tile side, in grid cells
    pub chunk_cells: u32,
    pub read_buffer_bytes: usize,
    pub host_buffer_bytes: usize,
    pub mesh_buffer_bytes: usize,
    /// Worker threads per device
    pub device_workers: usize,
    /// Spare device items beyond one per worker
    pub device_spare: usize,
    /// Depth of the inter-stage queues and item pools
    pub queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_bucket_splats: 1 << 20,
            max_cells: 256,
            max_split: 1 << 14,
            chunk_cells: 1024,
            read_buffer_bytes: 64 << 20,
            host_buffer_bytes: 128 << 20,
            mesh_buffer_bytes: 128 << 20,
            device_workers: 2,
            device_spare: 1,
            queue_depth: 4,
        }
    }
}

#[derive(Debug)]
pub struct PipelineStats {
    pub buckets: u64,
    /// Splats credited to the progress meter (those inside the global grid)
    pub splats_processed: u64,
}

/// Reconstruct the surface for `splats` over `grid` on the given devices.
///
/// Blocks until every stage has drained. The first error raised anywhere
/// (bucketing or any worker) is returned; partial output is discarded by the
/// caller.
pub fn run(
    splats: &FastBlobSet,
    grid: &Grid,
    devices: &[Arc<dyn GpuDevice>],
    writer: Box<dyn MeshWriter>,
    config: &PipelineConfig,
) -> Result<PipelineStats> {
    if devices.is_empty() {
        return Err(Error::Resource("no compute devices".into()));
    }
    assert!(config.chunk_cells > 0);
    let bucket_bytes = config.max_bucket_splats as usize * std::mem::size_of::<Splat>();
    if bucket_bytes > config.read_buffer_bytes || bucket_bytes > config.host_buffer_bytes {
        return Err(Error::Resource(
            "one bucket of splats must fit the read and host buffers".into(),
        ));
    }

    let progress = Arc::new(ProgressCounter::new(splats.n_splats()));
    let mesher = Arc::new(MesherGroup::new(
        config.mesh_buffer_bytes,
        config.queue_depth,
        config.queue_depth,
    ));
    let pop = Arc::new(PopSignal::new());
    let device_groups: Vec<Arc<DeviceWorkerGroup>> = devices
        .iter()
        .map(|device| {
            DeviceWorkerGroup::new(
                device.clone(),
                config.device_workers,
                config.device_spare,
                config.max_bucket_splats as usize,
                pop.clone(),
                mesher.clone(),
                Some(progress.clone() as Arc<dyn ProgressMeter>),
            )
        })
        .collect();
    let copy = Arc::new(CopyGroup::new(
        device_groups.clone(),
        pop,
        config.queue_depth,
        config.queue_depth,
    ));
    let host_buffer = Arc::new(CircularBuffer::new(
        "mem.pipeline.host",
        config.host_buffer_bytes,
    ));
    let loader = Arc::new(LoaderGroup::new(
        host_buffer,
        copy.clone(),
        config.queue_depth,
        config.queue_depth,
    ));
    let read_buffer = Arc::new(CircularBuffer::new(
        "mem.pipeline.read",
        config.read_buffer_bytes,
    ));
    let reader = Arc::new(ReaderGroup::new(
        splats.files().clone(),
        read_buffer,
        loader.clone(),
        config.queue_depth,
        config.queue_depth,
    ));

    mesher.start(writer);
    for group in &device_groups {
        group.start()?;
    }
    copy.start();
    loader.start();
    reader.start();

    // Chunk generations are handed out in first-emission order; bucket
    // emission is deterministic, so the coords-to-generation mapping is
    // stable across runs.
    let mut gen_map: HashMap<[u32; 3], u32> = HashMap::new();
    let mut buckets = 0u64;
    let feed = bucket::bucket(
        splats.files().as_ref(),
        grid,
        config.max_bucket_splats,
        config.max_cells,
        config.max_split,
        |_, count, ranges, sub| {
            let mut coords = [0u32; 3];
            for i in 0..3 {
                coords[i] = ((sub.extent(i).0 - grid.extent(i).0) as u32) / config.chunk_cells;
            }
            let next = gen_map.len() as u32;
            let gen = *gen_map.entry(coords).or_insert(next);
            buckets += 1;
            let mut item = reader.get()?;
            item.work = Some(Arc::new(BucketWork {
                chunk_id: ChunkId::new(gen, coords),
                grid: *sub,
                ranges: ranges.to_vec(),
                splat_count: count,
            }));
            reader.push(item)
        },
    );

    // Wind the stages down front to back; the first failure anywhere wins.
    let mut result = feed;
    let mut merge = |r: Result<()>| {
        if result.is_ok() {
            if let Err(e) = r {
                result = Err(e);
            }
        }
    };
    merge(reader.stop());
    merge(loader.stop());
    merge(copy.stop());
    for group in &device_groups {
        merge(group.stop());
    }
    merge(mesher.stop());
    drop(merge);
    result?;

    log::info!(
        "pipeline complete: {} bucket(s), {} splat(s)",
        buckets,
        progress.current()
    );
    Ok(PipelineStats {
        buckets,
        splats_processed: progress.current(),
    })
}


#[cfg(test)]
mod tests {
    use super::testing::{CollectingWriter, MockDevice};
    use super::*;
    use crate::core::types::Vec3;
    use crate::pipeline::copy::CopyWork;
    use crate::splat::set::{FileSet, VecSplatFile};
    use std::time::Duration;

    fn lattice_set(n_side: usize, step: f32) -> Arc<FileSet> {
        let mut splats = Vec::new();
        for i in 0..n_side {
            for j in 0..n_side {
                for k in 0..n_side {
                    splats.push(Splat::new(
                        Vec3::new(
                            i as f32 * step + step / 2.0,
                            j as f32 * step + step / 2.0,
                            k as f32 * step + step / 2.0,
                        ),
                        Vec3::Z,
                        0.25,
                    ));
                }
            }
        }
        let mut set = FileSet::new();
        set.add_file(Box::new(VecSplatFile::new(splats))).unwrap();
        Arc::new(set)
    }

    #[test]
    fn test_end_to_end_single_device() {
        let mut set = FastBlobSet::new(lattice_set(10, 6.4));
        set.compute_blobs(1.0, 16, None, None).unwrap();
        let grid = *set.bounding_grid().unwrap();

        let device = MockDevice::new("mock0");
        let devices: Vec<Arc<dyn GpuDevice>> = vec![device.clone()];
        let writer = CollectingWriter::default();
        let blocks = writer.blocks.clone();
        let config = PipelineConfig {
            max_bucket_splats: 256,
            max_cells: 16,
            max_split: 4096,
            chunk_cells: 32,
            read_buffer_bytes: 1 << 20,
            host_buffer_bytes: 1 << 20,
            mesh_buffer_bytes: 1 << 20,
            device_workers: 2,
            device_spare: 1,
            queue_depth: 4,
        };
        let stats = run(&set, &grid, &devices, Box::new(writer), &config).unwrap();

        assert!(stats.buckets >= 64, "got {} buckets", stats.buckets);
        // Every lattice splat sits inside the bounding grid
        assert_eq!(stats.splats_processed, 1000);
        let blocks = blocks.lock().unwrap();
        assert_eq!(blocks.len() as u64, stats.buckets);
        assert!(blocks.iter().all(|&(_, tris)| tris == 1));
        assert!(device.writes.load(std::sync::atomic::Ordering::Relaxed) >= 1);
        // Chunk generations are dense starting at zero
        let max_gen = blocks.iter().map(|(c, _)| c.gen).max().unwrap();
        let distinct: std::collections::HashSet<[u32; 3]> =
            blocks.iter().map(|(c, _)| c.coords).collect();
        assert_eq!(distinct.len() as u32, max_gen + 1);
    }

    #[test]
    fn test_four_devices_all_fed_and_budgets_restored() {
        use crate::core::progress::{ProgressCounter, ProgressMeter};
        use crate::pipeline::buffer::CircularBuffer;
        use crate::pipeline::device::PopSignal;
        use crate::pipeline::mesher::MesherGroup;

        const BUCKET_SPLATS: usize = 16;
        const MAX_ITEM: usize = 64;
        const BUCKETS: usize = 40;

        let mesher = Arc::new(MesherGroup::new(1 << 20, 8, 8));
        let progress = Arc::new(ProgressCounter::new((BUCKETS * BUCKET_SPLATS) as u64));
        let pop = Arc::new(PopSignal::new());
        let devices: Vec<Arc<MockDevice>> = (0..4)
            .map(|i| MockDevice::with_delay(&format!("mock{i}"), Duration::from_millis(5)))
            .collect();
        let groups: Vec<Arc<DeviceWorkerGroup>> = devices
            .iter()
            .map(|d| {
                DeviceWorkerGroup::new(
                    d.clone() as Arc<dyn GpuDevice>,
                    1,
                    1,
                    MAX_ITEM,
                    pop.clone(),
                    mesher.clone(),
                    Some(progress.clone() as Arc<dyn ProgressMeter>),
                )
            })
            .collect();
        let copy = Arc::new(CopyGroup::new(groups.clone(), pop, 8, 8));

        let writer = CollectingWriter::default();
        let blocks = writer.blocks.clone();
        mesher.start(Box::new(writer));
        for group in &groups {
            group.start().unwrap();
        }
        copy.start();

        // Feed buckets straight into the copy stage
        let host = CircularBuffer::new("test.host", 1 << 20);
        let grid = Grid::new(Vec3::ZERO, 1.0, [(0, 4), (0, 4), (0, 4)]);
        for b in 0..BUCKETS {
            let mut alloc = host.allocate(BUCKET_SPLATS * std::mem::size_of::<Splat>());
            {
                let splats: &mut [Splat] = bytemuck::cast_slice_mut(alloc.as_mut_slice());
                for (s, splat) in splats.iter_mut().enumerate() {
                    *splat = Splat::new(
                        Vec3::new((s % 4) as f32 + 0.5, ((s / 4) % 4) as f32 + 0.5, 2.0),
                        Vec3::Z,
                        0.25,
                    );
                }
            }
            let mut item = copy.get().unwrap();
            item.work = Some(CopyWork {
                chunk_id: ChunkId::new(b as u32, [b as u32, 0, 0]),
                grid,
                splats: Some(alloc),
                num_splats: BUCKET_SPLATS,
            });
            copy.push(item).unwrap();
        }

        copy.stop().unwrap();
        for group in &groups {
            group.stop().unwrap();
        }
        mesher.stop().unwrap();

        // Budgets drained back to their initial values
        for group in &groups {
            assert_eq!(group.unallocated(), group.initial_budget());
        }
        // Every device saw at least one batch, and nothing was lost
        let total: usize = devices
            .iter()
            .map(|d| d.splats_written.load(std::sync::atomic::Ordering::Relaxed))
            .sum();
        assert_eq!(total, BUCKETS * BUCKET_SPLATS);
        for device in &devices {
            assert!(
                device.writes.load(std::sync::atomic::Ordering::Relaxed) >= 1,
                "device {} never received work",
                device.label
            );
        }
        assert_eq!(blocks.lock().unwrap().len(), BUCKETS);
        // All 16 splats of each bucket lie inside the bucket grid
        assert_eq!(progress.current(), (BUCKETS * BUCKET_SPLATS) as u64);
    }

    #[test]
    fn test_run_without_devices_is_resource_error() {
        let mut set = FastBlobSet::new(lattice_set(2, 2.0));
        set.compute_blobs(1.0, 4, None, None).unwrap();
        let grid = *set.bounding_grid().unwrap();
        let err = run(
            &set,
            &grid,
            &[],
            Box::new(CollectingWriter::default()),
            &PipelineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }
}
