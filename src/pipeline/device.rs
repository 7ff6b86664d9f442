//! Per-GPU worker groups and the kernel facade
//!
//! The pipeline core drives the GPU through a small facade: an asynchronous
//! splat upload per work item, and per-worker kernel state that consumes the
//! host-built splat tree and produces mesh data. Implementations wrap the
//! actual device queues; tests substitute mocks.

use std::sync::{Arc, Condvar, Mutex};

use bytemuck::Zeroable;

use crate::core::chunk::ChunkId;
use crate::core::error::Error;
use crate::core::progress::ProgressMeter;
use crate::core::stats::Registry;
use crate::core::types::Result;
use crate::math::{round_up, Grid};
use crate::pipeline::group::{WorkHandler, WorkerGroup};
use crate::pipeline::mesher::MesherGroup;
use crate::splat::Splat;
use crate::tree::SplatTree;

/// Completion handle for an asynchronous device operation.
pub trait GpuEvent: Send + Sync {
    /// Block until the operation has landed on the device.
    fn wait(&self) -> Result<()>;
}

/// One physical GPU, shared by its worker group and the copy stage.
pub trait GpuDevice: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Begin an asynchronous host-to-device write of `splats` into the item
    /// buffer `slot`. Returns an event completing when the transfer lands.
    fn write_splats(&self, slot: usize, splats: &[Splat]) -> Result<Arc<dyn GpuEvent>>;

    /// Kernel state for one device worker thread.
    fn create_worker(&self) -> Result<Box<dyn GpuWorker>>;

    /// Work-group granularity of the MLS kernel; octree sizes are rounded up
    /// to it.
    fn mls_group_size(&self) -> [u32; 3];
}

/// Per-worker kernel facade: splat-tree upload, MLS evaluation and marching
/// triangle extraction.
pub trait GpuWorker: Send {
    /// Ship the host-built tree for splats `[first, first + count)` of the
    /// slot's buffer; must not start before `wait` completes.
    #[allow(clippy::too_many_arguments)]
    fn enqueue_tree(
        &mut self,
        slot: usize,
        first: usize,
        count: usize,
        tree: &SplatTree,
        expanded_size: [u32; 3],
        offset: [i32; 3],
        wait: &Arc<dyn GpuEvent>,
    ) -> Result<Arc<dyn GpuEvent>>;

    /// Run MLS + marching over `size` vertices at `offset`, awaiting `wait`.
    fn generate(
        &mut self,
        slot: usize,
        size: [u32; 3],
        offset: [i32; 3],
        wait: &Arc<dyn GpuEvent>,
    ) -> Result<MeshData>;

    /// Release the splat-tree buffers for the next sub-item.
    fn clear(&mut self) -> Result<()>;
}

/// Triangle soup produced for one sub-item.
#[derive(Debug, Default, Clone)]
pub struct MeshData {
    pub vertices: Vec<[f32; 3]>,
    pub triangles: Vec<[u32; 3]>,
}

impl MeshData {
    pub fn byte_size(&self) -> usize {
        self.vertices.len() * std::mem::size_of::<[f32; 3]>()
            + self.triangles.len() * std::mem::size_of::<[u32; 3]>()
    }
}

/// One bucket's worth of work inside a batched device item.
#[derive(Debug, Clone)]
pub struct SubItem {
    pub chunk_id: ChunkId,
    pub grid: Grid,
    /// Index of the first splat within the item's buffer
    pub first_splat: usize,
    pub num_splats: usize,
    /// Splats whose position lies inside the bucket's half-open extents;
    /// credited to the progress meter only
    pub progress_splats: u64,
}

/// A batched work item: one pinned-buffer flush worth of sub-items.
pub struct DeviceItem {
    /// Index of the device-side splat buffer this item owns
    pub slot: usize,
    /// Host mirror of the device buffer (the splat tree is built from it)
    pub splats: Box<[Splat]>,
    pub num_splats: usize,
    pub sub_items: Vec<SubItem>,
    pub copy_event: Option<Arc<dyn GpuEvent>>,
}

/// Shared mutex/condvar pair the copy stage waits on when every device's item
/// pool is empty. One instance serves all device groups.
#[derive(Default)]
pub struct PopSignal {
    pub mutex: Mutex<()>,
    pub cond: Condvar,
}

impl PopSignal {
    pub fn new() -> Self {
        Self::default()
    }
}

struct DeviceShared {
    /// Splat budget not yet claimed by in-flight items
    unallocated: Mutex<u64>,
    pop: Arc<PopSignal>,
}

/// Worker pool for one physical GPU.
pub struct DeviceWorkerGroup {
    group: WorkerGroup<DeviceHandler>,
    shared: Arc<DeviceShared>,
    device: Arc<dyn GpuDevice>,
    mesher: Arc<MesherGroup>,
    progress: Option<Arc<dyn ProgressMeter>>,
    num_workers: usize,
    max_item_splats: usize,
    initial_budget: u64,
}

impl DeviceWorkerGroup {
    /// Device memory the group will claim for its item buffers.
    pub fn resource_usage(num_workers: usize, spare: usize, max_item_splats: usize) -> u64 {
        ((num_workers + spare) * max_item_splats) as u64 * std::mem::size_of::<Splat>() as u64
    }

    pub fn new(
        device: Arc<dyn GpuDevice>,
        num_workers: usize,
        spare: usize,
        max_item_splats: usize,
        pop: Arc<PopSignal>,
        mesher: Arc<MesherGroup>,
        progress: Option<Arc<dyn ProgressMeter>>,
    ) -> Arc<Self> {
        assert!(num_workers > 0 && max_item_splats > 0);
        let items = num_workers + spare;
        let pool: Vec<DeviceItem> = (0..items)
            .map(|slot| DeviceItem {
                slot,
                splats: vec![Splat::zeroed(); max_item_splats].into_boxed_slice(),
                num_splats: 0,
                sub_items: Vec::new(),
                copy_event: None,
            })
            .collect();

        let mut group = WorkerGroup::new("device", pool, items);
        group.set_free_hook(Arc::new(|item: &mut DeviceItem| {
            item.sub_items.clear();
            item.copy_event = None;
            item.num_splats = 0;
        }));
        {
            let pop = pop.clone();
            group.set_release_hook(Arc::new(move || {
                let _guard = pop.mutex.lock().unwrap();
                pop.cond.notify_all();
            }));
        }

        let initial_budget = (items * max_item_splats) as u64;
        Arc::new(Self {
            group,
            shared: Arc::new(DeviceShared {
                unallocated: Mutex::new(initial_budget),
                pop,
            }),
            device,
            mesher,
            progress,
            num_workers,
            max_item_splats,
            initial_budget,
        })
    }

    pub fn start(&self) -> Result<()> {
        let mut handlers = Vec::with_capacity(self.num_workers);
        for _ in 0..self.num_workers {
            handlers.push(DeviceHandler {
                kernels: self.device.create_worker()?,
                wgs: self.device.mls_group_size(),
                shared: self.shared.clone(),
                mesher: self.mesher.clone(),
                progress: self.progress.clone(),
            });
        }
        self.group.start(handlers);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.group.stop()
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn max_item_splats(&self) -> usize {
        self.max_item_splats
    }

    /// Splat budget the group started with.
    pub fn initial_budget(&self) -> u64 {
        self.initial_budget
    }

    /// Splat budget currently unclaimed. The copy stage uses this to pick the
    /// device likeliest to run dry next.
    pub fn unallocated(&self) -> u64 {
        *self.shared.unallocated.lock().unwrap()
    }

    /// True iff an item is available right now, reported without blocking so
    /// the copy stage can poll across devices.
    pub fn can_get(&self) -> bool {
        self.group.can_get()
    }

    /// Claim an item, charging `num_splats` against the budget. Blocks while
    /// the pool is empty.
    pub fn get(&self, num_splats: usize) -> Result<DeviceItem> {
        debug_assert!(num_splats <= self.max_item_splats);
        let item = self.group.get()?;
        let mut budget = self.shared.unallocated.lock().unwrap();
        *budget = budget.saturating_sub(num_splats as u64);
        Ok(item)
    }

    pub fn push(&self, item: DeviceItem) -> Result<()> {
        self.group.push(item)
    }
}

struct DeviceHandler {
    kernels: Box<dyn GpuWorker>,
    wgs: [u32; 3],
    shared: Arc<DeviceShared>,
    mesher: Arc<MesherGroup>,
    progress: Option<Arc<dyn ProgressMeter>>,
}

impl WorkHandler for DeviceHandler {
    type Item = DeviceItem;

    fn process(&mut self, item: &mut DeviceItem) -> Result<()> {
        let copy_event = item
            .copy_event
            .clone()
            .ok_or(Error::State("device item has no copy event"))?;
        let compute = Registry::global().counter("device.compute.splats");
        for sub in &item.sub_items {
            let mut offset = [0i32; 3];
            let mut size = [0u32; 3];
            for i in 0..3 {
                offset[i] = sub.grid.extent(i).0;
                // Vertices, not cells: marching does per-vertex queries and
                // needs the row just beyond the last cell.
                size[i] = sub.grid.num_vertices(i);
            }
            let expanded = [
                round_up(size[0], self.wgs[0]),
                round_up(size[1], self.wgs[1]),
                round_up(size[2], self.wgs[2]),
            ];

            let splats = &item.splats[sub.first_splat..sub.first_splat + sub.num_splats];
            let tree = SplatTree::build(splats, &sub.grid)?;
            let tree_event = self.kernels.enqueue_tree(
                item.slot,
                sub.first_splat,
                sub.num_splats,
                &tree,
                expanded,
                offset,
                &copy_event,
            )?;
            let mesh = self
                .kernels
                .generate(item.slot, size, offset, &tree_event)?;
            self.mesher.push_mesh(sub.chunk_id, mesh)?;
            self.kernels.clear()?;

            compute.add(sub.num_splats as u64);
            if let Some(progress) = &self.progress {
                progress.add(sub.progress_splats);
            }
            let mut budget = self.shared.unallocated.lock().unwrap();
            *budget += sub.num_splats as u64;
        }
        Ok(())
    }
}
