//! Staging of bucket splats into device work items
//!
//! A single worker batches incoming buckets into a pinned staging buffer
//! sized to one device item. When the buffer cannot take the next bucket it
//! flushes: pick a device, claim one of its items, start the asynchronous
//! upload, queue the item, and only then wait for the transfer so the staging
//! buffer can refill. Waiting after the push is not a synchronous transfer:
//! the device can start as soon as the DMA lands.

use std::sync::Arc;

use bytemuck::Zeroable;

use crate::core::chunk::ChunkId;
use crate::core::error::Error;
use crate::core::stats::Registry;
use crate::core::types::{Result, Vec3};
use crate::math::Grid;
use crate::pipeline::buffer::Allocation;
use crate::pipeline::device::{DeviceWorkerGroup, PopSignal, SubItem};
use crate::pipeline::group::{WorkHandler, WorkerGroup};
use crate::splat::Splat;

/// One loaded bucket headed for a device.
pub struct CopyWork {
    pub chunk_id: ChunkId,
    pub grid: Grid,
    /// Host-queue memory holding the bucket's splats
    pub splats: Option<Allocation>,
    pub num_splats: usize,
}

pub struct CopyItem {
    pub work: Option<CopyWork>,
}

pub struct CopyGroup {
    group: WorkerGroup<CopyHandler>,
    out_groups: Vec<Arc<DeviceWorkerGroup>>,
    pop: Arc<PopSignal>,
}

impl CopyGroup {
    pub fn new(
        out_groups: Vec<Arc<DeviceWorkerGroup>>,
        pop: Arc<PopSignal>,
        num_items: usize,
        queue_capacity: usize,
    ) -> Self {
        assert!(!out_groups.is_empty(), "copy stage needs at least one device");
        let items = (0..num_items.max(1)).map(|_| CopyItem { work: None }).collect();
        Self {
            group: WorkerGroup::new("copy", items, queue_capacity),
            out_groups,
            pop,
        }
    }

    pub fn start(&self) {
        let max_splats = self.out_groups[0].max_item_splats();
        self.group.start(vec![CopyHandler {
            out_groups: self.out_groups.clone(),
            pop: self.pop.clone(),
            pinned: vec![Splat::zeroed(); max_splats],
            buffered: Vec::new(),
            buffered_splats: 0,
            max_device_item_splats: max_splats,
        }]);
    }

    pub fn stop(&self) -> Result<()> {
        self.group.stop()
    }

    pub fn get(&self) -> Result<CopyItem> {
        self.group.get()
    }

    pub fn push(&self, item: CopyItem) -> Result<()> {
        self.group.push(item)
    }
}

struct CopyHandler {
    out_groups: Vec<Arc<DeviceWorkerGroup>>,
    pop: Arc<PopSignal>,
    /// Staging buffer for one device item's worth of splats
    pinned: Vec<Splat>,
    buffered: Vec<SubItem>,
    buffered_splats: usize,
    max_device_item_splats: usize,
}

impl CopyHandler {
    /// Pick the device to ship the batch to: any group with a free item slot,
    /// preferring the largest unallocated budget (the one likeliest to run
    /// dry soonest). Waits on the shared pop signal when none has a slot.
    fn choose_device(&self) -> Result<Arc<DeviceWorkerGroup>> {
        let mut guard = self.pop.mutex.lock().unwrap();
        loop {
            let mut best: Option<(u64, &Arc<DeviceWorkerGroup>)> = None;
            for group in &self.out_groups {
                if group.can_get() {
                    let unallocated = group.unallocated();
                    if best.map_or(true, |(b, _)| unallocated >= b) {
                        best = Some((unallocated, group));
                    }
                }
            }
            if let Some((_, group)) = best {
                return Ok(group.clone());
            }
            guard = self.pop.cond.wait(guard).unwrap();
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let out_group = self.choose_device()?;

        // The pool slot was observed free under the pop lock, so this get
        // cannot block.
        let mut item = out_group.get(self.buffered_splats)?;
        let count = self.buffered_splats;
        item.num_splats = count;
        item.splats[..count].copy_from_slice(&self.pinned[..count]);
        std::mem::swap(&mut item.sub_items, &mut self.buffered);

        let event = out_group.device().write_splats(item.slot, &item.splats[..count])?;
        item.copy_event = Some(event.clone());
        out_group.push(item)?;

        // Wait after the push: the item is already queued, and a completed
        // transfer means the staging buffer is safe to refill.
        event.wait()?;
        Registry::global()
            .counter("copy.write.bytes")
            .add((count * std::mem::size_of::<Splat>()) as u64);
        self.buffered_splats = 0;
        Ok(())
    }
}

impl WorkHandler for CopyHandler {
    type Item = CopyItem;

    fn process(&mut self, item: &mut CopyItem) -> Result<()> {
        let work = item.work.take().ok_or(Error::State("empty copy work item"))?;
        if work.num_splats > self.max_device_item_splats {
            return Err(Error::Resource(format!(
                "bucket of {} splats exceeds the device item size {}",
                work.num_splats, self.max_device_item_splats
            )));
        }
        if self.buffered_splats + work.num_splats > self.max_device_item_splats {
            self.flush()?;
        }

        let alloc = work
            .splats
            .as_ref()
            .ok_or(Error::State("copy work without splats"))?;
        let src: &[Splat] = bytemuck::cast_slice(alloc.as_slice());
        let src = &src[..work.num_splats];

        // Splats strictly inside the bucket's half-open extents are the ones
        // accounted to the progress meter; boundary copies are counted once
        // by whichever bucket owns them.
        let dims = work.grid.dims();
        let mut progress_splats = 0u64;
        let dst = &mut self.pinned[self.buffered_splats..self.buffered_splats + work.num_splats];
        for (out, splat) in dst.iter_mut().zip(src) {
            let v = work.grid.world_to_vertex(Vec3::from(splat.position));
            let inside = (0..3).all(|i| v[i] >= 0.0 && v[i] < dims[i] as f32);
            progress_splats += inside as u64;
            *out = *splat;
        }

        self.buffered.push(SubItem {
            chunk_id: work.chunk_id,
            grid: work.grid,
            first_splat: self.buffered_splats,
            num_splats: work.num_splats,
            progress_splats,
        });
        self.buffered_splats += work.num_splats;

        let stats = Registry::global();
        stats.counter("copy.splats").add(work.num_splats as u64);
        stats.counter("copy.size").add(work.grid.num_cells_total());
        // Dropping the work frees its host-queue allocation
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.flush()
    }
}
