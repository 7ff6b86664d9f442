//! Bucket loader stage: raw chunks to complete buckets
//!
//! Reassembles the reader's per-range chunks into one contiguous splat array
//! per bucket in the host queue arena, then hands the bucket to the copy
//! stage. Chunks of a bucket arrive in order from the single reader worker,
//! so one pending bucket at a time suffices.

use std::sync::Arc;

use crate::core::error::Error;
use crate::core::stats::Registry;
use crate::core::types::Result;
use crate::pipeline::buffer::{Allocation, CircularBuffer};
use crate::pipeline::copy::{CopyGroup, CopyWork};
use crate::pipeline::group::{WorkHandler, WorkerGroup};
use crate::pipeline::reader::LoadChunk;
use crate::pipeline::BucketWork;
use crate::splat::Splat;

pub struct LoaderItem {
    pub chunk: Option<LoadChunk>,
}

pub struct LoaderGroup {
    group: WorkerGroup<LoaderHandler>,
    buffer: Arc<CircularBuffer>,
    copy: Arc<CopyGroup>,
}

impl LoaderGroup {
    pub fn new(
        buffer: Arc<CircularBuffer>,
        copy: Arc<CopyGroup>,
        num_items: usize,
        queue_capacity: usize,
    ) -> Self {
        let items = (0..num_items.max(1))
            .map(|_| LoaderItem { chunk: None })
            .collect();
        Self {
            group: WorkerGroup::new("bucket-loader", items, queue_capacity),
            buffer,
            copy,
        }
    }

    pub fn start(&self) {
        // A single worker: the pending-bucket state relies on chunks arriving
        // in reader order.
        self.group.start(vec![LoaderHandler {
            buffer: self.buffer.clone(),
            copy: self.copy.clone(),
            pending: None,
        }]);
    }

    pub fn stop(&self) -> Result<()> {
        self.group.stop()
    }

    pub fn get(&self) -> Result<LoaderItem> {
        self.group.get()
    }

    pub fn push(&self, item: LoaderItem) -> Result<()> {
        self.group.push(item)
    }
}

struct PendingBucket {
    work: Arc<BucketWork>,
    alloc: Allocation,
    filled: usize,
}

struct LoaderHandler {
    buffer: Arc<CircularBuffer>,
    copy: Arc<CopyGroup>,
    pending: Option<PendingBucket>,
}

impl WorkHandler for LoaderHandler {
    type Item = LoaderItem;

    fn process(&mut self, item: &mut LoaderItem) -> Result<()> {
        let chunk = item.chunk.take().ok_or(Error::State("empty loader item"))?;

        if self.pending.is_none() {
            let bytes = chunk.work.splat_count as usize * std::mem::size_of::<Splat>();
            let alloc = self.buffer.allocate(bytes);
            self.pending = Some(PendingBucket {
                work: chunk.work.clone(),
                alloc,
                filled: 0,
            });
        }
        let Some(pending) = self.pending.as_mut() else {
            return Err(Error::State("bucket loader lost its pending bucket"));
        };
        if !Arc::ptr_eq(&pending.work, &chunk.work) {
            return Err(Error::State("bucket loader received interleaved buckets"));
        }

        let src: &[Splat] = bytemuck::cast_slice(chunk.splats.as_slice());
        let src = &src[chunk.offset..chunk.offset + chunk.count];
        let dst: &mut [Splat] = bytemuck::cast_slice_mut(pending.alloc.as_mut_slice());
        dst[pending.filled..pending.filled + chunk.count].copy_from_slice(src);
        pending.filled += chunk.count;

        if chunk.last {
            let Some(pending) = self.pending.take() else {
                return Err(Error::State("bucket loader lost its pending bucket"));
            };
            if pending.filled as u64 != pending.work.splat_count {
                return Err(Error::State("bucket splat count mismatch"));
            }
            Registry::global().counter("loader.buckets").add(1);
            let mut copy_item = self.copy.get()?;
            copy_item.work = Some(CopyWork {
                chunk_id: pending.work.chunk_id,
                grid: pending.work.grid,
                num_splats: pending.filled,
                splats: Some(pending.alloc),
            });
            self.copy.push(copy_item)?;
        }
        // Dropping the chunk releases its share of the read arena
        Ok(())
    }
}
