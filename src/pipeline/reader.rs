//! Reader stage: bucket ranges to raw splat chunks
//!
//! Walks each bucket's splat ranges in ID order, merges adjacent requests
//! whose gap is cheaper to read through than to seek over, and loads the
//! merged runs into the read arena. The per-range chunks emitted downstream
//! share the merged allocation.

use std::sync::Arc;

use crate::core::error::Error;
use crate::core::stats::Registry;
use crate::core::types::Result;
use crate::pipeline::buffer::{Allocation, CircularBuffer};
use crate::pipeline::group::{WorkHandler, WorkerGroup};
use crate::pipeline::loader::LoaderGroup;
use crate::pipeline::BucketWork;
use crate::splat::set::{split_splat_id, FileSet};
use crate::splat::Splat;

/// Largest merged read, in splats.
const MAX_READ_SPLATS: usize = 1 << 16;

/// Largest hole worth reading through instead of splitting the request.
const MERGE_GAP_SPLATS: usize = 1024;

/// A contiguous run of raw splats belonging to one bucket.
pub struct LoadChunk {
    pub work: Arc<BucketWork>,
    /// Read-arena memory holding the merged run this chunk is part of
    pub splats: Arc<Allocation>,
    /// Splat offset of this chunk within the allocation
    pub offset: usize,
    pub count: usize,
    /// Set on the bucket's final chunk
    pub last: bool,
}

pub struct ReadItem {
    pub work: Option<Arc<BucketWork>>,
}

pub struct ReaderGroup {
    group: WorkerGroup<ReaderHandler>,
    files: Arc<FileSet>,
    buffer: Arc<CircularBuffer>,
    loader: Arc<LoaderGroup>,
}

impl ReaderGroup {
    pub fn new(
        files: Arc<FileSet>,
        buffer: Arc<CircularBuffer>,
        loader: Arc<LoaderGroup>,
        num_items: usize,
        queue_capacity: usize,
    ) -> Self {
        let items = (0..num_items.max(1)).map(|_| ReadItem { work: None }).collect();
        Self {
            group: WorkerGroup::new("reader", items, queue_capacity),
            files,
            buffer,
            loader,
        }
    }

    pub fn start(&self) {
        self.group.start(vec![ReaderHandler {
            files: self.files.clone(),
            buffer: self.buffer.clone(),
            loader: self.loader.clone(),
        }]);
    }

    pub fn stop(&self) -> Result<()> {
        self.group.stop()
    }

    pub fn get(&self) -> Result<ReadItem> {
        self.group.get()
    }

    pub fn push(&self, item: ReadItem) -> Result<()> {
        self.group.push(item)
    }
}

struct ReaderHandler {
    files: Arc<FileSet>,
    buffer: Arc<CircularBuffer>,
    loader: Arc<LoaderGroup>,
}

impl WorkHandler for ReaderHandler {
    type Item = ReadItem;

    fn process(&mut self, item: &mut ReadItem) -> Result<()> {
        let work = item.work.take().ok_or(Error::State("empty reader item"))?;
        let ranges = &work.ranges;
        let merged_stat = Registry::global().counter("reader.merged.splats");
        // Merging must never grow a request past what the arena can serve
        // while other reads are in flight.
        let max_read = MAX_READ_SPLATS
            .min(self.buffer.capacity() / std::mem::size_of::<Splat>() / 2)
            .max(1);

        let mut i = 0;
        while i < ranges.len() {
            let first = ranges[i];
            let (file_id, _) = split_splat_id(first.start);

            // Merge forward while the next range is nearby in the same file.
            let mut end = first.end();
            let mut j = i + 1;
            while j < ranges.len() {
                let next = ranges[j];
                let (next_file, _) = split_splat_id(next.start);
                if next_file != file_id || next.start < end {
                    break;
                }
                let gap = (next.start - end) as usize;
                let total = (next.end() - first.start) as usize;
                if gap > MERGE_GAP_SPLATS || total > max_read {
                    break;
                }
                end = next.end();
                j += 1;
            }

            let count = (end - first.start) as usize;
            let mut alloc = self.buffer.allocate(count * std::mem::size_of::<Splat>());
            let out: &mut [Splat] = bytemuck::cast_slice_mut(alloc.as_mut_slice());
            self.files.read_range(first.start, out)?;
            merged_stat.add(count as u64);

            let alloc = Arc::new(alloc);
            for k in i..j {
                let range = ranges[k];
                let mut chunk_item = self.loader.get()?;
                chunk_item.chunk = Some(LoadChunk {
                    work: work.clone(),
                    splats: alloc.clone(),
                    offset: (range.start - first.start) as usize,
                    count: range.size as usize,
                    last: k + 1 == ranges.len(),
                });
                self.loader.push(chunk_item)?;
            }
            i = j;
        }
        Ok(())
    }
}
