//! Single-writer mesh assembly
//!
//! Mesh blocks from every device funnel through one worker (the assembler is
//! not thread-safe) into the mesh sink, keyed by chunk. The group's arena
//! bounds the host memory mesh blocks may occupy while queued; chunk
//! re-serialisation by generation number is the sink's concern.

use std::sync::Arc;

use crate::core::chunk::ChunkId;
use crate::core::error::Error;
use crate::core::stats::Registry;
use crate::core::types::Result;
use crate::pipeline::buffer::{Allocation, CircularBuffer};
use crate::pipeline::device::MeshData;
use crate::pipeline::group::{WorkHandler, WorkerGroup};

/// Consumer of finished mesh blocks.
///
/// Called from the single mesher worker, so there is never more than one
/// concurrent call per chunk. Chunks of different generations may arrive out
/// of order.
pub trait MeshWriter: Send + 'static {
    fn append(&mut self, chunk: ChunkId, mesh: &MeshData) -> Result<()>;
}

pub struct MeshWork {
    pub chunk_id: ChunkId,
    pub mesh: MeshData,
}

pub struct MesherItem {
    work: Option<MeshWork>,
    alloc: Option<Allocation>,
}

pub struct MesherGroup {
    group: WorkerGroup<MesherHandler>,
    mesh_buffer: CircularBuffer,
}

impl MesherGroup {
    pub fn new(mem_mesh: usize, num_items: usize, queue_capacity: usize) -> Self {
        let items = (0..num_items.max(1))
            .map(|_| MesherItem {
                work: None,
                alloc: None,
            })
            .collect();
        let mut group = WorkerGroup::new("mesher", items, queue_capacity);
        group.set_free_hook(Arc::new(|item: &mut MesherItem| {
            item.work = None;
            item.alloc = None; // releases the arena region
        }));
        Self {
            group,
            mesh_buffer: CircularBuffer::new("mem.mesher.mesh", mem_mesh),
        }
    }

    /// Hand over the sink and start the single worker.
    pub fn start(&self, writer: Box<dyn MeshWriter>) {
        self.group.start(vec![MesherHandler { writer }]);
    }

    pub fn stop(&self) -> Result<()> {
        self.group.stop()
    }

    /// Queue a mesh block, charging its size against the mesh arena.
    pub fn push_mesh(&self, chunk_id: ChunkId, mesh: MeshData) -> Result<()> {
        let bytes = mesh.byte_size().max(1);
        if bytes > self.mesh_buffer.capacity() {
            return Err(Error::Resource(format!(
                "mesh block of {bytes} bytes exceeds the mesh memory budget"
            )));
        }
        let mut item = self.group.get()?;
        item.alloc = Some(self.mesh_buffer.allocate(bytes));
        item.work = Some(MeshWork { chunk_id, mesh });
        self.group.push(item)
    }
}

struct MesherHandler {
    writer: Box<dyn MeshWriter>,
}

impl WorkHandler for MesherHandler {
    type Item = MesherItem;

    fn process(&mut self, item: &mut MesherItem) -> Result<()> {
        let work = item
            .work
            .take()
            .ok_or(Error::State("empty mesher work item"))?;
        self.writer.append(work.chunk_id, &work.mesh)?;
        let stats = Registry::global();
        stats
            .counter("mesher.triangles")
            .add(work.mesh.triangles.len() as u64);
        stats
            .counter("mesher.vertices")
            .add(work.mesh.vertices.len() as u64);
        Ok(())
    }
}
