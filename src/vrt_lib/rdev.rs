use crate::vrt_lib::desc::VRT_SB_AREA_SIZE;
use crate::vrt_lib::error::{VrtError, VrtResult};
use crate::vrt_lib::extent::ExtentList;
use crate::vrt_lib::uuid::ExaUuid;
use log::*;

/// Per-rdev chunk accounting. The free set holds chunk indexes; chunk 0
/// starts right after the superblock area.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkTable {
    /// Chunk size in sectors
    pub chunk_size: u64,
    pub total_chunks_count: u64,
    pub free_chunks_count: u64,
    pub free_chunks: ExtentList,
}

impl ChunkTable {
    pub fn initialize(&mut self, chunk_size: u64, total_chunks_count: u64) {
        self.chunk_size = chunk_size;
        self.total_chunks_count = total_chunks_count;
        self.free_chunks_count = total_chunks_count;
        self.free_chunks = ExtentList::new();
        for index in 0..total_chunks_count {
            self.free_chunks.add(index);
        }
    }

    pub fn index_to_offset(&self, index: u64) -> u64 {
        assert!(self.chunk_size != 0);
        index * self.chunk_size + VRT_SB_AREA_SIZE
    }

    pub fn offset_to_index(&self, offset: u64) -> u64 {
        assert!(self.chunk_size != 0);
        (offset - VRT_SB_AREA_SIZE) / self.chunk_size
    }
}

/// A real device: one physical disk attached to one node, exposed to the
/// cluster through the network-block transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrtRealdev {
    pub uuid: ExaUuid,
    /// Transport id used to open the device
    pub nbd_uuid: ExaUuid,
    pub node_id: u32,
    pub spof_id: u32,
    /// Position within its group, preserved across replacement
    pub index: u32,
    /// Device size in sectors
    pub real_size: u64,
    pub local: bool,
    pub up: bool,
    pub chunks: ChunkTable,
}

impl VrtRealdev {
    pub fn new(uuid: ExaUuid, nbd_uuid: ExaUuid, node_id: u32, spof_id: u32,
               real_size: u64) -> VrtResult<Self> {
        if uuid.is_zero() || spof_id == 0 {
            return Err(VrtError::InvalidArg);
        }
        if real_size <= VRT_SB_AREA_SIZE {
            return Err(VrtError::RdevTooSmall);
        }
        Ok(Self {
            uuid,
            nbd_uuid,
            node_id,
            spof_id,
            index: 0,
            real_size,
            local: false,
            up: false,
            chunks: ChunkTable::default(),
        })
    }

    /// Sectors usable for chunks, once the superblock area is reserved
    pub fn usable_size(&self) -> u64 {
        self.real_size - VRT_SB_AREA_SIZE
    }

    /// Take the first free chunk. Returns its sector offset on the device.
    pub fn take_first_free_chunk(&mut self) -> Option<u64> {
        let index = self.chunks.free_chunks.first()?;
        let offset = self.chunks.index_to_offset(index);
        self.take_chunk_at_offset(offset);
        Some(offset)
    }

    /// Take the chunk at a given offset out of the free set
    pub fn take_chunk_at_offset(&mut self, offset: u64) {
        let index = self.chunks.offset_to_index(offset);
        assert!(index < self.chunks.total_chunks_count);

        self.chunks.free_chunks.remove(index);
        self.chunks.free_chunks_count -= 1;
    }

    /// Return a chunk to the free set
    pub fn put_chunk(&mut self, offset: u64) {
        let index = self.chunks.offset_to_index(offset);

        self.chunks.free_chunks.add(index);
        self.chunks.free_chunks_count += 1;
    }

    pub fn used_chunks_count(&self) -> u64 {
        self.chunks.total_chunks_count - self.chunks.free_chunks_count
    }

    /// Replace the physical disk under this rdev. The position in the group
    /// and the SPOF are preserved; chunk assignments stay valid since they
    /// are positional. The new disk comes up out of date, so the caller must
    /// start resync bookkeeping.
    pub fn replace(&mut self, new_uuid: ExaUuid, new_nbd_uuid: ExaUuid) -> VrtResult<()> {
        if new_uuid.is_zero() {
            return Err(VrtError::InvalidArg);
        }
        info!("replacing rdev {} with {}", self.uuid, new_uuid);
        self.uuid = new_uuid;
        self.nbd_uuid = new_nbd_uuid;
        self.up = false;
        Ok(())
    }
}
