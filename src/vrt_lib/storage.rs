use crate::vrt_lib::desc::{kbytes_to_sectors, EXA_MAX_NODES_NUMBER, NBMAX_DISKS_PER_GROUP,
                           NBMAX_DISKS_PER_SPOF_GROUP, VRT_NBMAX_CHUNKS_PER_GROUP};
use crate::vrt_lib::error::{VrtError, VrtResult};
use crate::vrt_lib::nodeset::ExaNodeset;
use crate::vrt_lib::rdev::VrtRealdev;
use crate::vrt_lib::stream::{Stream, StreamExt};
use crate::vrt_lib::uuid::ExaUuid;
use log::*;

pub const STORAGE_HEADER_MAGIC: u32 = 0x7700FFCC;
pub const STORAGE_HEADER_FORMAT: u32 = 1;

/// Index of an rdev inside its storage arena
pub type RdevIndex = usize;

/// A correlated-failure domain: the disks whose failure is not independent,
/// typically all disks of one node.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SpofGroup {
    pub spof_id: u32,
    /// Indexes into the storage's rdev arena
    pub rdev_idxs: Vec<RdevIndex>,
}

impl SpofGroup {
    fn new(spof_id: u32) -> Self {
        Self { spof_id, rdev_idxs: vec![] }
    }
}

/// A chunk: a fixed-size contiguous sector range on one rdev.
///
/// Identity (for serialization and comparison) is the owning rdev's UUID
/// plus the sector offset on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub rdev_idx: RdevIndex,
    /// Sector offset of the chunk on its rdev
    pub offset: u64,
}

impl Chunk {
    pub fn equals(&self, other: &Chunk, storage: &Storage, other_storage: &Storage) -> bool {
        storage.rdevs[self.rdev_idx].uuid == other_storage.rdevs[other.rdev_idx].uuid
            && self.offset == other.offset
    }
}

/// The set of all disks backing a group, organized by SPOF group.
///
/// Rdevs live in a flat arena; SPOF groups and chunks refer to them by
/// index, which keeps ownership simple and serialization trivial.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Storage {
    pub rdevs: Vec<VrtRealdev>,
    pub spof_groups: Vec<SpofGroup>,
    /// Chunk size for all rdevs in the storage, in KiB. Set once, immutable.
    pub chunk_size: u32,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage chunk size. This must only be done once (and never
    /// change).
    fn set_chunk_size(&mut self, chunk_size: u32) -> VrtResult<()> {
        assert!(self.chunk_size == 0 || self.chunk_size == chunk_size);

        if chunk_size == 0 {
            return Err(VrtError::InvalidArg);
        }

        self.chunk_size = chunk_size;
        Ok(())
    }

    pub fn add_spof_group(&mut self, spof_id: u32) -> VrtResult<usize> {
        if spof_id == 0 {
            return Err(VrtError::InvalidArg);
        }

        if self.spof_groups.iter().any(|sg| sg.spof_id == spof_id) {
            return Err(VrtError::AlreadyExists);
        }

        if self.spof_groups.len() == EXA_MAX_NODES_NUMBER {
            return Err(VrtError::NoSpace);
        }

        self.spof_groups.push(SpofGroup::new(spof_id));
        Ok(self.spof_groups.len() - 1)
    }

    pub fn spof_group_by_id(&self, spof_id: u32) -> Option<&SpofGroup> {
        self.spof_groups.iter().find(|sg| sg.spof_id == spof_id)
    }

    pub fn num_realdevs(&self) -> usize {
        self.spof_groups.iter().map(|sg| sg.rdev_idxs.len()).sum()
    }

    /// Add an rdev, creating its SPOF group if needed. The rdev's `index`
    /// is its position within the group.
    pub fn add_rdev(&mut self, mut rdev: VrtRealdev) -> VrtResult<RdevIndex> {
        if rdev.spof_id == 0 {
            return Err(VrtError::InvalidArg);
        }

        if self.num_realdevs() == NBMAX_DISKS_PER_GROUP {
            return Err(VrtError::NoSpace);
        }

        if self.get_rdev_idx(&rdev.uuid).is_some() {
            return Err(VrtError::AlreadyExists);
        }

        let sg_idx = match self.spof_groups.iter().position(|sg| sg.spof_id == rdev.spof_id) {
            Some(i) => i,
            None => self.add_spof_group(rdev.spof_id)?,
        };

        if self.spof_groups[sg_idx].rdev_idxs.len() >= NBMAX_DISKS_PER_SPOF_GROUP {
            return Err(VrtError::NoSpace);
        }

        rdev.index = self.spof_groups[sg_idx].rdev_idxs.len() as u32;

        let rdev_idx = self.rdevs.len();
        self.rdevs.push(rdev);
        self.spof_groups[sg_idx].rdev_idxs.push(rdev_idx);

        Ok(rdev_idx)
    }

    pub fn get_rdev_idx(&self, uuid: &ExaUuid) -> Option<RdevIndex> {
        self.spof_groups.iter()
            .flat_map(|sg| sg.rdev_idxs.iter())
            .copied()
            .find(|i| self.rdevs[*i].uuid == *uuid)
    }

    /// Remove an rdev from its SPOF group. Only allowed while none of its
    /// chunks is allocated; the arena entry stays so that indexes held by
    /// the remaining SPOF groups keep their meaning.
    pub fn del_rdev(&mut self, uuid: &ExaUuid) -> VrtResult<()> {
        let idx = self.get_rdev_idx(uuid).ok_or(VrtError::NotFound)?;

        let chunks = &self.rdevs[idx].chunks;
        if chunks.free_chunks_count != chunks.total_chunks_count {
            return Err(VrtError::InvalidArg);
        }

        let sg_pos = self.spof_groups.iter()
            .position(|sg| sg.rdev_idxs.contains(&idx))
            .ok_or(VrtError::NotFound)?;

        self.spof_groups[sg_pos].rdev_idxs.retain(|i| *i != idx);

        // Positions within the group are preserved without holes
        let remaining = self.spof_groups[sg_pos].rdev_idxs.clone();
        for (n, i) in remaining.iter().enumerate() {
            self.rdevs[*i].index = n as u32;
        }

        if self.spof_groups[sg_pos].rdev_idxs.is_empty() {
            self.spof_groups.remove(sg_pos);
        }

        Ok(())
    }

    pub fn get_rdev(&self, uuid: &ExaUuid) -> Option<&VrtRealdev> {
        self.get_rdev_idx(uuid).map(|i| &self.rdevs[i])
    }

    pub fn get_rdev_mut(&mut self, uuid: &ExaUuid) -> Option<&mut VrtRealdev> {
        let i = self.get_rdev_idx(uuid)?;
        Some(&mut self.rdevs[i])
    }

    pub fn iter_rdevs(&self) -> impl Iterator<Item = &VrtRealdev> {
        self.spof_groups.iter()
            .flat_map(move |sg| sg.rdev_idxs.iter().map(move |i| &self.rdevs[*i]))
    }

    pub fn iter_spof_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.spof_groups.iter().map(|sg| sg.spof_id)
    }

    pub fn spof_group_free_chunk_count(&self, sg: &SpofGroup) -> u64 {
        sg.rdev_idxs.iter().map(|i| self.rdevs[*i].chunks.free_chunks_count).sum()
    }

    pub fn spof_group_total_chunk_count(&self, sg: &SpofGroup) -> u64 {
        sg.rdev_idxs.iter().map(|i| self.rdevs[*i].chunks.total_chunks_count).sum()
    }

    /// All nodes participating in a spof group
    pub fn spof_group_nodes(&self, sg: &SpofGroup) -> ExaNodeset {
        let mut nodes = ExaNodeset::new();
        for i in &sg.rdev_idxs {
            nodes.add(self.rdevs[*i].node_id);
        }
        nodes
    }

    /// Take a chunk from a spof group: picks the rdev with the least used
    /// chunks, then its first free chunk.
    pub fn spof_group_get_chunk(&mut self, sg_idx: usize) -> Option<Chunk> {
        let rdev_idx = {
            let sg = &self.spof_groups[sg_idx];
            let mut best: Option<RdevIndex> = None;
            let mut min_used = 0;

            for i in &sg.rdev_idxs {
                let rdev = &self.rdevs[*i];
                if rdev.chunks.free_chunks_count == 0 {
                    continue;
                }
                let nb_used = rdev.used_chunks_count();
                if best.is_none() || nb_used < min_used {
                    best = Some(*i);
                    min_used = nb_used;
                }
            }
            best?
        };

        let offset = self.rdevs[rdev_idx].take_first_free_chunk()?;
        Some(Chunk { rdev_idx, offset })
    }

    /// Return a chunk to its rdev's free set
    pub fn put_chunk(&mut self, chunk: Chunk) {
        self.rdevs[chunk.rdev_idx].put_chunk(chunk.offset);
    }

    fn cut_rdev_in_chunks(chunk_size_kb: u32, rdev: &mut VrtRealdev) -> VrtResult<()> {
        let total_size = rdev.usable_size();
        let chunk_size = kbytes_to_sectors(chunk_size_kb as u64);

        assert!(total_size > 0);
        assert!(chunk_size > 0);

        if chunk_size > total_size {
            return Err(VrtError::RdevTooSmall);
        }

        rdev.chunks.initialize(chunk_size, total_size / chunk_size);
        Ok(())
    }

    /// Cut every rdev's usable area into chunks of `chunk_size` KiB
    pub fn cut_in_chunks(&mut self, chunk_size: u32) -> VrtResult<()> {
        self.set_chunk_size(chunk_size)?;

        let mut total_chunks_count = 0;
        for rdev in self.rdevs.iter_mut() {
            Self::cut_rdev_in_chunks(chunk_size, rdev)?;
            total_chunks_count += rdev.chunks.total_chunks_count;
        }

        if total_chunks_count > VRT_NBMAX_CHUNKS_PER_GROUP {
            return Err(VrtError::TooManyChunks);
        }

        Ok(())
    }

    fn initialize_rdev_chunks_info(chunk_size_kb: u32, rdev: &mut VrtRealdev,
                                   total_chunks_count: u64) {
        rdev.chunks.initialize(kbytes_to_sectors(chunk_size_kb as u64),
                               total_chunks_count);
    }

    pub fn serialized_size(&self) -> u64 {
        // Header + one record per rdev
        16 + self.num_realdevs() as u64 * 24
    }

    /// Serialize the chunk_size and minimal rdev information
    pub fn serialize(&self, stream: &mut dyn Stream) -> VrtResult<()> {
        stream.write_u32_le(STORAGE_HEADER_MAGIC)?;
        stream.write_u32_le(STORAGE_HEADER_FORMAT)?;
        stream.write_u32_le(self.chunk_size)?;
        stream.write_u32_le(self.num_realdevs() as u32)?;

        for rdev in self.iter_rdevs() {
            stream.write_all(&rdev.uuid.to_bytes())?;
            stream.write_u64_le(rdev.chunks.total_chunks_count)?;
        }

        Ok(())
    }

    /// Deserialize into a storage that already contains the matching set of
    /// rdevs. Only the chunk size and per-rdev chunk counts are restored.
    pub fn deserialize(&mut self, stream: &mut dyn Stream) -> VrtResult<()> {
        let magic = stream.read_u32_le()?;
        if magic != STORAGE_HEADER_MAGIC {
            return Err(VrtError::SbMagic);
        }

        let format = stream.read_u32_le()?;
        if format != STORAGE_HEADER_FORMAT {
            return Err(VrtError::SbFormat);
        }

        let chunk_size = stream.read_u32_le()?;
        let nb_rdevs = stream.read_u32_le()?;

        if nb_rdevs as usize != self.num_realdevs() {
            warn!("storage image has {} rdevs, {} expected",
                  nb_rdevs, self.num_realdevs());
            return Err(VrtError::SbCorruption);
        }

        self.set_chunk_size(chunk_size)?;

        for _ in 0..nb_rdevs {
            let mut uuid_bytes = [0u8; 16];
            stream.read_exact(&mut uuid_bytes)?;
            let uuid = ExaUuid::from_bytes(&uuid_bytes);
            let total_chunks_count = stream.read_u64_le()?;

            let rdev = self.get_rdev_mut(&uuid).ok_or(VrtError::SbCorruption)?;
            Self::initialize_rdev_chunks_info(chunk_size, rdev, total_chunks_count);
        }

        Ok(())
    }

    /// Just the serialized parts are tested for equality
    pub fn equals(&self, other: &Storage) -> bool {
        if self.chunk_size != other.chunk_size {
            return false;
        }

        if self.num_realdevs() != other.num_realdevs() {
            return false;
        }

        for r1 in self.iter_rdevs() {
            match other.get_rdev(&r1.uuid) {
                None => return false,
                Some(r2) => {
                    if r1.chunks.total_chunks_count != r2.chunks.total_chunks_count {
                        return false;
                    }
                }
            }
        }

        true
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::vrt_lib::desc::VRT_SB_AREA_SIZE;

    /// Storage with `nb_spofs` SPOF groups of `rdevs_per_spof` rdevs each,
    /// every rdev large enough for `chunks_per_rdev` chunks of
    /// `chunk_size_kb`, already cut in chunks.
    pub fn make_storage(nb_spofs: u32, rdevs_per_spof: u32, chunks_per_rdev: u64,
                        chunk_size_kb: u32) -> Storage {
        let mut storage = Storage::new();
        let chunk_sectors = kbytes_to_sectors(chunk_size_kb as u64);

        for spof in 1..=nb_spofs {
            for disk in 0..rdevs_per_spof {
                let n = spof * 100 + disk;
                let rdev = VrtRealdev::new(ExaUuid::new(n, 0, 0, 1),
                                           ExaUuid::new(n, 0, 0, 2),
                                           spof - 1, spof,
                                           VRT_SB_AREA_SIZE + chunks_per_rdev * chunk_sectors)
                    .unwrap();
                storage.add_rdev(rdev).unwrap();
            }
        }

        storage.cut_in_chunks(chunk_size_kb).unwrap();
        storage
    }
}
