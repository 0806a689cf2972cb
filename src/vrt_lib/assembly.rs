use crate::vrt_lib::error::{VrtError, VrtResult};
use crate::vrt_lib::storage::{Chunk, Storage};
use crate::vrt_lib::stream::{Stream, StreamExt};
use crate::vrt_lib::uuid::ExaUuid;
use log::*;
use std::fmt;

/// A width-W tuple of chunks, one chunk per distinct SPOF group. The unit
/// of redundancy placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub chunks: Vec<Chunk>,
}

impl Slot {
    pub fn width(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Resolve a (column, in-chunk offset) pair to the backing device
    pub fn map_sector_to_rdev(&self, chunk_index: u32, offset: u64) -> (usize, u64) {
        let chunk = &self.chunks[chunk_index as usize];
        (chunk.rdev_idx, chunk.offset + offset)
    }

    pub fn equals(&self, other: &Slot, storage: &Storage, other_storage: &Storage) -> bool {
        if self.width() != other.width() {
            return false;
        }
        self.chunks.iter().zip(other.chunks.iter())
            .all(|(a, b)| a.equals(b, storage, other_storage))
    }

    pub fn serialized_size(&self) -> u64 {
        4 + self.chunks.len() as u64 * 24
    }

    pub fn serialize(&self, storage: &Storage, stream: &mut dyn Stream) -> VrtResult<()> {
        stream.write_u32_le(self.width())?;
        for chunk in &self.chunks {
            stream.write_all(&storage.rdevs[chunk.rdev_idx].uuid.to_bytes())?;
            stream.write_u64_le(chunk.offset)?;
        }
        Ok(())
    }

    /// Deserialize a slot, claiming its chunks from the storage's free sets
    pub fn deserialize(storage: &mut Storage, stream: &mut dyn Stream) -> VrtResult<Self> {
        let width = stream.read_u32_le()?;
        let mut chunks = Vec::with_capacity(width as usize);

        for _ in 0..width {
            let mut uuid_bytes = [0u8; 16];
            stream.read_exact(&mut uuid_bytes)?;
            let uuid = ExaUuid::from_bytes(&uuid_bytes);
            let offset = stream.read_u64_le()?;

            let rdev_idx = match storage.get_rdev_idx(&uuid) {
                Some(i) => i,
                None => {
                    // Give back what this slot already claimed
                    for chunk in chunks {
                        storage.put_chunk(chunk);
                    }
                    return Err(VrtError::SbCorruption);
                }
            };

            storage.rdevs[rdev_idx].take_chunk_at_offset(offset);
            chunks.push(Chunk { rdev_idx, offset });
        }

        Ok(Self { chunks })
    }
}

/// Dump helper rendering the slot through the storage (chunk owners are
/// identified by rdev uuid)
pub struct SlotDump<'a> {
    pub slot: &'a Slot,
    pub storage: &'a Storage,
}

impl fmt::Display for SlotDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "width: {}", self.slot.width())?;
        for (i, chunk) in self.slot.chunks.iter().enumerate() {
            writeln!(f, "chunk #{}: {} @ {}",
                     i, self.storage.rdevs[chunk.rdev_idx].uuid, chunk.offset)?;
        }
        Ok(())
    }
}

/// Dump helper for a whole assembly volume
pub struct AssemblyVolumeDump<'a> {
    pub av: &'a AssemblyVolume,
    pub group: &'a AssemblyGroup,
    pub storage: &'a Storage,
}

impl fmt::Display for AssemblyVolumeDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "assembly volume {}: {} slots", self.av.uuid, self.av.size_in_slots())?;
        for idx in &self.av.slot_idxs {
            write!(f, "{}", SlotDump { slot: self.group.slot(*idx), storage: self.storage })?;
        }
        Ok(())
    }
}

/// An ordered list of slots realizing one logical volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyVolume {
    pub uuid: ExaUuid,
    /// Indexes into the assembly group's slot pool
    pub slot_idxs: Vec<usize>,
}

impl AssemblyVolume {
    pub fn size_in_slots(&self) -> u64 {
        self.slot_idxs.len() as u64
    }
}

/// Chunks-to-slots bookkeeping for a whole group.
///
/// Freed slot entries stay in the pool as `None` so that the indexes held
/// by the remaining volumes stay valid.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AssemblyGroup {
    pub slot_width: u32,
    /// Chunk size in sectors, kept redundantly for the deserialization
    /// self-check
    pub chunk_size: u64,
    pub volumes: Vec<AssemblyVolume>,
    pub slots: Vec<Option<Slot>>,
}

impl AssemblyGroup {
    pub fn setup(slot_width: u32, chunk_size: u64) -> Self {
        Self { slot_width, chunk_size, volumes: vec![], slots: vec![] }
    }

    pub fn num_slots(&self) -> u32 {
        self.slots.iter().filter(|s| s.is_some()).count() as u32
    }

    pub fn slot(&self, idx: usize) -> &Slot {
        self.slots[idx].as_ref().expect("slot index points to a freed slot")
    }

    pub fn get_volume(&self, uuid: &ExaUuid) -> Option<&AssemblyVolume> {
        self.volumes.iter().find(|av| av.uuid == *uuid)
    }

    /// Build one slot by taking one chunk from each of the `slot_width`
    /// SPOF groups with the most free chunks. Ties are broken by ascending
    /// SPOF id so that the placement is deterministic.
    fn make_slot(&self, storage: &mut Storage) -> VrtResult<Slot> {
        // Snapshot of (free count, spof id, index), sorted by descending
        // free count then ascending id
        let mut spof_info: Vec<(u64, u32, usize)> = storage.spof_groups.iter().enumerate()
            .map(|(i, sg)| (storage.spof_group_free_chunk_count(sg), sg.spof_id, i))
            .collect();
        spof_info.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        if spof_info.len() < self.slot_width as usize {
            return Err(VrtError::NoSpace);
        }

        let mut chunks = Vec::with_capacity(self.slot_width as usize);
        for (_, _, sg_idx) in spof_info.iter().take(self.slot_width as usize) {
            match storage.spof_group_get_chunk(*sg_idx) {
                Some(chunk) => chunks.push(chunk),
                None => {
                    for chunk in chunks {
                        storage.put_chunk(chunk);
                    }
                    return Err(VrtError::NoSpace);
                }
            }
        }

        Ok(Slot { chunks })
    }

    fn add_slot(&mut self, slot: Slot) -> usize {
        match self.slots.iter().position(|s| s.is_none()) {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    /// Atomically build `n_slots` slots and attach them to a new assembly
    /// volume. On failure every partially-built slot is returned to the
    /// free pool.
    pub fn reserve_volume(&mut self, storage: &mut Storage, uuid: ExaUuid,
                          n_slots: u64) -> VrtResult<&AssemblyVolume> {
        if uuid.is_zero() || self.get_volume(&uuid).is_some() {
            return Err(VrtError::InvalidArg);
        }

        let mut new_slots = Vec::with_capacity(n_slots as usize);
        for _ in 0..n_slots {
            match self.make_slot(storage) {
                Ok(slot) => new_slots.push(slot),
                Err(err) => {
                    debug!("volume {} reservation rolled back after {} slots",
                           uuid, new_slots.len());
                    for slot in new_slots {
                        for chunk in slot.chunks {
                            storage.put_chunk(chunk);
                        }
                    }
                    return Err(err);
                }
            }
        }

        let slot_idxs = new_slots.into_iter().map(|s| self.add_slot(s)).collect();
        self.volumes.push(AssemblyVolume { uuid, slot_idxs });

        Ok(self.volumes.last().unwrap())
    }

    /// Release a volume's slots back to the storage
    pub fn release_volume(&mut self, storage: &mut Storage, uuid: &ExaUuid) -> VrtResult<()> {
        let pos = self.volumes.iter().position(|av| av.uuid == *uuid)
            .ok_or(VrtError::NotFound)?;

        let av = self.volumes.remove(pos);
        for idx in av.slot_idxs {
            if let Some(slot) = self.slots[idx].take() {
                for chunk in slot.chunks {
                    storage.put_chunk(chunk);
                }
            }
        }

        Ok(())
    }

    /// Map a logical sector of an assembly volume to (slot ordinal, offset
    /// within the slot)
    pub fn map(av: &AssemblyVolume, logical_sector: u64,
               logical_slot_size: u64) -> VrtResult<(usize, u64)> {
        let ordinal = (logical_sector / logical_slot_size) as usize;
        if ordinal >= av.slot_idxs.len() {
            return Err(VrtError::InvalidArg);
        }
        Ok((av.slot_idxs[ordinal], logical_sector % logical_slot_size))
    }

    pub fn volume_equals(&self, av: &AssemblyVolume, other: &AssemblyGroup,
                         other_av: &AssemblyVolume, storage: &Storage,
                         other_storage: &Storage) -> bool {
        if av.size_in_slots() != other_av.size_in_slots() {
            return false;
        }
        av.slot_idxs.iter().zip(other_av.slot_idxs.iter())
            .all(|(a, b)| self.slot(*a).equals(other.slot(*b), storage, other_storage))
    }

    pub fn equals(&self, other: &AssemblyGroup, storage: &Storage,
                  other_storage: &Storage) -> bool {
        if self.slot_width != other.slot_width
            || self.chunk_size != other.chunk_size
            || self.volumes.len() != other.volumes.len()
        {
            return false;
        }

        self.volumes.iter().zip(other.volumes.iter()).all(|(a, b)| {
            a.uuid == b.uuid && self.volume_equals(a, other, b, storage, other_storage)
        })
    }

    /// Map from live-slot pool index to serialized index
    fn serial_indexes(&self) -> Vec<Option<u32>> {
        let mut next = 0u32;
        self.slots.iter().map(|s| {
            s.as_ref().map(|_| {
                let i = next;
                next += 1;
                i
            })
        }).collect()
    }

    pub fn serialized_size(&self) -> u64 {
        let volumes: u64 = self.volumes.iter()
            .map(|av| 16 + 4 + av.slot_idxs.len() as u64 * 4)
            .sum();
        let slots: u64 = self.slots.iter().flatten()
            .map(|s| s.serialized_size())
            .sum();
        20 + volumes + slots
    }

    pub fn serialize(&self, storage: &Storage, stream: &mut dyn Stream) -> VrtResult<()> {
        let serial_idx = self.serial_indexes();

        stream.write_u32_le(self.slot_width)?;
        stream.write_u64_le(self.chunk_size)?;
        stream.write_u32_le(self.volumes.len() as u32)?;
        stream.write_u32_le(self.num_slots())?;

        for av in &self.volumes {
            stream.write_all(&av.uuid.to_bytes())?;
            stream.write_u32_le(av.slot_idxs.len() as u32)?;
            for idx in &av.slot_idxs {
                let serial = serial_idx[*idx].expect("volume references a freed slot");
                stream.write_u32_le(serial)?;
            }
        }

        for slot in self.slots.iter().flatten() {
            slot.serialize(storage, stream)?;
        }

        Ok(())
    }

    pub fn deserialize(storage: &mut Storage, stream: &mut dyn Stream) -> VrtResult<Self> {
        let slot_width = stream.read_u32_le()?;
        let chunk_size = stream.read_u64_le()?;
        let num_volumes = stream.read_u32_le()?;
        let num_slots = stream.read_u32_le()?;

        let mut volumes = Vec::with_capacity(num_volumes as usize);
        for _ in 0..num_volumes {
            let mut uuid_bytes = [0u8; 16];
            stream.read_exact(&mut uuid_bytes)?;
            let uuid = ExaUuid::from_bytes(&uuid_bytes);

            let size_in_slots = stream.read_u32_le()?;
            let mut slot_idxs = Vec::with_capacity(size_in_slots as usize);
            for _ in 0..size_in_slots {
                let idx = stream.read_u32_le()?;
                if idx >= num_slots {
                    return Err(VrtError::SbCorruption);
                }
                slot_idxs.push(idx as usize);
            }

            volumes.push(AssemblyVolume { uuid, slot_idxs });
        }

        let mut slots = Vec::with_capacity(num_slots as usize);
        for _ in 0..num_slots {
            let slot = Slot::deserialize(storage, stream)?;
            if slot.width() != slot_width {
                return Err(VrtError::SbCorruption);
            }
            slots.push(Some(slot));
        }

        Ok(Self { slot_width, chunk_size, volumes, slots })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vrt_lib::desc::VRT_MIN_CHUNK_SIZE;
    use crate::vrt_lib::storage::test_support::make_storage;
    use crate::vrt_lib::stream::{MemoryStream, StreamAccess};

    fn chunk_size_sectors() -> u64 {
        crate::vrt_lib::desc::kbytes_to_sectors(VRT_MIN_CHUNK_SIZE as u64)
    }

    #[test]
    fn reserved_volume_has_requested_slots_without_spof_overlap() -> VrtResult<()> {
        let mut storage = make_storage(3, 2, 8, VRT_MIN_CHUNK_SIZE);
        let mut ag = AssemblyGroup::setup(3, chunk_size_sectors());

        let uuid = ExaUuid::new(0, 0, 0, 42);
        let av = ag.reserve_volume(&mut storage, uuid, 5)?;
        assert_eq!(av.size_in_slots(), 5);
        let idxs = av.slot_idxs.clone();

        for idx in idxs {
            let slot = ag.slot(idx);
            assert_eq!(slot.width(), 3);
            let mut spofs: Vec<u32> = slot.chunks.iter()
                .map(|c| storage.rdevs[c.rdev_idx].spof_id)
                .collect();
            spofs.sort_unstable();
            spofs.dedup();
            assert_eq!(spofs.len(), 3, "chunks of one slot must not share a SPOF");
        }
        Ok(())
    }

    /// With equal free counts over spof ids {1,2,3} and width 3, the
    /// first slot takes one chunk from each spof in id order.
    #[test]
    fn slot_placement_tie_break_is_deterministic() -> VrtResult<()> {
        let mut storage = make_storage(3, 1, 4, VRT_MIN_CHUNK_SIZE);
        let mut ag = AssemblyGroup::setup(3, chunk_size_sectors());

        let av = ag.reserve_volume(&mut storage, ExaUuid::new(0, 0, 0, 1), 1)?.clone();
        let slot = ag.slot(av.slot_idxs[0]);

        let spofs: Vec<u32> = slot.chunks.iter()
            .map(|c| storage.rdevs[c.rdev_idx].spof_id)
            .collect();
        assert_eq!(spofs, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn reservation_without_enough_spofs_is_enospc() {
        let mut storage = make_storage(2, 1, 8, VRT_MIN_CHUNK_SIZE);
        let mut ag = AssemblyGroup::setup(3, chunk_size_sectors());

        assert_eq!(ag.reserve_volume(&mut storage, ExaUuid::new(0, 0, 0, 1), 1)
                     .map(|_| ()),
                   Err(VrtError::NoSpace));
    }

    #[test]
    fn failed_reservation_rolls_back_chunks() {
        let mut storage = make_storage(2, 1, 2, VRT_MIN_CHUNK_SIZE);
        let mut ag = AssemblyGroup::setup(2, chunk_size_sectors());

        let free_before: u64 = storage.spof_groups.iter()
            .map(|sg| storage.spof_group_free_chunk_count(sg))
            .sum();

        // 3 slots of width 2 need 3 chunks per spof, only 2 available
        assert_eq!(ag.reserve_volume(&mut storage, ExaUuid::new(0, 0, 0, 1), 3)
                     .map(|_| ()),
                   Err(VrtError::NoSpace));

        let free_after: u64 = storage.spof_groups.iter()
            .map(|sg| storage.spof_group_free_chunk_count(sg))
            .sum();
        assert_eq!(free_before, free_after);
        assert_eq!(ag.num_slots(), 0);
    }

    #[test]
    fn release_volume_returns_chunks_and_keeps_other_indexes() -> VrtResult<()> {
        let mut storage = make_storage(2, 1, 8, VRT_MIN_CHUNK_SIZE);
        let mut ag = AssemblyGroup::setup(2, chunk_size_sectors());

        let uuid1 = ExaUuid::new(0, 0, 0, 1);
        let uuid2 = ExaUuid::new(0, 0, 0, 2);
        ag.reserve_volume(&mut storage, uuid1, 2)?;
        let v2_slots = ag.reserve_volume(&mut storage, uuid2, 2)?.slot_idxs.clone();

        ag.release_volume(&mut storage, &uuid1)?;
        assert_eq!(ag.num_slots(), 2);
        assert!(ag.get_volume(&uuid1).is_none());

        // Volume 2 still resolves its slots
        for idx in v2_slots {
            assert_eq!(ag.slot(idx).width(), 2);
        }

        // Freed pool entries are reused
        ag.reserve_volume(&mut storage, ExaUuid::new(0, 0, 0, 3), 2)?;
        assert_eq!(ag.slots.len(), 4);
        Ok(())
    }

    #[test]
    fn map_resolves_slot_and_offset() -> VrtResult<()> {
        let mut storage = make_storage(2, 1, 8, VRT_MIN_CHUNK_SIZE);
        let mut ag = AssemblyGroup::setup(2, chunk_size_sectors());
        let av = ag.reserve_volume(&mut storage, ExaUuid::new(0, 0, 0, 1), 2)?.clone();

        let logical_slot_size = 1000;
        let (slot_idx, offset) = AssemblyGroup::map(&av, 1234, logical_slot_size)?;
        assert_eq!(slot_idx, av.slot_idxs[1]);
        assert_eq!(offset, 234);

        assert!(AssemblyGroup::map(&av, 2000, logical_slot_size).is_err());
        Ok(())
    }

    #[test]
    fn slot_map_sector_to_rdev_adds_chunk_offset() -> VrtResult<()> {
        let mut storage = make_storage(2, 1, 8, VRT_MIN_CHUNK_SIZE);
        let mut ag = AssemblyGroup::setup(2, chunk_size_sectors());
        let av = ag.reserve_volume(&mut storage, ExaUuid::new(0, 0, 0, 1), 1)?.clone();

        let slot = ag.slot(av.slot_idxs[0]);
        let (rdev_idx, rsector) = slot.map_sector_to_rdev(1, 17);
        assert_eq!(rdev_idx, slot.chunks[1].rdev_idx);
        assert_eq!(rsector, slot.chunks[1].offset + 17);
        Ok(())
    }

    #[test]
    fn serialize_deserialize_roundtrip() -> VrtResult<()> {
        let mut storage = make_storage(3, 1, 8, VRT_MIN_CHUNK_SIZE);
        let mut ag = AssemblyGroup::setup(3, chunk_size_sectors());
        ag.reserve_volume(&mut storage, ExaUuid::new(0, 0, 0, 1), 2)?;
        ag.reserve_volume(&mut storage, ExaUuid::new(0, 0, 0, 2), 3)?;

        let mut buf = vec![0u8; ag.serialized_size() as usize];
        {
            let mut stream = MemoryStream::new(&mut buf, StreamAccess::Write);
            ag.serialize(&storage, &mut stream)?;
        }

        // A sibling storage with the same rdevs, freshly cut
        let mut sibling = make_storage(3, 1, 8, VRT_MIN_CHUNK_SIZE);
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Read);
        let copy = AssemblyGroup::deserialize(&mut sibling, &mut stream)?;

        assert!(ag.equals(&copy, &storage, &sibling));

        // Deserialization must have claimed the same chunks
        for (sg, other_sg) in storage.spof_groups.iter().zip(sibling.spof_groups.iter()) {
            assert_eq!(storage.spof_group_free_chunk_count(sg),
                       sibling.spof_group_free_chunk_count(other_sg));
        }
        Ok(())
    }

    #[test]
    fn serialize_skips_freed_slots() -> VrtResult<()> {
        let mut storage = make_storage(2, 1, 8, VRT_MIN_CHUNK_SIZE);
        let mut ag = AssemblyGroup::setup(2, chunk_size_sectors());
        let uuid1 = ExaUuid::new(0, 0, 0, 1);
        ag.reserve_volume(&mut storage, uuid1, 2)?;
        ag.reserve_volume(&mut storage, ExaUuid::new(0, 0, 0, 2), 1)?;
        ag.release_volume(&mut storage, &uuid1)?;

        let mut buf = vec![0u8; ag.serialized_size() as usize];
        {
            let mut stream = MemoryStream::new(&mut buf, StreamAccess::Write);
            ag.serialize(&storage, &mut stream)?;
        }

        let mut sibling = make_storage(2, 1, 8, VRT_MIN_CHUNK_SIZE);
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Read);
        let copy = AssemblyGroup::deserialize(&mut sibling, &mut stream)?;

        assert_eq!(copy.num_slots(), 1);
        assert!(ag.equals(&copy, &storage, &sibling));
        Ok(())
    }

    #[test]
    fn deserialize_unknown_rdev_is_corruption() -> VrtResult<()> {
        let mut storage = make_storage(2, 1, 8, VRT_MIN_CHUNK_SIZE);
        let mut ag = AssemblyGroup::setup(2, chunk_size_sectors());
        ag.reserve_volume(&mut storage, ExaUuid::new(0, 0, 0, 1), 1)?;

        let mut buf = vec![0u8; ag.serialized_size() as usize];
        {
            let mut stream = MemoryStream::new(&mut buf, StreamAccess::Write);
            ag.serialize(&storage, &mut stream)?;
        }

        // A storage with different rdev uuids cannot resolve the chunks
        let mut other = Storage::new();
        {
            use crate::vrt_lib::desc::VRT_SB_AREA_SIZE;
            use crate::vrt_lib::rdev::VrtRealdev;
            for n in 0..2u32 {
                other.add_rdev(VrtRealdev::new(
                    ExaUuid::new(0xBEEF, n, 0, 0), ExaUuid::new(0xBEEF, n, 0, 1),
                    0, n + 1, VRT_SB_AREA_SIZE + 8 * chunk_size_sectors()).unwrap())
                    .unwrap();
            }
            other.cut_in_chunks(VRT_MIN_CHUNK_SIZE).unwrap();
        }

        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Read);
        assert_eq!(AssemblyGroup::deserialize(&mut other, &mut stream).map(|_| ()),
                   Err(VrtError::SbCorruption));
        Ok(())
    }
}
