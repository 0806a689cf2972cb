use crate::vrt_lib::assembly::AssemblyGroup;
use crate::vrt_lib::error::{VrtError, VrtResult};
use crate::vrt_lib::layout::{IoSubRequest, RwMode};
use crate::vrt_lib::storage::Storage;
use crate::vrt_lib::stream::{Stream, StreamExt};
use crate::vrt_lib::uuid::ExaUuid;

pub const SSTRIPING_HEADER_MAGIC: u32 = 0xB1B2B3B4;
pub const SSTRIPING_HEADER_FORMAT: u32 = 1;

/// Straight striping: slots are concatenated, no redundancy. The slot
/// width is the number of SPOF groups so that the whole storage is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstripingGroup {
    /// Stripe unit, in sectors
    pub su_size: u32,
    /// Logical sectors per slot: every chunk contributes its full size
    pub logical_slot_size: u64,
}

impl SstripingGroup {
    /// Create the layout data and the assembly group it drives
    pub fn create(storage: &Storage, chunk_size_sectors: u64,
                  su_size: u32) -> VrtResult<(Self, AssemblyGroup)> {
        let slot_width = storage.spof_groups.len() as u32;

        if slot_width == 0 || su_size == 0 {
            return Err(VrtError::InvalidArg);
        }

        // The striping pattern must tile the slot exactly
        if chunk_size_sectors % su_size as u64 != 0 {
            return Err(VrtError::InvalidArg);
        }

        let ssg = Self {
            su_size,
            logical_slot_size: chunk_size_sectors * slot_width as u64,
        };
        let ag = AssemblyGroup::setup(slot_width, chunk_size_sectors);

        Ok((ssg, ag))
    }

    pub fn io_map(&self, _storage: &Storage, ag: &AssemblyGroup, volume_uuid: &ExaUuid,
                  _rw: RwMode, sector: u64, nb_sectors: u64) -> VrtResult<Vec<IoSubRequest>> {
        let av = ag.get_volume(volume_uuid).ok_or(VrtError::NotFound)?;
        let su = self.su_size as u64;

        let mut reqs = vec![];
        let mut s = sector;
        let mut remaining = nb_sectors;

        while remaining > 0 {
            let (slot_idx, offset) = AssemblyGroup::map(av, s, self.logical_slot_size)?;
            let slot = ag.slot(slot_idx);
            let width = slot.width() as u64;

            let column = (offset / su) % width;
            let sector_in_chunk = (offset / (su * width)) * su + offset % su;

            // Stay within the current stripe unit
            let run = remaining.min(su - offset % su);

            let (rdev_idx, rsector) = slot.map_sector_to_rdev(column as u32, sector_in_chunk);
            reqs.push(IoSubRequest { rdev_idx, rsector, nb_sectors: run,
                                     buf_offset: s - sector });

            s += run;
            remaining -= run;
        }

        Ok(reqs)
    }

    pub fn serialized_size(&self, ag: &AssemblyGroup) -> u64 {
        20 + ag.serialized_size()
    }

    pub fn serialize(&self, storage: &Storage, ag: &AssemblyGroup,
                     stream: &mut dyn Stream) -> VrtResult<()> {
        stream.write_u32_le(SSTRIPING_HEADER_MAGIC)?;
        stream.write_u32_le(SSTRIPING_HEADER_FORMAT)?;
        stream.write_u32_le(self.su_size)?;
        stream.write_u64_le(self.logical_slot_size)?;
        ag.serialize(storage, stream)
    }

    pub fn deserialize(storage: &mut Storage,
                       stream: &mut dyn Stream) -> VrtResult<(Self, AssemblyGroup)> {
        let magic = stream.read_u32_le()?;
        if magic != SSTRIPING_HEADER_MAGIC {
            return Err(VrtError::SbMagic);
        }

        let format = stream.read_u32_le()?;
        if format != SSTRIPING_HEADER_FORMAT {
            return Err(VrtError::SbFormat);
        }

        let su_size = stream.read_u32_le()?;
        let logical_slot_size = stream.read_u64_le()?;

        let ag = AssemblyGroup::deserialize(storage, stream)?;

        Ok((Self { su_size, logical_slot_size }, ag))
    }
}
