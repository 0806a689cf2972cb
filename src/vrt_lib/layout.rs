use crate::vrt_lib::assembly::AssemblyGroup;
use crate::vrt_lib::error::{VrtError, VrtResult};
use crate::vrt_lib::rain1::Rain1Group;
use crate::vrt_lib::sstriping::SstripingGroup;
use crate::vrt_lib::storage::Storage;
use crate::vrt_lib::stream::Stream;

/// The closed set of redundancy schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    Sstriping,
    Rain1,
}

impl LayoutKind {
    pub fn name(self) -> &'static str {
        match self {
            LayoutKind::Sstriping => "sstriping",
            LayoutKind::Rain1 => "rain1",
        }
    }

    pub fn from_name(name: &str) -> VrtResult<Self> {
        match name {
            "sstriping" => Ok(LayoutKind::Sstriping),
            "rain1" => Ok(LayoutKind::Rain1),
            _ => Err(VrtError::NotFound),
        }
    }
}

/// Read or write, from the point of view of the block request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwMode {
    Read,
    Write,
}

/// One device-level piece of a mapped block request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoSubRequest {
    pub rdev_idx: usize,
    pub rsector: u64,
    pub nb_sectors: u64,
    /// Position of this piece within the original request, in sectors.
    /// Mirror halves of one piece share the same position.
    pub buf_offset: u64,
}

/// A layout instance attached to one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutInstance {
    Sstriping(SstripingGroup),
    Rain1(Rain1Group),
}

impl LayoutInstance {
    pub fn kind(&self) -> LayoutKind {
        match self {
            LayoutInstance::Sstriping(_) => LayoutKind::Sstriping,
            LayoutInstance::Rain1(_) => LayoutKind::Rain1,
        }
    }

    /// Logical sectors represented by one slot
    pub fn logical_slot_size(&self) -> u64 {
        match self {
            LayoutInstance::Sstriping(ssg) => ssg.logical_slot_size,
            LayoutInstance::Rain1(rxg) => rxg.logical_slot_size,
        }
    }

    /// Translate a volume block request into device sub-requests
    pub fn io_map(&self, storage: &Storage, ag: &AssemblyGroup,
                  volume_uuid: &crate::vrt_lib::uuid::ExaUuid, rw: RwMode,
                  sector: u64, nb_sectors: u64) -> VrtResult<Vec<IoSubRequest>> {
        match self {
            LayoutInstance::Sstriping(ssg) => {
                ssg.io_map(storage, ag, volume_uuid, rw, sector, nb_sectors)
            }
            LayoutInstance::Rain1(rxg) => {
                rxg.io_map(storage, ag, volume_uuid, rw, sector, nb_sectors)
            }
        }
    }

    /// Serialize the layout data followed by the assembly group
    pub fn serialize(&self, storage: &Storage, ag: &AssemblyGroup,
                     stream: &mut dyn Stream) -> VrtResult<()> {
        match self {
            LayoutInstance::Sstriping(ssg) => ssg.serialize(storage, ag, stream),
            LayoutInstance::Rain1(rxg) => rxg.serialize(storage, ag, stream),
        }
    }

    pub fn serialized_size(&self, storage: &Storage, ag: &AssemblyGroup) -> u64 {
        match self {
            LayoutInstance::Sstriping(ssg) => ssg.serialized_size(ag),
            LayoutInstance::Rain1(rxg) => rxg.serialized_size(storage, ag),
        }
    }

    pub fn deserialize(kind: LayoutKind, storage: &mut Storage,
                       stream: &mut dyn Stream) -> VrtResult<(Self, AssemblyGroup)> {
        match kind {
            LayoutKind::Sstriping => {
                let (ssg, ag) = SstripingGroup::deserialize(storage, stream)?;
                Ok((LayoutInstance::Sstriping(ssg), ag))
            }
            LayoutKind::Rain1 => {
                let (rxg, ag) = Rain1Group::deserialize(storage, stream)?;
                Ok((LayoutInstance::Rain1(rxg), ag))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_names_roundtrip() {
        for kind in [LayoutKind::Sstriping, LayoutKind::Rain1] {
            assert_eq!(LayoutKind::from_name(kind.name()).unwrap(), kind);
        }
        assert_eq!(LayoutKind::from_name("raid6"), Err(VrtError::NotFound));
    }
}
