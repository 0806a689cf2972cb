use crate::vrt_lib::uuid::ExaUuid;
use std::fmt;

/// How a started volume is exposed to initiators
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ExportMethod {
    #[default]
    Bdev,
    Iscsi,
}

impl ExportMethod {
    pub fn to_wire(self) -> u32 {
        match self {
            ExportMethod::Bdev => 0,
            ExportMethod::Iscsi => 1,
        }
    }

    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(ExportMethod::Bdev),
            1 => Some(ExportMethod::Iscsi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStatus {
    Stopped,
    Started,
}

/// A logical volume inside a group. The volume's uuid doubles as the uuid
/// of its assembly volume; its size is immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrtVolume {
    pub uuid: ExaUuid,
    pub name: String,
    /// Size in sectors
    pub size: u64,
    pub status: VolumeStatus,
    pub export_method: ExportMethod,
}

impl VrtVolume {
    pub fn new(uuid: ExaUuid, name: &str, size: u64) -> Self {
        Self {
            uuid,
            name: name.to_string(),
            size,
            status: VolumeStatus::Stopped,
            export_method: ExportMethod::default(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.status == VolumeStatus::Started
    }
}

impl fmt::Display for VrtVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "volume '{}' ({}): {} sectors, {}", self.name, self.uuid, self.size,
               match self.status {
                   VolumeStatus::Started => "started",
                   VolumeStatus::Stopped => "stopped",
               })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_volume_is_stopped() {
        let vol = VrtVolume::new(ExaUuid::new(0, 0, 0, 1), "data", 1024);
        assert!(!vol.is_started());
        assert_eq!(vol.export_method, ExportMethod::Bdev);
    }

    #[test]
    fn export_method_wire_roundtrip() {
        for method in [ExportMethod::Bdev, ExportMethod::Iscsi] {
            assert_eq!(ExportMethod::from_wire(method.to_wire()), Some(method));
        }
        assert_eq!(ExportMethod::from_wire(7), None);
    }
}
