use crate::vrt_lib::desc::{sectors_to_bytes, RDEV_RESERVED_AREA_IN_SECTORS, SECTOR_SIZE};
use crate::vrt_lib::error::{VrtError, VrtResult};
use crate::vrt_lib::uuid::ExaUuid;

/// Size of the identity block at LBA 0 of every disk given to the cluster
pub const RDEV_SUPERBLOCK_SIZE: usize = 4096;

pub const EXA_RDEV_SB_MAGIC: &[u8; 16] = b"EXANODES DISK\0\0\0";

const _: () = assert!(RDEV_SUPERBLOCK_SIZE % SECTOR_SIZE as usize == 0);
const _: () = assert!(RDEV_SUPERBLOCK_SIZE as u64
                      <= sectors_to_bytes(RDEV_RESERVED_AREA_IN_SECTORS));

/// The disk identity block: a magic string and the uuid under which the
/// cluster knows the disk. Everything else in the block is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdevSuperblock {
    pub uuid: ExaUuid,
}

impl RdevSuperblock {
    pub fn new(uuid: ExaUuid) -> Self {
        Self { uuid }
    }

    pub fn pack(&self) -> [u8; RDEV_SUPERBLOCK_SIZE] {
        let mut block = [0u8; RDEV_SUPERBLOCK_SIZE];
        block[0..16].copy_from_slice(EXA_RDEV_SB_MAGIC);
        block[16..32].copy_from_slice(&self.uuid.to_bytes());
        block
    }

    /// Parse an identity block. A block without the magic means the disk
    /// was never given to the cluster.
    pub fn unpack(block: &[u8]) -> VrtResult<Self> {
        if block.len() < RDEV_SUPERBLOCK_SIZE {
            return Err(VrtError::InvalidArg);
        }
        if &block[0..16] != EXA_RDEV_SB_MAGIC {
            return Err(VrtError::SbMagic);
        }

        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&block[16..32]);
        Ok(Self { uuid: ExaUuid::from_bytes(&uuid_bytes) })
    }

    /// Wipe an identity block in place
    pub fn wipe(block: &mut [u8]) {
        block[..RDEV_SUPERBLOCK_SIZE].fill(0);
    }
}
