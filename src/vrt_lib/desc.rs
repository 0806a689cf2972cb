/*
 * Cluster-wide limits and on-disk layout constants. Values are part of the
 * on-disk and on-wire formats and must not change between releases.
 */

/// Size of a disk sector in bytes
pub const SECTOR_SIZE: u64 = 512;

pub const fn sectors_to_bytes(nb_sectors: u64) -> u64 { nb_sectors * SECTOR_SIZE }
pub const fn bytes_to_sectors(nb_bytes: u64) -> u64 { nb_bytes / SECTOR_SIZE }
pub const fn kbytes_to_sectors(nb_kbytes: u64) -> u64 { nb_kbytes * 2 }
pub const fn sectors_to_kbytes(nb_sectors: u64) -> u64 { nb_sectors / 2 }

/*
 * Cluster limits
 */
pub const EXA_MAX_NODES_NUMBER: usize = 128;

/** Special node id for 'no node' */
pub const EXA_NODEID_NONE: u32 = u32::MAX;

/*
 * Disk limits
 */
pub const NBMAX_DISKS: usize = 512;
pub const NBMAX_DISKS_PER_GROUP: usize = NBMAX_DISKS;
pub const NBMAX_DISKS_PER_NODE: usize = 64;
pub const NBMAX_DISKS_PER_SPOF_GROUP: usize = NBMAX_DISKS_PER_NODE;

/// Area reserved at the beginning of each disk for the identity block
pub const RDEV_RESERVED_AREA_IN_SECTORS: u64 = bytes_to_sectors(4096);

/*
 * Group limits
 */
pub const NBMAX_VOLUMES_PER_GROUP: usize = 256;
pub const NBMAX_SPARES_PER_GROUP: u32 = 16;

/** Default chunk size in KiB (256 MiB) */
pub const VRT_DEFAULT_CHUNK_SIZE: u32 = 262144;
/** Min chunk size in KiB (32 MiB) */
pub const VRT_MIN_CHUNK_SIZE: u32 = 32768;
pub const VRT_NBMAX_CHUNKS_PER_GROUP: u64 = 500000;

/** Min dirty zone size in KiB (1 MiB) */
pub const VRT_MIN_DIRTY_ZONE_SIZE: u32 = 1 << 10;

/// Sectors reserved per rdev for the two superblock slots; chunk 0 starts
/// right after this area
pub const VRT_SB_AREA_SIZE: u64 = 2 * VRT_SB_SLOT_SIZE + RDEV_RESERVED_AREA_IN_SECTORS;

/// Sectors of one superblock slot (header + payload)
pub const VRT_SB_SLOT_SIZE: u64 = kbytes_to_sectors(512);

/*
 * Defaults for the request engine
 */
pub const VRT_DEFAULT_MAX_REQUESTS: usize = 64;

/*
 * Token manager
 */
pub const TOKEN_MANAGER_DEFAULT_PORT: u16 = 30798;
