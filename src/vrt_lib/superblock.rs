use crate::vrt_lib::checksum::Checksum;
use crate::vrt_lib::desc::{sectors_to_bytes, RDEV_RESERVED_AREA_IN_SECTORS, VRT_SB_AREA_SIZE,
                           VRT_SB_SLOT_SIZE};
use crate::vrt_lib::error::{VrtError, VrtResult};
use crate::vrt_lib::stream::{ChecksumStream, MemoryStream, NarrowedStream, Stream,
                             StreamAccess, StreamExt};
use log::*;

pub const SUPERBLOCK_HEADER_MAGIC: u32 = 0x99033055;
pub const SUPERBLOCK_HEADER_FORMAT: u32 = 1;

/// Encoded size of a superblock header, in bytes
pub const SUPERBLOCK_HEADER_SIZE: u64 = 56;

/// First sector of the superblock area on an rdev (right after the identity
/// block)
pub const SB_AREA_FIRST_SECTOR: u64 = RDEV_RESERVED_AREA_IN_SECTORS;

/// Size of the whole superblock area, in bytes (two slots)
pub const SB_AREA_BYTES: u64 = sectors_to_bytes(VRT_SB_AREA_SIZE - RDEV_RESERVED_AREA_IN_SECTORS);

const _: () = assert!(VRT_SB_AREA_SIZE - RDEV_RESERVED_AREA_IN_SECTORS == 2 * VRT_SB_SLOT_SIZE);

/// On-disk header of one superblock slot. Both headers sit back to back at
/// the beginning of the superblock area; `data_offset` is relative to that
/// same beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperblockHeader {
    /* Fields 'magic' and 'format' must always be 1st and 2nd */
    pub magic: u32,
    pub format: u32,
    pub position: u32,
    /// For future use. Must be zero
    pub reserved1: u32,
    pub sb_version: u64,
    pub data_max_size: u64,
    pub data_offset: u64,
    /// Data size, in bytes
    pub data_size: u64,
    /// Checksum of the data stored in the superblock
    pub checksum: Checksum,
    pub reserved2: [u8; 6],
}

impl SuperblockHeader {
    /// Fresh header for slot `position` of an area of `area_size` bytes
    fn initial(position: u32, area_size: u64) -> Self {
        let data_max_size = (area_size - 2 * SUPERBLOCK_HEADER_SIZE) / 2;
        Self {
            magic: SUPERBLOCK_HEADER_MAGIC,
            format: SUPERBLOCK_HEADER_FORMAT,
            position,
            reserved1: 0,
            sb_version: 0,
            data_max_size,
            data_offset: 2 * SUPERBLOCK_HEADER_SIZE + position as u64 * data_max_size,
            data_size: 0,
            checksum: 0,
            reserved2: [0; 6],
        }
    }

    pub fn write(&self, stream: &mut dyn Stream) -> VrtResult<()> {
        stream.write_u32_le(self.magic)?;
        stream.write_u32_le(self.format)?;
        stream.write_u32_le(self.position)?;
        stream.write_u32_le(self.reserved1)?;
        stream.write_u64_le(self.sb_version)?;
        stream.write_u64_le(self.data_max_size)?;
        stream.write_u64_le(self.data_offset)?;
        stream.write_u64_le(self.data_size)?;
        stream.write_u16_le(self.checksum)?;
        stream.write_all(&self.reserved2)?;
        Ok(())
    }

    pub fn read(stream: &mut dyn Stream) -> VrtResult<Self> {
        let magic = stream.read_u32_le()?;
        let format = stream.read_u32_le()?;
        let position = stream.read_u32_le()?;
        let reserved1 = stream.read_u32_le()?;
        let sb_version = stream.read_u64_le()?;
        let data_max_size = stream.read_u64_le()?;
        let data_offset = stream.read_u64_le()?;
        let data_size = stream.read_u64_le()?;
        let checksum = stream.read_u16_le()?;
        let mut reserved2 = [0u8; 6];
        stream.read_exact(&mut reserved2)?;

        Ok(Self { magic, format, position, reserved1, sb_version, data_max_size,
                  data_offset, data_size, checksum, reserved2 })
    }

    /// Read the two headers of a superblock area
    pub fn read_both(stream: &mut dyn Stream) -> VrtResult<[Self; 2]> {
        let h0 = Self::read(stream)?;
        let h1 = Self::read(stream)?;
        Ok([h0, h1])
    }

    /// Structural validation of one header against its area
    fn check(&self, area_size: u64) -> VrtResult<()> {
        if self.magic != SUPERBLOCK_HEADER_MAGIC {
            return Err(VrtError::SbMagic);
        }
        if self.format != SUPERBLOCK_HEADER_FORMAT {
            return Err(VrtError::SbFormat);
        }
        if self.data_size > self.data_max_size
            || self.data_offset + self.data_max_size > area_size
        {
            return Err(VrtError::SbCorruption);
        }
        Ok(())
    }
}

fn read_headers(area: &mut [u8]) -> VrtResult<[SuperblockHeader; 2]> {
    let mut stream = MemoryStream::new(area, StreamAccess::Read);
    SuperblockHeader::read_both(&mut stream)
}

fn write_header(area: &mut [u8], header: &SuperblockHeader) -> VrtResult<()> {
    let mut stream = MemoryStream::new(area, StreamAccess::Write);
    stream.seek((header.position as u64 * SUPERBLOCK_HEADER_SIZE) as i64,
                crate::vrt_lib::stream::StreamSeek::FromBeginning)?;
    header.write(&mut stream)
}

/// Initialize a superblock area: two empty slots at version 0
pub fn superblock_format(area: &mut [u8]) -> VrtResult<()> {
    if (area.len() as u64) < 2 * SUPERBLOCK_HEADER_SIZE + 2 {
        return Err(VrtError::InvalidArg);
    }
    area.fill(0);
    for position in 0..2 {
        let mut header = SuperblockHeader::initial(position, area.len() as u64);
        header.checksum = crate::vrt_lib::checksum::exa_checksum(&[]);
        write_header(area, &header)?;
    }
    Ok(())
}

/// Write a new version of the superblock payload.
///
/// The slot holding the *older* version is overwritten so that a crash at
/// any point leaves the current version intact; the header is committed
/// only once the payload is fully written and checksummed. `old_version`
/// is what the caller believes is current and is cross-checked against the
/// on-disk headers.
pub fn superblock_write<F>(area: &mut [u8], old_version: u64, new_version: u64,
                           write_payload: F) -> VrtResult<()>
where
    F: FnOnce(&mut dyn Stream) -> VrtResult<()>,
{
    if new_version <= old_version {
        return Err(VrtError::InvalidArg);
    }

    let headers = read_headers(area)?;
    for header in &headers {
        header.check(area.len() as u64)?;
    }

    let current = headers.iter().map(|h| h.sb_version).max().unwrap();
    if current != old_version {
        warn!("superblock version mismatch: on disk {}, expected {}", current, old_version);
        return Err(VrtError::SbCorruption);
    }

    // Overwrite the slot with the older version
    let target = if headers[0].sb_version <= headers[1].sb_version { 0 } else { 1 };
    let mut header = headers[target];

    let (data_size, checksum) = {
        let mut base = MemoryStream::new(area, StreamAccess::ReadWrite);
        let mut narrowed = NarrowedStream::new(&mut base, header.data_offset,
                                               header.data_offset + header.data_max_size - 1,
                                               StreamAccess::Write)?;
        let mut cs = ChecksumStream::new(&mut narrowed);
        write_payload(&mut cs)?;
        cs.flush()?;
        (cs.size() as u64, cs.value())
    };

    header.sb_version = new_version;
    header.data_size = data_size;
    header.checksum = checksum;
    write_header(area, &header)
}

/// Read the authoritative superblock payload from an area.
///
/// The slot with the highest version whose checksum matches over exactly
/// `data_size` bytes wins; a corrupted slot makes the reader fall through
/// to the other one.
pub fn superblock_read(area: &mut [u8]) -> VrtResult<(u64, Vec<u8>)> {
    let headers = read_headers(area)?;

    let mut best: Option<(u64, Vec<u8>)> = None;
    let mut last_err = VrtError::SbCorruption;

    for header in &headers {
        match read_slot(area, header) {
            Ok((version, payload)) => {
                if best.as_ref().map_or(true, |(v, _)| version > *v) {
                    best = Some((version, payload));
                }
            }
            Err(err) => {
                debug!("superblock slot {} rejected: {}", header.position, err);
                last_err = err;
            }
        }
    }

    best.ok_or(last_err)
}

fn read_slot(area: &mut [u8], header: &SuperblockHeader) -> VrtResult<(u64, Vec<u8>)> {
    header.check(area.len() as u64)?;

    let mut payload = vec![0u8; header.data_size as usize];
    {
        let mut base = MemoryStream::new(area, StreamAccess::Read);
        let mut narrowed = NarrowedStream::new(&mut base, header.data_offset,
                                               header.data_offset + header.data_max_size - 1,
                                               StreamAccess::Read)?;
        let mut cs = ChecksumStream::new(&mut narrowed);
        cs.read_exact(&mut payload)?;

        if cs.value() != header.checksum {
            return Err(VrtError::SbCorruption);
        }
    }

    Ok((header.sb_version, payload))
}
