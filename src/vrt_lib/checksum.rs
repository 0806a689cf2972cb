//! 16-bit ones' complement checksum (RFC 1071 style) used for all on-disk
//! metadata. The checksum may be embedded in the checksummed buffer itself:
//! set the field to 0 when computing, and a verification pass over the whole
//! buffer (checksum included) yields 0.

pub type Checksum = u16;

/// Checksumming context for incremental computation
#[derive(Debug, Clone)]
pub struct ChecksumContext {
    total_size: usize,
    latched_byte: u8,
    latched: bool,
    sum: u32,
}

impl Default for ChecksumContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumContext {
    pub fn new() -> Self {
        Self { total_size: 0, latched_byte: 0, latched: false, sum: 0 }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed a buffer to the computation. Bytes are paired into 16-bit
    /// little-endian words; a trailing odd byte is latched until the next
    /// feed or the end of the computation.
    pub fn feed(&mut self, buffer: &[u8]) {
        let mut bytes = buffer;

        if bytes.is_empty() {
            return;
        }

        self.total_size += bytes.len();

        if self.latched {
            self.sum += u16::from_le_bytes([self.latched_byte, bytes[0]]) as u32;
            self.latched = false;
            bytes = &bytes[1..];
        }

        let mut chunks = bytes.chunks_exact(2);
        for pair in &mut chunks {
            self.sum += u16::from_le_bytes([pair[0], pair[1]]) as u32;
        }

        if let [last] = chunks.remainder() {
            self.latched_byte = *last;
            self.latched = true;
        }
    }

    pub fn value(&self) -> Checksum {
        let mut sum = self.sum;
        if self.latched {
            sum += u16::from_le_bytes([self.latched_byte, 0]) as u32;
        }
        // Fold the carries back in, then complement
        while sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }

    pub fn size(&self) -> usize {
        self.total_size
    }
}

/// One-shot checksum of a buffer
pub fn exa_checksum(buffer: &[u8]) -> Checksum {
    let mut ctx = ChecksumContext::new();
    ctx.feed(buffer);
    ctx.value()
}
