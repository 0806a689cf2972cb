use crate::vrt_lib::error::{VrtError, VrtResult};
use rand::Rng;
use std::fmt;
use std::str::FromStr;

pub const UUID_LEN: usize = 4;
/// 4 elements of 8 hex digits + 3 separators
pub const UUID_STR_LEN: usize = 8 * 4 + 3;

/// Universal unique identifier (for devices, groups, volumes, ...)
///
/// Printed as four 32-bit big-endian segments in upper-case hex, separated
/// by ':', e.g. `1A23CED1:2BC123AE:00000000:0000002A`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExaUuid {
    pub id: [u32; UUID_LEN],
}

/// The zero UUID, reserved for 'none'
pub const EXA_UUID_ZERO: ExaUuid = ExaUuid { id: [0; UUID_LEN] };

impl ExaUuid {
    pub fn new(a: u32, b: u32, c: u32, d: u32) -> Self {
        Self { id: [a, b, c, d] }
    }

    pub fn is_zero(&self) -> bool {
        *self == EXA_UUID_ZERO
    }

    pub fn zero(&mut self) {
        *self = EXA_UUID_ZERO;
    }

    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self { id: [rng.gen(), rng.gen(), rng.gen(), rng.gen()] }
    }

    /// Serialized form: 16 bytes, each segment big-endian so that the byte
    /// order matches the printed form
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        for (i, seg) in self.id.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&seg.to_be_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        let mut id = [0u32; UUID_LEN];
        for (i, seg) in id.iter_mut().enumerate() {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            *seg = u32::from_be_bytes(b);
        }
        Self { id }
    }
}

impl fmt::Display for ExaUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}:{:08X}:{:08X}:{:08X}",
               self.id[0], self.id[1], self.id[2], self.id[3])
    }
}

impl FromStr for ExaUuid {
    type Err = VrtError;

    fn from_str(s: &str) -> VrtResult<Self> {
        if s.len() != UUID_STR_LEN {
            return Err(VrtError::InvalidArg);
        }
        let mut id = [0u32; UUID_LEN];
        for (i, part) in s.split(':').enumerate() {
            if i >= UUID_LEN || part.len() != 8 {
                return Err(VrtError::InvalidArg);
            }
            id[i] = u32::from_str_radix(part, 16).map_err(|_| VrtError::InvalidArg)?;
        }
        Ok(Self { id })
    }
}
