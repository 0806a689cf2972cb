use crate::vrt_lib::desc::EXA_MAX_NODES_NUMBER;
use std::fmt;

/// Set of node ids, one bit per possible node in the cluster
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExaNodeset {
    words: [u64; EXA_MAX_NODES_NUMBER / 64],
}

pub const EXA_NODESET_EMPTY: ExaNodeset = ExaNodeset { words: [0; EXA_MAX_NODES_NUMBER / 64] };

impl ExaNodeset {
    pub fn new() -> Self {
        EXA_NODESET_EMPTY
    }

    pub fn reset(&mut self) {
        *self = EXA_NODESET_EMPTY;
    }

    pub fn add(&mut self, node_id: u32) {
        assert!((node_id as usize) < EXA_MAX_NODES_NUMBER);
        self.words[node_id as usize / 64] |= 1 << (node_id % 64);
    }

    pub fn del(&mut self, node_id: u32) {
        assert!((node_id as usize) < EXA_MAX_NODES_NUMBER);
        self.words[node_id as usize / 64] &= !(1 << (node_id % 64));
    }

    pub fn contains(&self, node_id: u32) -> bool {
        if node_id as usize >= EXA_MAX_NODES_NUMBER {
            return false;
        }
        self.words[node_id as usize / 64] & (1 << (node_id % 64)) != 0
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn union(&mut self, other: &ExaNodeset) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= o;
        }
    }

    pub fn substract(&mut self, other: &ExaNodeset) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w &= !o;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..EXA_MAX_NODES_NUMBER as u32).filter(move |id| self.contains(*id))
    }

    /// Serialized form: two little-endian u64 words, low ids first
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        for (i, w) in self.words.iter().enumerate() {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        let mut words = [0u64; EXA_MAX_NODES_NUMBER / 64];
        for (i, w) in words.iter_mut().enumerate() {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *w = u64::from_le_bytes(b);
        }
        Self { words }
    }
}

impl fmt::Display for ExaNodeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for id in self.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}", id)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_del_contains() {
        let mut set = ExaNodeset::new();
        assert!(set.is_empty());
        set.add(0);
        set.add(63);
        set.add(64);
        set.add(127);
        assert_eq!(set.count(), 4);
        assert!(set.contains(63) && set.contains(64));
        set.del(63);
        assert!(!set.contains(63));
        assert_eq!(set.count(), 3);
    }

    #[test]
    fn union_and_substract() {
        let mut a = ExaNodeset::new();
        a.add(1);
        a.add(2);
        let mut b = ExaNodeset::new();
        b.add(2);
        b.add(3);
        a.union(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        a.substract(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn bytes_roundtrip() {
        let mut set = ExaNodeset::new();
        set.add(5);
        set.add(100);
        assert_eq!(ExaNodeset::from_bytes(&set.to_bytes()), set);
    }
}
