use crate::vrt_lib::error::{VrtError, VrtResult};
use crate::vrt_lib::stream::{Stream, StreamExt};

/// An inclusive run `[start, end]` of 64-bit values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
}

/// Ordered set of 64-bit integers kept as ascending, disjoint, non-adjacent
/// inclusive runs. Used for per-rdev free-chunk bookkeeping.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtentList {
    extents: Vec<Extent>,
}

impl ExtentList {
    pub fn new() -> Self {
        Self { extents: vec![] }
    }

    /// Number of runs
    pub fn count(&self) -> u32 {
        self.extents.len() as u32
    }

    /// Number of values contained in all runs
    pub fn num_values(&self) -> u64 {
        self.extents.iter().map(|e| e.end - e.start + 1).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn contains(&self, value: u64) -> bool {
        self.extents.iter().any(|e| value >= e.start && value <= e.end)
    }

    /// Smallest value in the set
    pub fn first(&self) -> Option<u64> {
        self.extents.first().map(|e| e.start)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.extents.iter()
    }

    pub fn iter_values(&self) -> impl Iterator<Item = u64> + '_ {
        self.extents.iter().flat_map(|e| e.start..=e.end)
    }

    /// Add a value. Adjacent runs are merged; adding a value already present
    /// is a no-op.
    pub fn add(&mut self, value: u64) {
        // Position of the first run ending at or after the value
        let pos = self.extents.iter().position(|e| e.end + 1 >= value);

        let i = match pos {
            None => {
                self.extents.push(Extent { start: value, end: value });
                return;
            }
            Some(i) => i,
        };

        let cur = &mut self.extents[i];
        if value >= cur.start && value <= cur.end {
            return;
        }

        if cur.start > 0 && value == cur.start - 1 {
            cur.start -= 1;
            return;
        }

        if value == cur.end + 1 {
            cur.end += 1;
            // The expanded run may now touch the next one
            if i + 1 < self.extents.len() && self.extents[i + 1].start == value + 1 {
                self.extents[i].end = self.extents[i + 1].end;
                self.extents.remove(i + 1);
            }
            return;
        }

        // Strictly between the previous run and this one
        self.extents.insert(i, Extent { start: value, end: value });
    }

    /// Remove a value, shrinking or splitting its run. Removing an absent
    /// value is a no-op.
    pub fn remove(&mut self, value: u64) {
        let pos = match self.extents.iter()
                            .position(|e| value >= e.start && value <= e.end) {
            None => return,
            Some(i) => i,
        };

        let cur = self.extents[pos];

        if cur.start == cur.end {
            self.extents.remove(pos);
        } else if value == cur.start {
            self.extents[pos].start += 1;
        } else if value == cur.end {
            self.extents[pos].end -= 1;
        } else {
            // Separate the run into two
            self.extents[pos].end = value - 1;
            self.extents.insert(pos + 1, Extent { start: value + 1, end: cur.end });
        }
    }

    pub fn serialized_size(&self) -> u64 {
        4 + self.extents.len() as u64 * 16
    }

    pub fn serialize(&self, stream: &mut dyn Stream) -> VrtResult<()> {
        stream.write_u32_le(self.count())?;
        for extent in &self.extents {
            stream.write_u64_le(extent.start)?;
            stream.write_u64_le(extent.end)?;
        }
        Ok(())
    }

    pub fn deserialize(stream: &mut dyn Stream) -> VrtResult<Self> {
        let n = stream.read_u32_le()?;
        let mut extents: Vec<Extent> = Vec::with_capacity(n as usize);

        for _ in 0..n {
            let start = stream.read_u64_le()?;
            let end = stream.read_u64_le()?;
            if end < start {
                return Err(VrtError::SbCorruption);
            }
            if let Some(prev) = extents.last() {
                if start <= prev.end + 1 {
                    return Err(VrtError::SbCorruption);
                }
            }
            extents.push(Extent { start, end });
        }

        Ok(Self { extents })
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for w in self.extents.windows(2) {
            assert!(w[0].start <= w[0].end);
            assert!(w[1].start > w[0].end + 1,
                    "runs must stay disjoint, ascending, non-adjacent: {:?}", self);
        }
        if let Some(e) = self.extents.last() {
            assert!(e.start <= e.end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vrt_lib::stream::{MemoryStream, StreamAccess};
    use rand::prelude::*;

    #[test]
    fn empty_list_has_no_runs_nor_values() {
        let list = ExtentList::new();
        assert_eq!(list.count(), 0);
        assert_eq!(list.num_values(), 0);
        assert!(!list.contains(0));
        assert_eq!(list.first(), None);
    }

    #[test]
    fn disjoint_values_make_one_run_each() {
        let mut list = ExtentList::new();
        for i in 0..10 {
            list.add(i * 2);
        }
        assert_eq!(list.count(), 10);
        assert_eq!(list.num_values(), 10);
        list.check_invariants();
    }

    #[test]
    fn contiguous_values_merge_into_one_run() {
        let mut list = ExtentList::new();
        for i in 0..10 {
            list.add(i);
        }
        for i in 20..30 {
            list.add(i);
        }
        assert_eq!(list.count(), 2);
        assert_eq!(list.num_values(), 20);
        list.check_invariants();
    }

    #[test]
    fn add_fills_gap_and_merges_runs() {
        let mut list = ExtentList::new();
        list.add(1);
        list.add(3);
        assert_eq!(list.count(), 2);
        list.add(2);
        assert_eq!(list.count(), 1);
        assert_eq!(list.num_values(), 3);
        list.check_invariants();
    }

    #[test]
    fn add_existing_value_is_noop() {
        let mut list = ExtentList::new();
        list.add(5);
        list.add(5);
        assert_eq!(list.count(), 1);
        assert_eq!(list.num_values(), 1);
    }

    #[test]
    fn add_before_first_run() {
        let mut list = ExtentList::new();
        list.add(10);
        list.add(3);
        assert_eq!(list.first(), Some(3));
        assert_eq!(list.count(), 2);
        list.check_invariants();
    }

    #[test]
    fn remove_splits_a_run() {
        let mut list = ExtentList::new();
        for i in 0..10 {
            list.add(i);
        }
        list.remove(5);
        assert_eq!(list.count(), 2);
        assert_eq!(list.num_values(), 9);
        assert!(!list.contains(5));
        list.check_invariants();
    }

    #[test]
    fn remove_shrinks_run_edges() {
        let mut list = ExtentList::new();
        for i in 5..8 {
            list.add(i);
        }
        list.remove(5);
        assert_eq!(list.first(), Some(6));
        list.remove(7);
        assert_eq!(list.num_values(), 1);
        list.remove(6);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_absent_value_is_noop() {
        let mut list = ExtentList::new();
        list.add(1);
        list.remove(42);
        assert_eq!(list.num_values(), 1);
    }

    #[test]
    fn iter_values_yields_ascending_values() {
        let mut list = ExtentList::new();
        for v in [7u64, 1, 2, 9, 3] {
            list.add(v);
        }
        assert_eq!(list.iter_values().collect::<Vec<_>>(), vec![1, 2, 3, 7, 9]);
    }

    #[test]
    fn serialize_deserialize_is_identity() -> VrtResult<()> {
        let mut list = ExtentList::new();
        for v in [0u64, 1, 2, 10, 11, 40, 1000] {
            list.add(v);
        }

        let mut buf = vec![0u8; list.serialized_size() as usize];
        {
            let mut stream = MemoryStream::new(&mut buf, StreamAccess::Write);
            list.serialize(&mut stream)?;
        }
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Read);
        let copy = ExtentList::deserialize(&mut stream)?;
        assert_eq!(copy, list);
        Ok(())
    }

    #[test]
    fn deserialize_rejects_overlapping_runs() {
        let mut buf = vec![];
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&10u64.to_le_bytes());
        buf.extend_from_slice(&5u64.to_le_bytes());
        buf.extend_from_slice(&20u64.to_le_bytes());

        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Read);
        assert_eq!(ExtentList::deserialize(&mut stream), Err(VrtError::SbCorruption));
    }

    #[test]
    fn deserialize_truncated_stream_fails_cleanly() {
        let mut buf = vec![];
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&2u64.to_le_bytes());

        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Read);
        assert_eq!(ExtentList::deserialize(&mut stream), Err(VrtError::Io));
    }

    #[test]
    fn random_add_remove_keeps_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5EA0);
        let mut list = ExtentList::new();
        let mut model = std::collections::BTreeSet::new();

        for _ in 0..2000 {
            let value = rng.gen_range(0u64..200);
            if rng.gen_bool(0.5) {
                list.add(value);
                model.insert(value);
            } else {
                list.remove(value);
                model.remove(&value);
            }
            list.check_invariants();
        }

        assert_eq!(list.num_values(), model.len() as u64);
        assert_eq!(list.iter_values().collect::<Vec<_>>(),
                   model.iter().copied().collect::<Vec<_>>());
    }
}
