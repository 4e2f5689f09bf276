//! Ordered secondary indices over slab records.
//!
//! Each index is a sorted vector of slot positions. Entries are kept in
//! the comparator's exact order followed by row id, which makes it total.
//! Lookups compare fields only, with unset key fields as wildcards:
//! `lower_bound` is the first entry not less than the key and
//! `upper_bound` the first entry greater than it, as if the key's identity
//! were the minimum or maximum sentinel.
//!
//! Mutating an indexed field while iterating the same index is not
//! supported; callers finish iterating before calling a setter.

use crate::field::KeyMatch;
use crate::record::{Comparator, IndexDef, Record};
use crate::slab::ObjectSlab;
use std::cmp::Ordering;

/// A single named ordered index.
pub struct Index<R> {
    name: &'static str,
    compare: Comparator<R>,
    /// Slot positions in index order.
    entries: Vec<usize>,
}

impl<R: Record> Index<R> {
    pub fn new(def: IndexDef<R>) -> Self {
        Self {
            name: def.name,
            compare: def.compare,
            entries: Vec::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn order(&self, a: &R, b: &R) -> Ordering {
        (self.compare)(a, b, KeyMatch::Exact).then_with(|| a.row().cmp(&b.row()))
    }

    /// Position of `slot`'s record, or where it would be inserted.
    fn locate(&self, slab: &ObjectSlab<R>, record: &R) -> usize {
        self.entries.partition_point(|&s| match slab.at(s) {
            Some(existing) => self.order(existing, record) == Ordering::Less,
            None => true,
        })
    }

    /// Inserts the record in `slot`. Returns false if it is already present.
    pub fn insert(&mut self, slab: &ObjectSlab<R>, slot: usize) -> bool {
        let Some(record) = slab.at(slot) else {
            return false;
        };
        let pos = self.locate(slab, record);
        if self.entries.get(pos) == Some(&slot) {
            return false;
        }
        self.entries.insert(pos, slot);
        true
    }

    /// Removes the record in `slot`, which must still hold the field values
    /// it was inserted with.
    pub fn remove(&mut self, slab: &ObjectSlab<R>, slot: usize) -> bool {
        let Some(record) = slab.at(slot) else {
            return false;
        };
        let pos = self.locate(slab, record);
        if self.entries.get(pos) != Some(&slot) {
            return false;
        }
        self.entries.remove(pos);
        true
    }

    /// First position whose record is not less than `key`.
    pub fn lower_bound(&self, slab: &ObjectSlab<R>, key: &R) -> usize {
        self.entries.partition_point(|&s| {
            slab.at(s).map_or(true, |r| {
                (self.compare)(r, key, KeyMatch::Wildcard) == Ordering::Less
            })
        })
    }

    /// First position whose record is greater than `key`.
    pub fn upper_bound(&self, slab: &ObjectSlab<R>, key: &R) -> usize {
        self.entries.partition_point(|&s| {
            slab.at(s).map_or(true, |r| {
                (self.compare)(r, key, KeyMatch::Wildcard) != Ordering::Greater
            })
        })
    }

    /// Slots between two positions.
    pub fn slots(&self, start: usize, end: usize) -> &[usize] {
        let end = end.min(self.entries.len());
        &self.entries[start.min(end)..end]
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Iterator over the records of an index range, in index order.
///
/// Reverse iteration is available through [`DoubleEndedIterator`].
pub struct IndexRange<'a, R> {
    slab: &'a ObjectSlab<R>,
    slots: std::slice::Iter<'a, usize>,
}

impl<'a, R: Record> IndexRange<'a, R> {
    pub(crate) fn new(slab: &'a ObjectSlab<R>, slots: &'a [usize]) -> Self {
        Self {
            slab,
            slots: slots.iter(),
        }
    }
}

impl<'a, R: Record> Iterator for IndexRange<'a, R> {
    type Item = &'a R;

    fn next(&mut self) -> Option<Self::Item> {
        let slab = self.slab;
        self.slots.by_ref().find_map(|&s| slab.at(s))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.slots.len()))
    }
}

impl<'a, R: Record> DoubleEndedIterator for IndexRange<'a, R> {
    fn next_back(&mut self) -> Option<Self::Item> {
        let slab = self.slab;
        while let Some(&s) = self.slots.next_back() {
            if let Some(record) = slab.at(s) {
                return Some(record);
            }
        }
        None
    }
}

/// All indices of one table.
pub struct IndexSet<R> {
    indices: Vec<Index<R>>,
}

impl<R: Record> IndexSet<R> {
    /// Builds the indices declared by the record type.
    pub fn from_record() -> Self {
        Self {
            indices: R::indices().into_iter().map(Index::new).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Index<R>> {
        self.indices.iter().find(|i| i.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.indices.iter().map(|i| i.name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Index<R>> + '_ {
        self.indices.iter()
    }

    /// Adds the record in `slot` to every index.
    pub fn insert_all(&mut self, slab: &ObjectSlab<R>, slot: usize) {
        for index in self.indices.iter_mut() {
            index.insert(slab, slot);
        }
    }

    /// Removes the record in `slot` from every index.
    pub fn remove_all(&mut self, slab: &ObjectSlab<R>, slot: usize) {
        for index in self.indices.iter_mut() {
            index.remove(slab, slot);
        }
    }

    pub fn clear(&mut self) {
        for index in self.indices.iter_mut() {
            index.clear();
        }
    }

    /// Returns the name of every index whose size differs from `expected`.
    pub fn inconsistent(&self, expected: usize) -> Vec<&'static str> {
        self.indices
            .iter()
            .filter(|i| i.len() != expected)
            .map(|i| i.name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{compare_key, KeyMatch};
    use crate::record::PRIMARY_KEY;

    crate::define_record! {
        pub struct Quote = "Quote" {
            [BUCKET = 0] index bucket: Option<i32>,
            [SEQ = 1] index seq: Option<u32>,
        }
        indices {
            "PrimaryKey" => Quote::by_seq,
            "ByBucket" => Quote::by_bucket_seq,
        }
    }

    impl Quote {
        fn by_seq(a: &Self, b: &Self, m: KeyMatch) -> Ordering {
            compare_key(&a.seq, &b.seq, m)
        }

        fn by_bucket_seq(a: &Self, b: &Self, m: KeyMatch) -> Ordering {
            compare_key(&a.bucket, &b.bucket, m).then_with(|| compare_key(&a.seq, &b.seq, m))
        }

        fn key(bucket: Option<i32>, seq: Option<u32>) -> Self {
            Quote {
                bucket,
                seq,
                ..Default::default()
            }
        }
    }

    fn populate(n: u32) -> (ObjectSlab<Quote>, IndexSet<Quote>) {
        let mut slab = ObjectSlab::new(false);
        slab.setup(n as usize);
        let mut set = IndexSet::from_record();
        for i in 0..n {
            let (slot, row) = slab.allocate(None).unwrap();
            let mut q = Quote::key(Some((i % 2) as i32), Some(i));
            q.set_row(Some(row));
            slab.place(slot, q);
            set.insert_all(&slab, slot);
        }
        (slab, set)
    }

    #[test]
    fn test_sizes_match_slab() {
        let (slab, set) = populate(20);
        assert!(set.inconsistent(slab.len()).is_empty());
        assert_eq!(set.get(PRIMARY_KEY).unwrap().len(), 20);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["PrimaryKey", "ByBucket"]);
    }

    #[test]
    fn test_wildcard_range_selects_bucket() {
        let (slab, set) = populate(50);
        let index = set.get("ByBucket").unwrap();
        let key = Quote::key(Some(1), None);
        let lo = index.lower_bound(&slab, &key);
        let hi = index.upper_bound(&slab, &key);
        assert_eq!(hi - lo, 25);

        let seqs: Vec<u32> = IndexRange::new(&slab, index.slots(lo, hi))
            .map(|q| q.seq.unwrap())
            .collect();
        assert_eq!(seqs.first(), Some(&1));
        assert_eq!(seqs.last(), Some(&49));
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_reverse_iteration() {
        let (slab, set) = populate(6);
        let index = set.get(PRIMARY_KEY).unwrap();
        let seqs: Vec<u32> = IndexRange::new(&slab, index.slots(0, index.len()))
            .rev()
            .map(|q| q.seq.unwrap())
            .collect();
        assert_eq!(seqs, vec![5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_exact_key_bounds() {
        let (slab, set) = populate(10);
        let index = set.get(PRIMARY_KEY).unwrap();
        let hit = Quote::key(None, Some(4));
        assert_eq!(index.upper_bound(&slab, &hit) - index.lower_bound(&slab, &hit), 1);

        let miss = Quote::key(None, Some(40));
        assert_eq!(index.lower_bound(&slab, &miss), index.upper_bound(&slab, &miss));
    }

    #[test]
    fn test_remove_then_reinsert() {
        let (mut slab, mut set) = populate(4);
        let slot = slab.slot_of(2).unwrap();
        set.remove_all(&slab, slot);
        assert_eq!(set.inconsistent(3), Vec::<&str>::new());

        // Duplicate insert is rejected.
        set.insert_all(&slab, slot);
        let index_len = set.get(PRIMARY_KEY).unwrap().len();
        set.insert_all(&slab, slot);
        assert_eq!(set.get(PRIMARY_KEY).unwrap().len(), index_len);

        let released = slab.release(2);
        assert!(released.is_some());
    }

    #[test]
    fn test_equal_fields_ordered_by_row() {
        let mut slab = ObjectSlab::<Quote>::new(false);
        slab.setup(3);
        let mut set = IndexSet::<Quote>::from_record();
        for _ in 0..3 {
            let (slot, row) = slab.allocate(None).unwrap();
            let mut q = Quote::key(Some(9), Some(9));
            q.set_row(Some(row));
            slab.place(slot, q);
            set.insert_all(&slab, slot);
        }
        let index = set.get("ByBucket").unwrap();
        let rows: Vec<_> = IndexRange::new(&slab, index.slots(0, 3))
            .map(|q| q.row().unwrap())
            .collect();
        assert_eq!(rows, vec![0, 1, 2]);
    }
}
