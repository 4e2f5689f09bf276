//! Fixed-capacity record storage with a FIFO free list.
//!
//! A slab owns `capacity` slots allocated once at setup. Allocation pops the
//! front of the free list; releases push to the back. Handing out every slot
//! of the current lap advances the generation, so the logical row id
//! `capacity * generation + slot` never repeats even though slots do.
//! Entity slabs retire released slots instead of recycling them.

use crate::record::Record;
use std::collections::VecDeque;
use tessera_common::RowId;

/// State of a physical slot.
#[derive(Debug, Clone)]
enum Slot<R> {
    /// On the free list.
    Vacant,
    /// Holds a live record.
    Live(R),
    /// Released by an entity table; never handed out again until reset.
    Retired,
}

/// Preallocated record array plus free-list allocator.
#[derive(Debug)]
pub struct ObjectSlab<R> {
    slots: Vec<Slot<R>>,
    free: VecDeque<usize>,
    /// Lap counter; incremented each time the lap quota is used up.
    generation: u32,
    /// Slots left to hand out in the current lap.
    lap_remaining: usize,
    live: usize,
    entity: bool,
}

impl<R: Record> ObjectSlab<R> {
    /// Creates an empty slab. Nothing is allocatable until [`setup`](Self::setup).
    pub fn new(entity: bool) -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            generation: 0,
            lap_remaining: 0,
            live: 0,
            entity,
        }
    }

    /// Allocates the slot array and seeds the free list.
    ///
    /// Only the first call has any effect.
    pub fn setup(&mut self, capacity: usize) {
        if !self.slots.is_empty() || capacity == 0 {
            return;
        }
        self.slots = (0..capacity).map(|_| Slot::Vacant).collect();
        self.reseed();
    }

    fn reseed(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = Slot::Vacant;
        }
        self.free = (0..self.slots.len()).collect();
        self.generation = 0;
        self.lap_remaining = self.slots.len();
        self.live = 0;
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live records.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Slots currently on the free list.
    #[inline]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn is_entity(&self) -> bool {
        self.entity
    }

    /// Physical slot backing a row id.
    #[inline]
    pub fn slot_of(&self, row: RowId) -> Option<usize> {
        match self.capacity() {
            0 => None,
            cap => Some(row as usize % cap),
        }
    }

    /// Reserves a slot and returns it with the row id the record must carry.
    ///
    /// With `requested`, the allocation succeeds only if that row's slot is
    /// free, and the requested id is kept verbatim. Returns `None` when the
    /// free list is empty or the requested slot is taken.
    pub fn allocate(&mut self, requested: Option<RowId>) -> Option<(usize, RowId)> {
        if self.free.is_empty() {
            return None;
        }
        let pos = match requested {
            Some(row) => {
                let slot = self.slot_of(row)?;
                self.free.iter().position(|&s| s == slot)?
            }
            None => 0,
        };

        let mut generation = self.generation;
        if self.lap_remaining == 0 {
            generation = generation.checked_add(1)?;
        }
        let slot = self.free[pos];
        let row = match requested {
            Some(row) => row,
            None => {
                let id = self.capacity() as u64 * generation as u64 + slot as u64;
                RowId::try_from(id).ok()?
            }
        };

        if self.lap_remaining == 0 {
            self.generation = generation;
            self.lap_remaining = self.free.len();
        }
        self.free.remove(pos);
        self.lap_remaining -= 1;
        Some((slot, row))
    }

    /// Stores a record in a slot returned by [`allocate`](Self::allocate).
    pub fn place(&mut self, slot: usize, record: R) {
        if let Some(entry) = self.slots.get_mut(slot) {
            if !matches!(entry, Slot::Live(_)) {
                self.live += 1;
            }
            *entry = Slot::Live(record);
        }
    }

    /// Puts a record back at its exact row, bypassing lap accounting.
    ///
    /// Used to undo a delete. Succeeds if the slot is free or retired.
    pub fn restore(&mut self, record: R) -> bool {
        let Some(slot) = record.row().and_then(|row| self.slot_of(row)) else {
            return false;
        };
        match self.slots[slot] {
            Slot::Live(_) => return false,
            Slot::Retired => {}
            Slot::Vacant => match self.free.iter().position(|&s| s == slot) {
                Some(pos) => {
                    self.free.remove(pos);
                    self.lap_remaining = self.lap_remaining.saturating_sub(1);
                }
                None => return false,
            },
        }
        self.slots[slot] = Slot::Live(record);
        self.live += 1;
        true
    }

    /// Removes the record with `row` and returns it.
    ///
    /// The slot goes to the back of the free list, or is retired for
    /// entity slabs.
    pub fn release(&mut self, row: RowId) -> Option<R> {
        let slot = self.slot_of(row)?;
        if self.get(row).is_none() {
            return None;
        }
        let next = if self.entity {
            Slot::Retired
        } else {
            self.free.push_back(slot);
            Slot::Vacant
        };
        self.live -= 1;
        match std::mem::replace(&mut self.slots[slot], next) {
            Slot::Live(record) => Some(record),
            _ => None,
        }
    }

    /// Returns the live record whose identity is exactly `row`.
    pub fn get(&self, row: RowId) -> Option<&R> {
        match self.slots.get(self.slot_of(row)?)? {
            Slot::Live(record) if record.row() == Some(row) => Some(record),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, row: RowId) -> Option<&mut R> {
        let slot = self.slot_of(row)?;
        match self.slots.get_mut(slot)? {
            Slot::Live(record) if record.row() == Some(row) => Some(record),
            _ => None,
        }
    }

    /// Returns the live record in a physical slot.
    #[inline]
    pub fn at(&self, slot: usize) -> Option<&R> {
        match self.slots.get(slot)? {
            Slot::Live(record) => Some(record),
            _ => None,
        }
    }

    /// Iterates live records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &R)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Live(record) => Some((i, record)),
            _ => None,
        })
    }

    /// Drops every record, including retired entity slots, and restarts at generation zero.
    pub fn reset(&mut self) {
        self.reseed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{compare_key, KeyMatch};
    use std::cmp::Ordering;
    use std::collections::HashSet;

    crate::define_record! {
        pub struct Cell = "Cell" {
            [VALUE = 0] index value: Option<i64>,
        }
        indices {
            "PrimaryKey" => Cell::by_value,
        }
    }

    impl Cell {
        fn by_value(a: &Self, b: &Self, m: KeyMatch) -> Ordering {
            compare_key(&a.value, &b.value, m)
        }
    }

    fn store(slab: &mut ObjectSlab<Cell>, requested: Option<RowId>) -> Option<RowId> {
        let (slot, row) = slab.allocate(requested)?;
        let mut cell = Cell::default();
        cell.set_row(Some(row));
        slab.place(slot, cell);
        Some(row)
    }

    #[test]
    fn test_setup_is_idempotent() {
        let mut slab = ObjectSlab::<Cell>::new(false);
        slab.setup(4);
        slab.setup(16);
        assert_eq!(slab.capacity(), 4);
        assert_eq!(slab.free_len(), 4);
    }

    #[test]
    fn test_allocate_until_full() {
        let mut slab = ObjectSlab::<Cell>::new(false);
        slab.setup(3);
        assert_eq!(store(&mut slab, None), Some(0));
        assert_eq!(store(&mut slab, None), Some(1));
        assert_eq!(store(&mut slab, None), Some(2));
        assert_eq!(store(&mut slab, None), None);
        assert_eq!(slab.len(), 3);
    }

    #[test]
    fn test_generation_advances_after_lap() {
        let mut slab = ObjectSlab::<Cell>::new(false);
        slab.setup(2);
        let a = store(&mut slab, None).unwrap();
        let b = store(&mut slab, None).unwrap();
        assert!(slab.release(a).is_some());
        assert!(slab.release(b).is_some());

        // Second lap reuses slots 0 and 1 with new ids.
        assert_eq!(store(&mut slab, None), Some(2));
        assert_eq!(slab.generation(), 1);
        assert_eq!(store(&mut slab, None), Some(3));
        assert!(slab.get(a).is_none());
        assert!(slab.get(2).is_some());
    }

    #[test]
    fn test_logical_ids_never_collide_while_live() {
        let mut slab = ObjectSlab::<Cell>::new(false);
        slab.setup(8);
        let mut live: Vec<RowId> = Vec::new();
        let mut ever: HashSet<RowId> = HashSet::new();

        for round in 0..200u32 {
            if live.len() == 8 || (round % 3 == 0 && !live.is_empty()) {
                let victim = live.remove((round as usize * 7) % live.len());
                assert!(slab.release(victim).is_some());
            }
            let row = store(&mut slab, None).unwrap();
            assert!(!live.contains(&row));
            assert!(ever.insert(row), "row {row} handed out twice");
            live.push(row);
        }
        assert!(slab.generation() > 0);
    }

    #[test]
    fn test_requested_row_needs_free_slot() {
        let mut slab = ObjectSlab::<Cell>::new(false);
        slab.setup(4);
        assert_eq!(store(&mut slab, Some(6)), Some(6));
        assert!(slab.get(6).is_some());
        // Slot 2 (= 6 % 4) is taken now.
        assert_eq!(store(&mut slab, Some(2)), None);
        assert_eq!(store(&mut slab, Some(3)), Some(3));
    }

    #[test]
    fn test_entity_slots_are_retired() {
        let mut slab = ObjectSlab::<Cell>::new(true);
        slab.setup(2);
        let a = store(&mut slab, None).unwrap();
        assert!(slab.release(a).is_some());
        assert_eq!(slab.free_len(), 1);

        let b = store(&mut slab, None).unwrap();
        assert_ne!(slab.slot_of(a), slab.slot_of(b));
        assert_eq!(store(&mut slab, None), None);
    }

    #[test]
    fn test_restore_after_release() {
        let mut slab = ObjectSlab::<Cell>::new(true);
        slab.setup(2);
        let row = store(&mut slab, None).unwrap();
        let record = slab.release(row).unwrap();
        assert!(slab.get(row).is_none());

        assert!(slab.restore(record.clone()));
        assert!(slab.get(row).is_some());
        assert!(!slab.restore(record));
    }

    #[test]
    fn test_reset_reclaims_everything() {
        let mut slab = ObjectSlab::<Cell>::new(true);
        slab.setup(2);
        let a = store(&mut slab, None).unwrap();
        slab.release(a);
        store(&mut slab, None);

        slab.reset();
        assert!(slab.is_empty());
        assert_eq!(slab.free_len(), 2);
        assert_eq!(slab.generation(), 0);
        assert_eq!(store(&mut slab, None), Some(0));
    }
}
