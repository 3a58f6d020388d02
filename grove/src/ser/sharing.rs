//! Serialize-side identity and alias tables.

use hashbrown::HashMap;

use crate::archive::{ArrayRecord, Id, Slice};

/// Tracks the identities seen during one serialization run.
///
/// Reference-typed values are keyed by the address of their shared
/// state, so a value encountered twice is emitted once and referenced
/// afterwards. Array provenance and pointer pointees feed the two
/// post-processing passes.
#[derive(Debug, Default)]
pub struct Share {
    /// Address of a reference-typed value to the id it was emitted
    /// under.
    refs: HashMap<usize, Id>,
    /// Arrays and strings in emission order, for slice detection.
    arrays: Vec<(Id, ArrayRecord)>,
    /// Pointer id to the address of its pointee.
    pointers: Vec<(Id, usize)>,
    /// Field slot address to the id and key it was archived under.
    values: HashMap<usize, (Id, String)>,
}

impl Share {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all tables for a new run.
    pub fn clear(&mut self) {
        self.refs.clear();
        self.arrays.clear();
        self.pointers.clear();
        self.values.clear();
    }

    /// The id the value at `address` was emitted under, if any.
    pub fn reference(&self, address: usize) -> Option<Id> {
        self.refs.get(&address).copied()
    }

    /// Records that the value at `address` was emitted under `id`.
    pub fn add_reference(&mut self, address: usize, id: Id) {
        self.refs.insert(address, id);
    }

    /// Records the storage range behind an archived array or string.
    pub fn add_array(&mut self, id: Id, record: ArrayRecord) {
        self.arrays.push((id, record));
    }

    /// Records an archived pointer and the address of its pointee.
    pub fn add_pointer(&mut self, id: Id, pointee: usize) {
        self.pointers.push((id, pointee));
    }

    /// Records a field slot archived as a value.
    pub fn add_value(&mut self, address: usize, id: Id, key: &str) {
        self.values.insert(address, (id, key.to_string()));
    }

    /// The id and key of the value archived from `address`, if any.
    pub fn value(&self, address: usize) -> Option<(Id, String)> {
        self.values.get(&address).cloned()
    }

    /// All archived arrays, in emission order.
    pub fn arrays(&self) -> &[(Id, ArrayRecord)] {
        &self.arrays
    }

    /// All archived pointers, in emission order.
    pub fn pointers(&self) -> &[(Id, usize)] {
        &self.pointers
    }

    /// The array that owns `record`'s storage range, when `record`
    /// should be rewritten as a slice of it.
    ///
    /// The owner is the containing array with the widest range, ties
    /// resolved towards the earliest id, so exactly one array of every
    /// aliasing family stays standalone and all others point at it.
    pub fn slice_owner(
        &self,
        id: Id,
        record: &ArrayRecord,
    ) -> Option<(Id, Slice)> {
        let mut owner = (id, *record);
        for (candidate_id, candidate) in &self.arrays {
            if !candidate.contains(record) {
                continue;
            }
            if candidate.len > owner.1.len
                || (candidate.len == owner.1.len && *candidate_id < owner.0)
            {
                owner = (*candidate_id, *candidate);
            }
        }
        if owner.0 == id {
            return None;
        }
        Some((
            owner.0,
            Slice {
                offset: record.offset - owner.1.offset,
                len: record.len,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: usize, offset: usize, len: usize) -> ArrayRecord {
        ArrayRecord {
            address,
            offset,
            len,
        }
    }

    #[test]
    fn contained_ranges_become_slices() {
        let mut share = Share::new();
        share.add_array(0, record(0x100, 0, 10));
        share.add_array(1, record(0x100, 2, 3));
        assert_eq!(share.slice_owner(0, &record(0x100, 0, 10)), None);
        assert_eq!(
            share.slice_owner(1, &record(0x100, 2, 3)),
            Some((0, Slice { offset: 2, len: 3 }))
        );
    }

    #[test]
    fn owner_may_be_emitted_after_the_slice() {
        let mut share = Share::new();
        share.add_array(0, record(0x100, 2, 3));
        share.add_array(1, record(0x100, 0, 10));
        assert_eq!(
            share.slice_owner(0, &record(0x100, 2, 3)),
            Some((1, Slice { offset: 2, len: 3 }))
        );
        assert_eq!(share.slice_owner(1, &record(0x100, 0, 10)), None);
    }

    #[test]
    fn identical_ranges_pick_the_earliest_owner() {
        let mut share = Share::new();
        share.add_array(3, record(0x100, 0, 4));
        share.add_array(5, record(0x100, 0, 4));
        assert_eq!(share.slice_owner(3, &record(0x100, 0, 4)), None);
        assert_eq!(
            share.slice_owner(5, &record(0x100, 0, 4)),
            Some((3, Slice { offset: 0, len: 4 }))
        );
    }

    #[test]
    fn distinct_storage_never_aliases() {
        let mut share = Share::new();
        share.add_array(0, record(0x100, 0, 10));
        share.add_array(1, record(0x200, 0, 4));
        assert_eq!(share.slice_owner(1, &record(0x200, 0, 4)), None);
    }

    #[test]
    fn reference_table_round_trips() {
        let mut share = Share::new();
        assert_eq!(share.reference(0xabc), None);
        share.add_reference(0xabc, 7);
        assert_eq!(share.reference(0xabc), Some(7));
        share.clear();
        assert_eq!(share.reference(0xabc), None);
    }
}
