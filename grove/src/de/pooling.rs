//! Deserialize-side identity tables.

use hashbrown::HashMap;

use crate::archive::{Id, SliceNode};
use crate::value::{Slot, Value};

/// Pools the values reconstructed during one deserialization run.
///
/// Reference nodes resolve against `values`, pointer edges against
/// `slots`, and slice nodes against `arrays`. Edges whose target has
/// not been reconstructed yet queue up for the fixup pass.
#[derive(Debug, Default)]
pub struct Pool {
    /// Node id to the reconstructed value, for reference resolution.
    values: HashMap<Id, Value>,
    /// Node id to the location the value was written to, for pointer
    /// targets.
    slots: HashMap<Id, Slot>,
    /// Node id to the reconstructed array or string, for slices.
    arrays: HashMap<Id, Value>,
    /// Pointers waiting for their target id, with the location of the
    /// pointer itself.
    pending_pointers: Vec<(Id, Slot)>,
    /// Slices waiting for their parent array.
    pending_slices: Vec<(SliceNode, Slot)>,
}

impl Pool {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all tables for a new run.
    pub fn clear(&mut self) {
        self.values.clear();
        self.slots.clear();
        self.arrays.clear();
        self.pending_pointers.clear();
        self.pending_slices.clear();
    }

    /// Records the value reconstructed from the node `id`.
    pub fn add_value(&mut self, id: Id, value: Value) {
        self.values.insert(id, value);
    }

    /// The value reconstructed from the node `id`, if any. The clone
    /// shares the value's identity.
    pub fn value(&self, id: Id) -> Option<Value> {
        self.values.get(&id).cloned()
    }

    /// Records the location the node `id` was written to.
    pub fn add_slot(&mut self, id: Id, slot: Slot) {
        self.slots.insert(id, slot);
    }

    /// The location the node `id` was written to, if any.
    pub fn slot(&self, id: Id) -> Option<Slot> {
        self.slots.get(&id).cloned()
    }

    /// Records the array or string reconstructed from the node `id`.
    pub fn add_array(&mut self, id: Id, value: Value) {
        self.arrays.insert(id, value);
    }

    /// The array or string reconstructed from the node `id`, if any.
    pub fn array(&self, id: Id) -> Option<Value> {
        self.arrays.get(&id).cloned()
    }

    /// Queues a pointer at `slot` until the node `target` appears.
    pub fn defer_pointer(&mut self, target: Id, slot: Slot) {
        self.pending_pointers.push((target, slot));
    }

    /// Queues a slice at `slot` until its parent array appears.
    pub fn defer_slice(&mut self, node: SliceNode, slot: Slot) {
        self.pending_slices.push((node, slot));
    }

    /// Drains the queued pointers.
    pub fn take_pending_pointers(&mut self) -> Vec<(Id, Slot)> {
        core::mem::take(&mut self.pending_pointers)
    }

    /// Drains the queued slices.
    pub fn take_pending_slices(&mut self) -> Vec<(SliceNode, Slot)> {
        core::mem::take(&mut self.pending_slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::slot;

    #[test]
    fn identity_survives_the_pool() {
        let mut pool = Pool::new();
        let location = slot(Value::from(1i32));
        pool.add_slot(4, location.clone());
        let recovered = pool.slot(4).unwrap();
        assert!(std::rc::Rc::ptr_eq(&location, &recovered));
        assert!(pool.slot(5).is_none());
    }

    #[test]
    fn pending_edges_drain_once() {
        let mut pool = Pool::new();
        pool.defer_pointer(9, slot(Value::Null(None)));
        assert_eq!(pool.take_pending_pointers().len(), 1);
        assert!(pool.take_pending_pointers().is_empty());
    }
}
