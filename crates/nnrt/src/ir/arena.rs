//! Growable storage with stable indices.
//!
//! Entries are never moved: removing one leaves a hole, so every other index stays valid for
//! the lifetime of the arena. Looking up an index that was never issued or has been removed is
//! a programming error and panics.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

use super::index::ArenaIndex;

#[derive(Debug, Clone, PartialEq)]
pub struct Arena<I, T> {
    slots: Vec<Option<T>>,
    live: usize,
    _index: PhantomData<fn() -> I>,
}

impl<I: ArenaIndex, T> Arena<I, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
            _index: PhantomData,
        }
    }

    pub fn push(&mut self, value: T) -> I {
        let index = I::from_usize(self.slots.len());
        self.slots.push(Some(value));
        self.live += 1;
        index
    }

    pub fn get(&self, index: I) -> Option<&T> {
        self.slots.get(index.as_usize()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: I) -> Option<&mut T> {
        self.slots.get_mut(index.as_usize()).and_then(Option::as_mut)
    }

    pub fn contains(&self, index: I) -> bool {
        self.get(index).is_some()
    }

    /// Swaps the entry at `index` for `value`, keeping the index.
    pub fn replace(&mut self, index: I, value: T) -> (I, T) {
        let slot = self
            .slots
            .get_mut(index.as_usize())
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("arena index {index:?} does not exist"));
        let old = std::mem::replace(slot, value);
        (index, old)
    }

    /// Removes the entry, invalidating only `index`.
    pub fn remove(&mut self, index: I) -> T {
        let value = self
            .slots
            .get_mut(index.as_usize())
            .and_then(Option::take)
            .unwrap_or_else(|| panic!("arena index {index:?} does not exist"));
        self.live -= 1;
        value
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Upper bound of issued indices, including removed ones.
    pub fn capacity_hint(&self) -> usize {
        self.slots.len()
    }

    /// Live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (I, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(pos, slot)| slot.as_ref().map(|value| (I::from_usize(pos), value)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (I, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(pos, slot)| slot.as_mut().map(|value| (I::from_usize(pos), value)))
    }

    pub fn indices(&self) -> Vec<I> {
        self.iter().map(|(index, _)| index).collect()
    }
}

impl<I: ArenaIndex, T> Default for Arena<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ArenaIndex, T> Index<I> for Arena<I, T> {
    type Output = T;

    fn index(&self, index: I) -> &T {
        self.get(index)
            .unwrap_or_else(|| panic!("arena index {index:?} does not exist"))
    }
}

impl<I: ArenaIndex, T> IndexMut<I> for Arena<I, T> {
    fn index_mut(&mut self, index: I) -> &mut T {
        self.get_mut(index)
            .unwrap_or_else(|| panic!("arena index {index:?} does not exist"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OperandIndex;

    #[test]
    fn removal_keeps_other_indices_valid() {
        let mut arena: Arena<OperandIndex, &str> = Arena::new();
        let a = arena.push("a");
        let b = arena.push("b");
        let c = arena.push("c");
        assert_eq!(arena.remove(b), "b");
        assert_eq!(arena[a], "a");
        assert_eq!(arena[c], "c");
        assert!(!arena.contains(b));
        assert_eq!(arena.len(), 2);
        let d = arena.push("d");
        assert_ne!(d, b, "removed slots are never reissued");
    }

    #[test]
    fn replace_returns_same_index() {
        let mut arena: Arena<OperandIndex, u32> = Arena::new();
        let a = arena.push(1);
        let (index, old) = arena.replace(a, 2);
        assert_eq!(index, a);
        assert_eq!(old, 1);
        assert_eq!(arena[a], 2);
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn missing_index_panics() {
        let arena: Arena<OperandIndex, u32> = Arena::new();
        let _ = arena[OperandIndex(3)];
    }
}
