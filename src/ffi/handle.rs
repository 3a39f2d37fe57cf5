//! Generation-counted handle table
//!
//! Handles given to native code are `(index, generation)` pairs packed into
//! a `u64`. Removing a slot bumps its generation, so a stale handle can never
//! alias a newer occupant of the same slot. The raw value 0 is never issued.

use std::fmt;

/// Opaque handle naming one slot of a [`HandleTable`]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Pack into the form passed across the boundary
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Unpack a raw value received from native code
    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.to_raw())
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot table owning one value per live handle
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> HandleTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store a value and return its handle
    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        // Generation starts at 1 so no handle packs to 0
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        Handle {
            index,
            generation: 1,
        }
    }

    /// Borrow the value behind a live handle
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Mutably borrow the value behind a live handle
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Take the value out, invalidating the handle
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    /// Whether the handle names a live slot
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Handles of every live slot
    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| Handle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no slot is live
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut table = HandleTable::new();
        let a = table.insert("a");
        let b = table.insert("b");

        assert_ne!(a, b);
        assert_eq!(table.get(a), Some(&"a"));
        assert_eq!(table.get(b), Some(&"b"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_stale_handle_does_not_alias_new_occupant() {
        let mut table = HandleTable::new();
        let old = table.insert(1);
        assert_eq!(table.remove(old), Some(1));

        let new = table.insert(2);
        assert_eq!(old.index, new.index, "slot should be reused");
        assert_ne!(old, new);
        assert_eq!(table.get(old), None);
        assert_eq!(table.get(new), Some(&2));
    }

    #[test]
    fn test_remove_twice_is_noop() {
        let mut table = HandleTable::new();
        let h = table.insert(5);
        assert_eq!(table.remove(h), Some(5));
        assert_eq!(table.remove(h), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_raw_round_trip_and_zero_is_invalid() {
        let mut table = HandleTable::new();
        let h = table.insert(());
        assert_ne!(h.to_raw(), 0);
        assert_eq!(Handle::from_raw(h.to_raw()), h);
        assert!(!table.contains(Handle::from_raw(0)));
    }

    #[test]
    fn test_handles_lists_live_slots() {
        let mut table = HandleTable::new();
        let a = table.insert('a');
        let b = table.insert('b');
        table.remove(a);

        assert_eq!(table.handles(), vec![b]);
        assert!(table.get_mut(b).is_some());
    }
}
