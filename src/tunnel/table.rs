//! Fixed-capacity virtual-circuit table
//!
//! Slot `i` always carries conv id `i`. Each allocation bumps the slot's
//! generation, so a [`SlotHandle`] kept past its circuit's release never
//! resolves to the next circuit that lands in the same slot.

use std::fmt;

/// Reference to one incarnation of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    conv: u32,
    generation: u32,
}

impl SlotHandle {
    /// Conv id (slot index)
    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// Incarnation of the slot this handle was issued for
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.conv, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

/// Pool of circuit slots
pub struct CircuitTable<T> {
    slots: Vec<Slot<T>>,
}

impl<T> CircuitTable<T> {
    /// Create a table with `capacity` free slots
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                entry: None,
            })
            .collect();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots in use
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    /// Take the first free slot. Returns `None` when the pool is exhausted.
    pub fn allocate(&mut self, make: impl FnOnce(SlotHandle) -> T) -> Option<SlotHandle> {
        let index = self.slots.iter().position(|slot| slot.entry.is_none())?;
        Some(self.occupy(index, make))
    }

    /// Take the slot for a specific conv id, if it exists and is free
    pub fn allocate_at(
        &mut self,
        conv: u32,
        make: impl FnOnce(SlotHandle) -> T,
    ) -> Option<SlotHandle> {
        let index = conv as usize;
        match self.slots.get(index) {
            Some(slot) if slot.entry.is_none() => Some(self.occupy(index, make)),
            _ => None,
        }
    }

    fn occupy(&mut self, index: usize, make: impl FnOnce(SlotHandle) -> T) -> SlotHandle {
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        let handle = SlotHandle {
            conv: index as u32,
            generation: slot.generation,
        };
        slot.entry = Some(make(handle));
        handle
    }

    /// Free the slot behind `handle`, returning its entry.
    ///
    /// Releasing a stale or already released handle is a no-op.
    pub fn release(&mut self, handle: SlotHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.conv as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.take()
    }

    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        let slot = self.slots.get(handle.conv as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.conv as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Resolve a conv id from the wire. Out-of-range and free ids yield `None`.
    pub fn lookup(&self, conv: u32) -> Option<(SlotHandle, &T)> {
        let slot = self.slots.get(conv as usize)?;
        let entry = slot.entry.as_ref()?;
        let handle = SlotHandle {
            conv,
            generation: slot.generation,
        };
        Some((handle, entry))
    }

    /// Handles of every slot in use
    pub fn handles(&self) -> Vec<SlotHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| SlotHandle {
                conv: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}
