//! Generational arena for lifecycle records.
//!
//! All supervisor records (activities, tasks, stacks, processes) live in one
//! arena per kind, and every cross-reference between records is a typed index
//! into the owning arena. Generation counters catch stale indices: once a
//! record is removed, indices minted for the old occupant no longer resolve.
//!
//! No unsafe code; relies on bounds checking and generation validation.

use core::fmt;
use core::hash::{Hash, Hasher};

/// An index into an arena, paired with the generation it was minted for.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArenaIndex {
    slot: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Creates an index from raw parts (primarily for tests).
    #[must_use]
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// Returns the raw slot number.
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Returns the generation counter.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}:{})", self.slot, self.generation)
    }
}

impl Hash for ArenaIndex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64((u64::from(self.slot) << 32) | u64::from(self.generation));
    }
}

enum Entry<T> {
    Full { value: T, generation: u32 },
    Free { next: Option<u32>, generation: u32 },
}

impl<T: fmt::Debug> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full { value, generation } => f
                .debug_struct("Full")
                .field("value", value)
                .field("generation", generation)
                .finish(),
            Self::Free { next, generation } => f
                .debug_struct("Free")
                .field("next", next)
                .field("generation", generation)
                .finish(),
        }
    }
}

/// A generational arena.
///
/// Freed slots are recycled through a free list; each recycle bumps the
/// slot's generation so indices to the previous occupant go stale.
#[derive(Debug)]
pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            live: 0,
        }
    }

    /// Returns the number of live records.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    /// Returns true if no records are live.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Inserts a record and returns its index.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.live += 1;
        if let Some(slot) = self.free_head {
            let entry = &mut self.entries[slot as usize];
            let Entry::Free { next, generation } = *entry else {
                unreachable!("free list pointed at a full slot");
            };
            self.free_head = next;
            *entry = Entry::Full { value, generation };
            ArenaIndex { slot, generation }
        } else {
            let slot = u32::try_from(self.entries.len()).expect("arena overflow");
            self.entries.push(Entry::Full {
                value,
                generation: 0,
            });
            ArenaIndex {
                slot,
                generation: 0,
            }
        }
    }

    /// Removes the record at `index`, returning it if the index was live.
    pub fn remove(&mut self, index: ArenaIndex) -> Option<T> {
        let entry = self.entries.get_mut(index.slot as usize)?;
        match entry {
            Entry::Full { generation, .. } if *generation == index.generation => {
                let next_generation = generation.wrapping_add(1);
                let old = core::mem::replace(
                    entry,
                    Entry::Free {
                        next: self.free_head,
                        generation: next_generation,
                    },
                );
                self.free_head = Some(index.slot);
                self.live -= 1;
                match old {
                    Entry::Full { value, .. } => Some(value),
                    Entry::Free { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Returns the record at `index`, if live.
    #[must_use]
    pub fn get(&self, index: ArenaIndex) -> Option<&T> {
        match self.entries.get(index.slot as usize)? {
            Entry::Full { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Returns the record at `index` mutably, if live.
    pub fn get_mut(&mut self, index: ArenaIndex) -> Option<&mut T> {
        match self.entries.get_mut(index.slot as usize)? {
            Entry::Full { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Returns true if `index` resolves to a live record.
    #[must_use]
    pub fn contains(&self, index: ArenaIndex) -> bool {
        self.get(index).is_some()
    }

    /// Iterates over live records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| match entry {
                Entry::Full { value, generation } => Some((
                    ArenaIndex {
                        slot: slot as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Entry::Free { .. } => None,
            })
    }

    /// Iterates mutably over live records in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ArenaIndex, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, entry)| match entry {
                Entry::Full { value, generation } => Some((
                    ArenaIndex {
                        slot: slot as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Entry::Free { .. } => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_records_resolve_and_count() {
        let mut arena = Arena::new();
        assert!(arena.is_empty());
        let idx = arena.insert("a");
        assert_eq!(arena.get(idx), Some(&"a"));
        assert_eq!(arena.len(), 1);
        assert!(arena.contains(idx));
    }

    #[test]
    fn removed_slot_is_recycled_with_new_generation() {
        let mut arena = Arena::new();
        let first = arena.insert(1);
        let second = arena.insert(2);

        assert_eq!(arena.remove(first), Some(1));
        assert_eq!(arena.get(first), None);

        let third = arena.insert(3);
        assert_eq!(third.slot(), first.slot());
        assert_ne!(third.generation(), first.generation());

        assert_eq!(arena.get(second), Some(&2));
        assert_eq!(arena.get(third), Some(&3));
    }

    #[test]
    fn stale_index_does_not_resolve() {
        let mut arena = Arena::new();
        let idx = arena.insert(7);
        arena.remove(idx);
        let replacement = arena.insert(8);

        assert_eq!(idx.slot(), replacement.slot());
        assert_eq!(arena.get(idx), None);
        assert!(!arena.contains(idx));
        assert_eq!(arena.get(replacement), Some(&8));
    }

    #[test]
    fn iter_skips_free_slots() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);
        let c = arena.insert(3);
        arena.remove(b);

        let live: Vec<_> = arena.iter().map(|(idx, v)| (idx, *v)).collect();
        assert_eq!(live, vec![(a, 1), (c, 3)]);
    }
}
