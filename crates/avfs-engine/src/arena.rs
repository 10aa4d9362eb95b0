//! Generation-checked slot storage.
//!
//! Slots are reused after removal, but every reuse bumps the slot's
//! generation, so an [`Index`] kept past its value's removal never aliases
//! the slot's next occupant.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a value inside an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Index {
    slot: u32,
    generation: u32,
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

#[derive(Debug)]
enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Slot storage addressed by generation-checked indices.
#[derive(Debug)]
pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store a value, reusing a free slot when one exists.
    pub fn insert(&mut self, value: T) -> Index {
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.entries[slot as usize];
            let generation = match entry {
                Entry::Vacant { generation } => *generation,
                Entry::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *entry = Entry::Occupied { generation, value };
            return Index { slot, generation };
        }

        let slot = self.entries.len() as u32;
        self.entries.push(Entry::Occupied {
            generation: 0,
            value,
        });
        Index {
            slot,
            generation: 0,
        }
    }

    pub fn get(&self, index: Index) -> Option<&T> {
        match self.entries.get(index.slot as usize)? {
            Entry::Occupied { generation, value } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: Index) -> Option<&mut T> {
        match self.entries.get_mut(index.slot as usize)? {
            Entry::Occupied { generation, value } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Take a value out, retiring its index.
    pub fn remove(&mut self, index: Index) -> Option<T> {
        let entry = self.entries.get_mut(index.slot as usize)?;
        match entry {
            Entry::Occupied { generation, .. } if *generation == index.generation => {
                let next = Entry::Vacant {
                    generation: generation.wrapping_add(1),
                };
                let Entry::Occupied { value, .. } = std::mem::replace(entry, next) else {
                    return None;
                };
                self.free.push(index.slot);
                self.len -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    /// Iterate over live values with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (Index, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| match entry {
                Entry::Occupied { generation, value } => Some((
                    Index {
                        slot: slot as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Entry::Vacant { .. } => None,
            })
    }

    /// Remove every value, retiring all indices.
    pub fn drain(&mut self) -> Vec<(Index, T)> {
        let indices: Vec<Index> = self.iter().map(|(index, _)| index).collect();
        indices
            .into_iter()
            .filter_map(|index| self.remove(index).map(|value| (index, value)))
            .collect()
    }
}
