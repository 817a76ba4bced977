//! Child collection of a mux parent
//!
//! Children live in an arena of generation-tagged slots. Removal is O(1)
//! and a [`ChildKey`] kept after its child left no longer resolves.

use std::collections::HashMap;

use crate::tunnel::{Line, PauseState};

/// Stable handle to a child slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildKey {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generation-checked slot arena
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn insert(&mut self, value: T) -> ChildKey {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return ChildKey {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ChildKey {
            index,
            generation: 0,
        }
    }

    pub fn remove(&mut self, key: ChildKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, key: ChildKey) -> Option<&T> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, key: ChildKey) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|s| s.value.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|s| s.value.as_mut())
    }
}

/// A child as seen from its parent
pub struct Child {
    pub line: Line,
    pub cid: u32,
    /// Why the child's source is stopped: `Peer` while the parent is
    /// stalled, `Flow` while the far side asked for it with FlowPause
    pub paused: PauseState,
}

/// Live children of one parent, addressable by key or connection id
#[derive(Default)]
pub struct Children {
    arena: Arena<Child>,
    by_cid: HashMap<u32, ChildKey>,
}

impl Children {
    /// Add a child; `None` if the connection id is already taken
    pub fn attach(&mut self, cid: u32, line: Line) -> Option<ChildKey> {
        if self.by_cid.contains_key(&cid) {
            return None;
        }
        let key = self.arena.insert(Child {
            line,
            cid,
            paused: PauseState::default(),
        });
        self.by_cid.insert(cid, key);
        Some(key)
    }

    /// Remove a child by key; stale keys remove nothing
    pub fn detach(&mut self, key: ChildKey) -> Option<Child> {
        let child = self.arena.remove(key)?;
        self.by_cid.remove(&child.cid);
        Some(child)
    }

    pub fn get(&self, cid: u32) -> Option<&Child> {
        self.arena.get(*self.by_cid.get(&cid)?)
    }

    pub fn get_mut(&mut self, cid: u32) -> Option<&mut Child> {
        let key = *self.by_cid.get(&cid)?;
        self.arena.get_mut(key)
    }

    pub fn get_by_key_mut(&mut self, key: ChildKey) -> Option<&mut Child> {
        self.arena.get_mut(key)
    }

    pub fn line(&self, cid: u32) -> Option<Line> {
        self.get(cid).map(|c| c.line.clone())
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn contains(&self, cid: u32) -> bool {
        self.by_cid.contains_key(&cid)
    }

    /// Snapshot of every child line
    pub fn lines(&self) -> Vec<Line> {
        self.arena.iter().map(|c| c.line.clone()).collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Child> {
        self.arena.iter_mut()
    }

    /// Remove every child, returning their lines
    pub fn drain(&mut self) -> Vec<Line> {
        self.by_cid.clear();
        let lines = self.lines();
        self.arena = Arena::default();
        lines
    }
}
