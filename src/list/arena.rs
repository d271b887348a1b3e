use core::fmt;

/// Index into an [`Arena`] carrying a generation so stale indices are detected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaIndex {
    index: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Slot position.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when the value was inserted.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}:{})", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// Vector-backed storage with a free list and generation-checked indices.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no slot is occupied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value`, reusing a vacant slot when one exists.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.len += 1;
        if let Some(free) = self.free_head {
            let slot = &mut self.slots[free as usize];
            let Slot::Vacant {
                next_free,
                generation,
            } = *slot
            else {
                unreachable!("Arena::insert: free list points at an occupied slot")
            };
            self.free_head = next_free;
            *slot = Slot::Occupied { value, generation };
            return ArenaIndex {
                index: free,
                generation,
            };
        }
        let index = u32::try_from(self.slots.len()).expect("Arena::insert: [1]");
        self.slots.push(Slot::Occupied {
            value,
            generation: 0,
        });
        ArenaIndex {
            index,
            generation: 0,
        }
    }

    /// Removes and returns the value at `idx`; `None` if `idx` is stale.
    pub fn remove(&mut self, idx: ArenaIndex) -> Option<T> {
        let slot = self.slots.get_mut(idx.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == idx.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            next_free: self.free_head,
            generation: idx.generation.wrapping_add(1),
        };
        let Slot::Occupied { value, .. } = core::mem::replace(slot, vacant) else {
            unreachable!("Arena::remove: slot checked as occupied")
        };
        self.free_head = Some(idx.index);
        self.len -= 1;
        Some(value)
    }

    /// Shared access; `None` if `idx` is stale.
    #[must_use]
    pub fn get(&self, idx: ArenaIndex) -> Option<&T> {
        match self.slots.get(idx.index as usize)? {
            Slot::Occupied { value, generation } if *generation == idx.generation => Some(value),
            _ => None,
        }
    }

    /// Exclusive access; `None` if `idx` is stale.
    pub fn get_mut(&mut self, idx: ArenaIndex) -> Option<&mut T> {
        match self.slots.get_mut(idx.index as usize)? {
            Slot::Occupied { value, generation } if *generation == idx.generation => Some(value),
            _ => None,
        }
    }

    /// Whether `idx` refers to a live value.
    #[must_use]
    pub fn contains(&self, idx: ArenaIndex) -> bool {
        self.get(idx).is_some()
    }
}
