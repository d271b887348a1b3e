//! Arena-backed intrusive ownership lists.
//!
//! Entries live in a [`LinkedArena`] and carry their own `prev`/`next` links
//! plus an owner tag naming the single [`OwnershipList`] they currently belong
//! to. Linking an entry that already has an owner, or unlinking it from a list
//! that does not own it, is a contract violation and panics.

mod arena;

pub use arena::{Arena, ArenaIndex};

/// Tag identifying one list of a [`LinkedArena`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListId(u32);

/// Head of a doubly-linked list whose entries live in a [`LinkedArena`].
#[derive(Debug)]
pub struct OwnershipList {
    id: ListId,
    head: Option<ArenaIndex>,
    tail: Option<ArenaIndex>,
    len: usize,
}

impl OwnershipList {
    /// Tag carried by the members of this list.
    #[must_use]
    pub const fn id(&self) -> ListId {
        self.id
    }

    /// Number of members.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the list has no members.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First member.
    #[must_use]
    pub const fn head(&self) -> Option<ArenaIndex> {
        self.head
    }
}

#[derive(Debug, Default)]
struct Link {
    owner: Option<ListId>,
    prev: Option<ArenaIndex>,
    next: Option<ArenaIndex>,
}

#[derive(Debug)]
struct Entry<T> {
    value: T,
    link: Link,
}

/// Storage for entries that may each belong to at most one [`OwnershipList`].
#[derive(Debug)]
pub struct LinkedArena<T> {
    entries: Arena<Entry<T>>,
    next_list: u32,
}

impl<T> Default for LinkedArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LinkedArena<T> {
    /// Empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Arena::new(),
            next_list: 0,
        }
    }

    /// Creates a list whose members must come from this arena.
    pub fn new_list(&mut self) -> OwnershipList {
        let id = ListId(self.next_list);
        self.next_list = self.next_list.wrapping_add(1);
        OwnershipList {
            id,
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Number of live entries, linked or not.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no live entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores an unlinked entry.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.entries.insert(Entry {
            value,
            link: Link::default(),
        })
    }

    /// Shared access to an entry's value.
    #[must_use]
    pub fn get(&self, idx: ArenaIndex) -> Option<&T> {
        self.entries.get(idx).map(|entry| &entry.value)
    }

    /// Exclusive access to an entry's value.
    pub fn get_mut(&mut self, idx: ArenaIndex) -> Option<&mut T> {
        self.entries.get_mut(idx).map(|entry| &mut entry.value)
    }

    /// Whether `idx` refers to a live entry.
    #[must_use]
    pub fn contains(&self, idx: ArenaIndex) -> bool {
        self.entries.contains(idx)
    }

    #[cfg(test)]
    /// The list currently owning the entry, if any.
    #[must_use]
    pub fn owner(&self, idx: ArenaIndex) -> Option<ListId> {
        self.entries.get(idx).and_then(|entry| entry.link.owner)
    }

    /// Appends an unlinked entry to `list`.
    ///
    /// # Panics
    /// If the entry is stale or already belongs to a list.
    pub fn push_back(&mut self, list: &mut OwnershipList, idx: ArenaIndex) {
        let tail = list.tail;
        let entry = self
            .entries
            .get_mut(idx)
            .expect("LinkedArena::push_back: [1]");
        assert!(
            entry.link.owner.is_none(),
            "LinkedArena::push_back: entry {idx:?} already belongs to {:?}",
            entry.link.owner
        );
        entry.link = Link {
            owner: Some(list.id),
            prev: tail,
            next: None,
        };
        match tail {
            Some(tail) => {
                self.entries
                    .get_mut(tail)
                    .expect("LinkedArena::push_back: [2]")
                    .link
                    .next = Some(idx);
            }
            None => list.head = Some(idx),
        }
        list.tail = Some(idx);
        list.len += 1;
    }

    /// Unlinks the entry from `list`, returning whether the list is now empty.
    ///
    /// # Panics
    /// If the entry is stale or is not a member of `list`.
    pub fn unlink(&mut self, list: &mut OwnershipList, idx: ArenaIndex) -> bool {
        let entry = self
            .entries
            .get_mut(idx)
            .expect("LinkedArena::unlink: [1]");
        assert_eq!(
            entry.link.owner,
            Some(list.id),
            "LinkedArena::unlink: entry {idx:?} is not a member of {:?}",
            list.id
        );
        let Link { prev, next, .. } = core::mem::take(&mut entry.link);
        match prev {
            Some(prev) => {
                self.entries
                    .get_mut(prev)
                    .expect("LinkedArena::unlink: [2]")
                    .link
                    .next = next;
            }
            None => list.head = next,
        }
        match next {
            Some(next) => {
                self.entries
                    .get_mut(next)
                    .expect("LinkedArena::unlink: [3]")
                    .link
                    .prev = prev;
            }
            None => list.tail = prev,
        }
        list.len -= 1;
        list.len == 0
    }

    /// Unlinks and returns the first member of `list`.
    pub fn pop_front(&mut self, list: &mut OwnershipList) -> Option<ArenaIndex> {
        let head = list.head?;
        self.unlink(list, head);
        Some(head)
    }

    /// Removes an unlinked entry.
    ///
    /// # Panics
    /// If the entry still belongs to a list.
    pub fn remove(&mut self, idx: ArenaIndex) -> Option<T> {
        if let Some(entry) = self.entries.get(idx) {
            assert!(
                entry.link.owner.is_none(),
                "LinkedArena::remove: entry {idx:?} is still linked"
            );
        }
        self.entries.remove(idx).map(|entry| entry.value)
    }

    /// Members of `list` in order.
    #[must_use]
    pub fn members(&self, list: &OwnershipList) -> Vec<ArenaIndex> {
        let mut members = Vec::with_capacity(list.len);
        let mut cursor = list.head;
        while let Some(idx) = cursor {
            members.push(idx);
            cursor = self
                .entries
                .get(idx)
                .expect("LinkedArena::members: [1]")
                .link
                .next;
        }
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlink_reports_emptiness_and_clears_links() {
        let mut arena = LinkedArena::new();
        let mut list = arena.new_list();
        let a = arena.insert('a');
        let b = arena.insert('b');
        arena.push_back(&mut list, a);
        arena.push_back(&mut list, b);
        assert_eq!(arena.members(&list), vec![a, b]);
        assert!(!arena.unlink(&mut list, a));
        assert_eq!(arena.owner(a), None);
        assert!(arena.unlink(&mut list, b));
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
    }

    #[test]
    fn entry_moves_between_lists_only_after_unlink() {
        let mut arena = LinkedArena::new();
        let mut first = arena.new_list();
        let mut second = arena.new_list();
        let a = arena.insert(1);
        arena.push_back(&mut first, a);
        assert_eq!(arena.owner(a), Some(first.id()));
        arena.unlink(&mut first, a);
        arena.push_back(&mut second, a);
        assert_eq!(arena.owner(a), Some(second.id()));
        assert_eq!(arena.pop_front(&mut second), Some(a));
        assert_eq!(arena.remove(a), Some(1));
    }

    #[test]
    #[should_panic(expected = "already belongs")]
    fn double_membership_is_a_contract_violation() {
        let mut arena = LinkedArena::new();
        let mut first = arena.new_list();
        let mut second = arena.new_list();
        let a = arena.insert(());
        arena.push_back(&mut first, a);
        arena.push_back(&mut second, a);
    }

    #[test]
    #[should_panic(expected = "not a member")]
    fn unlink_from_foreign_list_is_a_contract_violation() {
        let mut arena = LinkedArena::new();
        let mut first = arena.new_list();
        let mut second = arena.new_list();
        let a = arena.insert(());
        arena.push_back(&mut first, a);
        arena.unlink(&mut second, a);
    }

    #[test]
    fn middle_unlink_keeps_order() {
        let mut arena = LinkedArena::new();
        let mut list = arena.new_list();
        let keys: Vec<_> = (0..4).map(|value| arena.insert(value)).collect();
        for &key in &keys {
            arena.push_back(&mut list, key);
        }
        arena.unlink(&mut list, keys[1]);
        arena.unlink(&mut list, keys[3]);
        assert_eq!(arena.members(&list), vec![keys[0], keys[2]]);
        assert_eq!(list.len(), 2);
    }
}
