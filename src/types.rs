use core::{any::Any, num::NonZeroU64};
use derive_more::Display;
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

/// Identifier of a process, unique within one office.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("process-{_0}")]
#[repr(transparent)]
pub struct ProcessId(NonZeroU64);

/// Identifier of a thread state, unique within one office.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("thread-{_0}")]
#[repr(transparent)]
pub struct ThreadId(NonZeroU64);

impl ProcessId {
    /// Raw numeric value of the identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl ThreadId {
    /// Raw numeric value of the identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

/// Monotonic source of process and thread identifiers.
#[derive(Debug)]
pub(crate) struct IdSequence(AtomicU64);

impl IdSequence {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    fn next(&self) -> NonZeroU64 {
        let raw = self.0.fetch_add(1, Ordering::Relaxed);
        NonZeroU64::new(raw).expect("IdSequence::next: [1]")
    }

    pub(crate) fn next_process(&self) -> ProcessId {
        ProcessId(self.next())
    }

    pub(crate) fn next_thread(&self) -> ThreadId {
        ThreadId(self.next())
    }
}

/// Name of a team (worker-pool group).
pub type TeamName = Arc<str>;
/// Type-erased argument passed into a function.
pub type Argument = Box<dyn Any + Send>;
/// Unit of work handed to a team.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
/// `IndexSet` type with fast hasher.
pub type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
