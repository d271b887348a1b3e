use crate::{
    object::ObjectIndex,
    types::{IndexMap, IndexSet},
};
use rustc_hash::FxBuildHasher;
use std::collections::VecDeque;
use thiserror::Error;

/// Failure to order managed objects for loading.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub(crate) enum PlanError {
    /// A required object or dependency is not configured.
    #[error("no managed object configured at {0:?}")]
    Unknown(ObjectIndex),
    /// The dependencies contain cycle(s).
    #[error("managed object dependencies contain cycle(s)")]
    Cycle,
}

/// Order in which the objects a function requires are loaded: every object
/// after the objects it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoadPlan {
    order: Vec<ObjectIndex>,
}

impl LoadPlan {
    /// Orders `required` and everything they transitively depend on.
    /// `dependencies` yields the dependencies of a configured object and
    /// `None` for an index nothing is configured at.
    ///
    /// # Panics
    /// In case of internal invariant violations. Impossible if there are no
    /// bugs in the code.
    ///
    /// # Errors
    /// If an object is unknown or the dependencies contain cycle(s).
    pub(crate) fn new<'a, D>(required: &[ObjectIndex], dependencies: D) -> Result<Self, PlanError>
    where
        D: Fn(ObjectIndex) -> Option<&'a [ObjectIndex]>,
    {
        // Example:
        //
        //   thread(0)   process(0)
        //        \      /
        //       function(0)
        //
        // - function(0) depends on both => it is placed after them.
        // - Independent objects keep the order they were first reached in, so
        //   a function without dependencies loads its objects in declaration
        //   order.
        //
        // Phase 1: Collect the objects to load and the dependency edges.
        // - child_to_parents: object -> objects it depends on.
        // - parent_to_children: object -> objects depending on it.
        let mut objects = IndexSet::with_capacity_and_hasher(required.len(), FxBuildHasher);
        let mut child_to_parents: IndexMap<ObjectIndex, IndexSet<ObjectIndex>> =
            IndexMap::default();
        let mut parent_to_children: IndexMap<ObjectIndex, IndexSet<ObjectIndex>> =
            IndexMap::default();
        let mut reachable: VecDeque<ObjectIndex> = required.iter().copied().collect();
        while let Some(index) = reachable.pop_front() {
            if !objects.insert(index) {
                continue;
            }
            let parents = dependencies(index).ok_or(PlanError::Unknown(index))?;
            for &parent in parents {
                child_to_parents.entry(index).or_default().insert(parent);
                parent_to_children.entry(parent).or_default().insert(index);
                reachable.push_back(parent);
            }
        }

        // Phase 2: Seed the order with objects without dependencies.
        let mut placed: IndexSet<ObjectIndex> = objects
            .iter()
            .filter(|index| !child_to_parents.contains_key(*index))
            .copied()
            .collect();

        // Every object depends on another one: the whole set is cyclic.
        if placed.is_empty() && !objects.is_empty() {
            return Err(PlanError::Cycle);
        }

        // Phase 3: Worklist of objects whose dependencies might all be placed.
        let mut pending_queue = VecDeque::with_capacity(objects.len() - placed.len());
        let mut pending_set =
            IndexSet::with_capacity_and_hasher(objects.len() - placed.len(), FxBuildHasher);
        for index in &placed {
            let Some(children) = parent_to_children.get(index) else {
                continue;
            };
            for &child in children {
                if pending_set.insert(child) {
                    pending_queue.push_back(child);
                }
            }
        }

        // Phase 4: Kahn-like processing with progress detection. A candidate
        // with an unplaced dependency is skipped; that dependency re-enqueues
        // it once placed. No placement for as many iterations as the queue was
        // long at the last placement means the rest is cyclic.
        let mut last_progress_iter = 0usize;
        let mut last_progress_queue_len = pending_queue.len();
        let mut iter = 0usize;

        'process_pending: while let Some(index) = pending_queue.pop_front() {
            let removed = pending_set.swap_remove(&index);
            assert!(removed, "LoadPlan::new: [1]");
            if iter
                .checked_sub(last_progress_iter)
                .expect("LoadPlan::new: [2]")
                >= last_progress_queue_len
            {
                return Err(PlanError::Cycle);
            }
            iter = iter.checked_add(1).expect("LoadPlan::new: [3]");
            let parents = child_to_parents.get(&index).expect("LoadPlan::new: [4]");
            for parent in parents {
                if !placed.contains(parent) {
                    continue 'process_pending;
                }
            }
            let inserted_new = placed.insert(index);
            assert!(inserted_new, "LoadPlan::new: [5]");

            if let Some(children) = parent_to_children.get(&index) {
                for &child in children {
                    if !placed.contains(&child) && pending_set.insert(child) {
                        pending_queue.push_back(child);
                    }
                }
            }
            last_progress_iter = iter;
            last_progress_queue_len = pending_queue.len();
        }

        // Unplaced objects sit on a cycle (or depend on one).
        if placed.len() != objects.len() {
            return Err(PlanError::Cycle);
        }
        Ok(Self {
            order: placed.into_iter().collect(),
        })
    }

    /// Objects in load order.
    pub(crate) fn order(&self) -> &[ObjectIndex] {
        &self.order
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(
        required: &[ObjectIndex],
        edges: &[(ObjectIndex, &[ObjectIndex])],
    ) -> Result<LoadPlan, PlanError> {
        LoadPlan::new(required, |index| {
            edges
                .iter()
                .find(|(object, _)| *object == index)
                .map(|(_, dependencies)| *dependencies)
        })
    }

    #[test]
    fn dependencies_load_first() {
        let f0 = ObjectIndex::function(0);
        let t0 = ObjectIndex::thread(0);
        let p0 = ObjectIndex::process(0);
        let plan = plan(&[f0], &[(f0, &[t0, p0]), (t0, &[p0]), (p0, &[])]).unwrap();
        assert_eq!(plan.order(), &[p0, t0, f0]);
    }

    #[test]
    fn independent_objects_keep_declaration_order() {
        let a = ObjectIndex::function(0);
        let b = ObjectIndex::function(1);
        let c = ObjectIndex::thread(0);
        let plan = plan(&[b, a, c], &[(a, &[]), (b, &[]), (c, &[])]).unwrap();
        assert_eq!(plan.order(), &[b, a, c]);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn diamond_is_ordered_once() {
        let top = ObjectIndex::function(0);
        let left = ObjectIndex::function(1);
        let right = ObjectIndex::function(2);
        let bottom = ObjectIndex::process(0);
        let plan = plan(
            &[top],
            &[(top, &[left, right]), (left, &[bottom]), (right, &[bottom]), (bottom, &[])],
        )
        .unwrap();
        assert_eq!(plan.order(), &[bottom, left, right, top]);
    }

    #[test]
    fn cycles_are_rejected() {
        let a = ObjectIndex::thread(0);
        let b = ObjectIndex::thread(1);
        let root = ObjectIndex::process(0);
        assert_eq!(plan(&[a], &[(a, &[b]), (b, &[a])]), Err(PlanError::Cycle));
        assert_eq!(
            plan(&[a, root], &[(a, &[b]), (b, &[a, root]), (root, &[])]),
            Err(PlanError::Cycle)
        );
        assert_eq!(plan(&[a], &[(a, &[a])]), Err(PlanError::Cycle));
    }

    #[test]
    fn unknown_objects_are_reported() {
        let a = ObjectIndex::function(0);
        let missing = ObjectIndex::thread(3);
        assert_eq!(plan(&[a], &[(a, &[missing])]), Err(PlanError::Unknown(missing)));
    }
}
