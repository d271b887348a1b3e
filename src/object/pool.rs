use crate::{
    error::Escalation,
    object::{ManagedObject, ManagedObjectPool, ManagedObjectSource, ManagedObjectUser},
};
use core::{
    any::Any,
    fmt::{self, Debug},
};
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tracing::debug;

/// Pool keeping up to a fixed number of idle objects, sourcing new ones when
/// none is idle.
pub struct IdlePool {
    source: Arc<dyn ManagedObjectSource>,
    idle: Mutex<Vec<Box<dyn ManagedObject>>>,
    max_idle: usize,
    lost: AtomicUsize,
}

impl Debug for IdlePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdlePool")
            .field("idle", &self.idle_count())
            .field("max_idle", &self.max_idle)
            .field("lost", &self.lost_count())
            .finish_non_exhaustive()
    }
}

impl IdlePool {
    /// Pool over `source` keeping at most `max_idle` idle objects.
    pub fn new(source: impl ManagedObjectSource, max_idle: usize) -> Self {
        Self {
            source: Arc::new(source),
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            lost: AtomicUsize::new(0),
        }
    }

    /// Number of idle objects.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of objects reported lost.
    #[must_use]
    pub fn lost_count(&self) -> usize {
        self.lost.load(Ordering::Relaxed)
    }
}

impl ManagedObjectPool for IdlePool {
    fn source_managed_object(&self, user: ManagedObjectUser) {
        let idle = self.idle.lock().pop();
        match idle {
            Some(object) => user.set_boxed(object),
            None => self.source.source(user),
        }
    }

    fn return_managed_object(&self, object: Box<dyn ManagedObject>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(object);
        }
    }

    fn lost_managed_object(&self, object: Box<dyn ManagedObject>, cause: Escalation) {
        drop(object);
        self.lost.fetch_add(1, Ordering::Relaxed);
        debug!(%cause, "pooled managed object lost");
    }
}

/// Argument of a recycle function: the unloaded object.
///
/// [`RecycleParameter::reuse`] hands a pooled object back to its pool. A
/// parameter dropped without reuse reports a pooled object lost.
pub struct RecycleParameter {
    bound_name: Arc<str>,
    object: Option<Box<dyn ManagedObject>>,
    pool: Option<Arc<dyn ManagedObjectPool>>,
}

impl Debug for RecycleParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecycleParameter")
            .field("bound_name", &self.bound_name)
            .field("pooled", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

impl RecycleParameter {
    pub(crate) fn new(
        bound_name: Arc<str>,
        object: Box<dyn ManagedObject>,
        pool: Option<Arc<dyn ManagedObjectPool>>,
    ) -> Self {
        Self {
            bound_name,
            object: Some(object),
            pool,
        }
    }

    /// Name the object was bound under.
    #[must_use]
    pub fn bound_name(&self) -> &Arc<str> {
        &self.bound_name
    }

    /// The object as a `T`.
    pub fn object<T: Any>(&mut self) -> Option<&mut T> {
        self.object.as_mut()?.object().downcast_mut::<T>()
    }

    /// Whether the object came from a pool.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Returns the object to its pool. Returns `false` (dropping the object)
    /// when it did not come from one.
    pub fn reuse(mut self) -> bool {
        let (Some(object), Some(pool)) = (self.object.take(), self.pool.take()) else {
            return false;
        };
        pool.return_managed_object(object);
        true
    }
}

impl Drop for RecycleParameter {
    fn drop(&mut self) {
        if let (Some(object), Some(pool)) = (self.object.take(), self.pool.take()) {
            let cause = Escalation::msg(format!("`{}` was not reused", self.bound_name));
            pool.lost_managed_object(object, cause);
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::object::ValueObject;

    fn parameter(pool: &Arc<IdlePool>) -> RecycleParameter {
        RecycleParameter::new(
            "conn".into(),
            Box::new(ValueObject(7_u32)),
            Some(pool.clone() as Arc<dyn ManagedObjectPool>),
        )
    }

    #[test]
    fn reuse_returns_to_pool() {
        let pool = Arc::new(IdlePool::new(|_user: ManagedObjectUser| {}, 1));
        let mut recycled = parameter(&pool);
        assert_eq!(recycled.object::<u32>(), Some(&mut 7));
        assert!(recycled.reuse());
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.lost_count(), 0);
    }

    #[test]
    fn dropped_parameter_reports_loss() {
        let pool = Arc::new(IdlePool::new(|_user: ManagedObjectUser| {}, 1));
        drop(parameter(&pool));
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.lost_count(), 1);
    }

    #[test]
    fn idle_list_is_bounded() {
        let pool = IdlePool::new(|_user: ManagedObjectUser| {}, 1);
        pool.return_managed_object(Box::new(ValueObject(1_u8)));
        pool.return_managed_object(Box::new(ValueObject(2_u8)));
        assert_eq!(pool.idle_count(), 1);
    }
}
