//! A pool of expensive, non-thread-safe resources.
//!
//! Each instance is handed to one caller at a time. Instances are created
//! lazily by a factory when no idle one is available, and are returned to the
//! pool when the [`Pooled`] guard drops. A factory failure is remembered and
//! every later acquisition fails fast with [`Error::PoolPoisoned`].

use std::ops::{Deref, DerefMut};

use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

type Factory<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

struct PoolState<T> {
    idle: Vec<T>,
    /// Instances in existence, lent out or idle, plus any under construction.
    created: usize,
    failure: Option<String>,
}

pub struct ResourcePool<T> {
    factory: Factory<T>,
    max_instances: Option<usize>,
    state: Mutex<PoolState<T>>,
    released: Condvar,
}

impl<T> ResourcePool<T> {
    /// An unbounded pool: a new instance is built whenever all are in use.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            max_instances: None,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                created: 0,
                failure: None,
            }),
            released: Condvar::new(),
        }
    }

    /// Cap the number of instances; callers beyond the cap wait for a release.
    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = Some(max.max(1));
        self
    }

    /// Borrow an instance exclusively until the guard drops.
    pub fn acquire(&self) -> Result<Pooled<'_, T>> {
        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.failure {
                return Err(Error::PoolPoisoned(reason.clone()));
            }
            if let Some(resource) = state.idle.pop() {
                return Ok(Pooled {
                    pool: self,
                    resource: Some(resource),
                });
            }
            if self.max_instances.map_or(true, |max| state.created < max) {
                state.created += 1;
                break;
            }
            self.released.wait(&mut state);
        }
        let id = state.created;
        drop(state);

        debug!("Creating pooled instance #{}", id);
        let mut slot = Reservation {
            pool: self,
            filled: false,
        };
        match (self.factory)() {
            Ok(resource) => {
                slot.filled = true;
                Ok(Pooled {
                    pool: self,
                    resource: Some(resource),
                })
            }
            Err(e) => {
                error!("Pooled instance construction failed: {}", e);
                self.state.lock().failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Number of instances constructed so far.
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    /// Number of instances waiting to be borrowed.
    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn max_instances(&self) -> Option<usize> {
        self.max_instances
    }

    fn release(&self, resource: T) {
        self.state.lock().idle.push(resource);
        self.released.notify_one();
    }
}

/// A counted slot for an instance under construction. Handed back on drop
/// unless the factory filled it, including when the factory panics.
struct Reservation<'a, T> {
    pool: &'a ResourcePool<T>,
    filled: bool,
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if !self.filled {
            self.pool.state.lock().created -= 1;
            self.pool.released.notify_all();
        }
    }
}

/// Exclusive access to a pooled instance.
pub struct Pooled<'a, T> {
    pool: &'a ResourcePool<T>,
    resource: Option<T>,
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only taken in drop.
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource used after release"),
        }
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource used after release"),
        }
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Panics if two callers ever hold it at once.
    struct Exclusive {
        in_use: AtomicBool,
    }

    impl Exclusive {
        fn work(&self) {
            assert!(!self.in_use.swap(true, Ordering::SeqCst), "instance shared");
            std::thread::sleep(std::time::Duration::from_millis(2));
            self.in_use.store(false, Ordering::SeqCst);
        }
    }

    fn exclusive_pool(counter: Arc<AtomicUsize>) -> ResourcePool<Exclusive> {
        ResourcePool::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Exclusive {
                in_use: AtomicBool::new(false),
            })
        })
    }

    #[test]
    fn reuses_released_instance() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = exclusive_pool(counter.clone());

        drop(pool.acquire().unwrap());
        drop(pool.acquire().unwrap());

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn grows_while_instances_are_lent() {
        let pool = exclusive_pool(Arc::new(AtomicUsize::new(0)));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.created(), 2);
        assert_eq!(pool.idle(), 0);
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn concurrent_callers_never_share_an_instance() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = exclusive_pool(counter.clone());
        let threads = 8;

        std::thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    for _ in 0..20 {
                        pool.acquire().unwrap().work();
                    }
                });
            }
        });

        let created = counter.load(Ordering::SeqCst);
        assert!(created >= 1 && created <= threads);
        assert_eq!(pool.idle(), created);
    }

    #[test]
    fn capped_pool_makes_callers_wait() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = exclusive_pool(counter.clone()).with_max_instances(1);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10 {
                        pool.acquire().unwrap().work();
                    }
                });
            }
        });

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn factory_failure_poisons_the_pool() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let pool: ResourcePool<u32> = ResourcePool::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidModel("bad asset".into()))
        });

        assert!(matches!(pool.acquire(), Err(Error::InvalidModel(_))));
        assert!(matches!(pool.acquire(), Err(Error::PoolPoisoned(_))));
        assert!(matches!(pool.acquire(), Err(Error::PoolPoisoned(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.created(), 0);
    }

    #[test]
    fn panicking_factory_frees_its_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let pool = ResourcePool::new(move || {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("factory blew up");
            }
            Ok(5u32)
        })
        .with_max_instances(1);

        let first = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.acquire().map(|_| ())
        }));
        assert!(first.is_err());
        assert_eq!(pool.created(), 0);

        // Would block forever if the panicked construction still held the slot.
        assert_eq!(*pool.acquire().unwrap(), 5);
        assert_eq!(pool.created(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn guard_gives_mutable_access() {
        let pool = ResourcePool::new(|| Ok(Vec::<u8>::new()));
        pool.acquire().unwrap().push(7);
        assert_eq!(*pool.acquire().unwrap(), vec![7]);
    }
}
