use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};

/// Mutual exclusion scoped to an equality key.
///
/// Callers locking different keys never contend with each other. A table entry lives only
/// while some caller holds or waits for its key, so the table does not grow with the number
/// of distinct keys ever seen.
pub struct KeyedLock<K> {
    slots: Mutex<HashMap<K, SlotEntry>>,
}

struct SlotEntry {
    // holder plus waiters; the entry is dropped when this reaches zero
    interested: usize,
    slot: Arc<Slot>,
}

#[derive(Default)]
struct Slot {
    held: Mutex<bool>,
    released: Condvar,
}

impl<K> Default for KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks until no other guard exists for an equal key.
    pub fn acquire(&self, key: K) -> KeyedGuard<'_, K> {
        let slot = self.register_interest(&key);

        let mut held = slot.held.lock().expect("keyed lock slot poisoned");
        while *held {
            held = slot
                .released
                .wait(held)
                .expect("keyed lock slot poisoned");
        }
        *held = true;
        drop(held);

        KeyedGuard {
            owner: self,
            key: Some(key),
            slot,
        }
    }

    /// Non-blocking variant of [`KeyedLock::acquire`].
    pub fn try_acquire(&self, key: K) -> Option<KeyedGuard<'_, K>> {
        let slot = self.register_interest(&key);

        let acquired = {
            let mut held = slot.held.lock().expect("keyed lock slot poisoned");
            if *held {
                false
            } else {
                *held = true;
                true
            }
        };

        if !acquired {
            self.drop_interest(&key);
            return None;
        }

        Some(KeyedGuard {
            owner: self,
            key: Some(key),
            slot,
        })
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.slots.lock().expect("keyed lock table poisoned").len()
    }

    fn register_interest(&self, key: &K) -> Arc<Slot> {
        let mut slots = self.slots.lock().expect("keyed lock table poisoned");
        let entry = slots.entry(key.clone()).or_insert_with(|| SlotEntry {
            interested: 0,
            slot: Arc::new(Slot::default()),
        });
        entry.interested += 1;
        Arc::clone(&entry.slot)
    }

    fn drop_interest(&self, key: &K) {
        let mut slots = self.slots.lock().expect("keyed lock table poisoned");
        if let Some(entry) = slots.get_mut(key) {
            entry.interested -= 1;
            if entry.interested == 0 {
                slots.remove(key);
            }
        }
    }

    fn release(&self, key: &K, slot: &Slot) {
        {
            let mut held = slot.held.lock().expect("keyed lock slot poisoned");
            *held = false;
        }
        slot.released.notify_one();
        self.drop_interest(key);
    }
}

impl<K> fmt::Debug for KeyedLock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLock").finish_non_exhaustive()
    }
}

/// Exclusive ownership of one key. Dropping the guard releases the key, including
/// during unwinding.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyedGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    owner: &'a KeyedLock<K>,
    key: Option<K>,
    slot: Arc<Slot>,
}

impl<K> KeyedGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    pub fn key(&self) -> &K {
        self.key
            .as_ref()
            .expect("keyed guard key is present until drop")
    }
}

impl<K> Drop for KeyedGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.owner.release(&key, &self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::KeyedLock;

    #[test]
    fn same_key_is_exclusive_across_threads() {
        let lock = Arc::new(KeyedLock::<String>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let workers = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = lock.acquire("job-1".to_owned());
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();

        for worker in workers {
            worker.join().expect("worker thread should not panic");
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(lock.active_keys(), 0);
    }

    #[test]
    fn distinct_keys_do_not_block_each_other() {
        let lock = Arc::new(KeyedLock::<u32>::new());
        let _held = lock.acquire(1);

        let other = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let guard = other.acquire(2);
            *guard.key()
        });

        assert_eq!(handle.join().expect("other key should lock"), 2);
        assert_eq!(lock.active_keys(), 1);
    }

    #[test]
    fn try_acquire_fails_while_key_is_held() {
        let lock = KeyedLock::<&'static str>::new();
        let guard = lock.acquire("alpha");

        assert!(lock.try_acquire("alpha").is_none());
        assert!(lock.try_acquire("beta").is_some());

        drop(guard);
        assert!(lock.try_acquire("alpha").is_some());
        assert_eq!(lock.active_keys(), 0);
    }

    #[test]
    fn waiter_is_released_when_holder_drops_guard() {
        let lock = Arc::new(KeyedLock::<String>::new());
        let barrier = Arc::new(Barrier::new(2));
        let guard = lock.acquire("u1".to_owned());

        let waiter_lock = Arc::clone(&lock);
        let waiter_barrier = Arc::clone(&barrier);
        let waiter = thread::spawn(move || {
            waiter_barrier.wait();
            let _guard = waiter_lock.acquire("u1".to_owned());
        });

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.join().expect("waiter should acquire after release");
        assert_eq!(lock.active_keys(), 0);
    }

    #[test]
    fn panic_inside_protected_section_releases_key() {
        let lock = KeyedLock::<u64>::new();

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.acquire(7);
            panic!("fault inside protected section");
        }));

        assert!(result.is_err());
        assert!(lock.try_acquire(7).is_some());
    }

    #[test]
    fn table_stays_bounded_under_many_distinct_keys() {
        let lock = KeyedLock::<u64>::new();
        for key in 0..10_000 {
            let _guard = lock.acquire(key);
        }
        assert_eq!(lock.active_keys(), 0);
    }
}
