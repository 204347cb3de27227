//! Keyed single-flight mutex: collapse concurrent fetches of one resource.
//!
//! `lock` admits exactly one worker per name at a time and tells the caller
//! which side of the race it is on: `true` means "first acquirer since the
//! last unlock — you perform the fetch", `false` means "acquired by waiting —
//! another party just finished, look in the cache instead".
//!
//! Per-name state is created on first contact and dropped as soon as the name
//! has neither a holder nor waiters, so memory stays proportional to the
//! number of names actively in flight.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct Entry {
    held: bool,
    waiters: usize,
    notify: Arc<Notify>,
}

impl Entry {
    fn new() -> Self {
        Self {
            held: true,
            waiters: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

/// Per-name mutex over an arbitrary key type.
///
/// The map itself is guarded by one `std::sync::Mutex`; every critical
/// section is a couple of HashMap operations, which is cheaper than an async
/// lock for this access pattern.
pub struct KeyedMutex<K> {
    entries: Mutex<HashMap<K, Entry>>,
}

impl<K> Default for KeyedMutex<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedMutex<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the mutex for `name`, waiting if it is held.
    ///
    /// Returns `true` iff the caller is the first acquirer since the last
    /// `unlock` of this name. A `false` return means the previous holder has
    /// just released; the protected result should already be available.
    pub async fn lock(&self, name: K) -> bool {
        let notify = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(&name) {
                None => {
                    entries.insert(name, Entry::new());
                    return true;
                }
                Some(entry) => {
                    entry.waiters += 1;
                    entry.notify.clone()
                }
            }
        };

        loop {
            notify.notified().await;
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(&name) {
                Some(entry) if !entry.held => {
                    entry.held = true;
                    entry.waiters -= 1;
                    return false;
                }
                Some(_) => {
                    // Wake-up raced with another waiter taking over; go back to sleep.
                    continue;
                }
                None => {
                    // The name was fully released while we were waking up.
                    entries.insert(name, Entry::new());
                    return false;
                }
            }
        }
    }

    /// Non-blocking acquire. Returns `true` iff the mutex was free.
    pub fn try_lock(&self, name: K) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&name) {
            Some(_) => false,
            None => {
                entries.insert(name, Entry::new());
                true
            }
        }
    }

    /// Release the mutex for `name` and wake one waiter, if any.
    pub fn unlock(&self, name: K) {
        let mut entries = self.entries.lock().unwrap();
        let idle = match entries.get_mut(&name) {
            Some(entry) => {
                if entry.waiters == 0 {
                    true
                } else {
                    entry.held = false;
                    entry.notify.notify_one();
                    false
                }
            }
            None => false,
        };
        if idle {
            entries.remove(&name);
        }
    }

    /// Number of names currently tracked (held or contended).
    #[allow(dead_code)]
    pub fn in_flight_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
