//! Async mutexes keyed by id. A slot exists only while someone holds or
//! waits for it, so the table is bounded by in-flight work rather than by
//! every key ever seen.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::Mutex;

pub(crate) struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }
}

impl<K: Clone + Eq + Hash> KeyedLocks<K> {
    /// Runs `work` while holding the lock for `key`. Work under other keys
    /// proceeds concurrently.
    pub(crate) async fn run<F: Future>(&self, key: &K, work: F) -> F::Output {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let output = {
            let _guard = slot.lock().await;
            work.await
        };

        self.release(key, slot).await;
        output
    }

    async fn release(&self, key: &K, slot: Arc<Mutex<()>>) {
        let mut slots = self.slots.lock().await;
        // Clones are only taken under `slots`, so a count of two (table plus
        // `slot`) means nobody is waiting.
        let idle = slots
            .get(key)
            .is_some_and(|held| Arc::ptr_eq(held, &slot) && Arc::strong_count(held) == 2);
        if idle {
            slots.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) async fn tracked(&self) -> usize {
        self.slots.lock().await.len()
    }
}
