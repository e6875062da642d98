use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

/// Wakes clients blocked on list keys (BLPOP/BRPOP). A producer that pushes
/// to a key calls `notify` for the touched (database, key) pair; woken
/// waiters re-check their predicate under the keyspace lock.
#[derive(Debug, Default)]
pub struct KeyWatcher {
    waiters: HashMap<(usize, String), Vec<Arc<Notify>>>,
}

impl KeyWatcher {
    pub fn new() -> Self {
        KeyWatcher::default()
    }

    /// Register one shared Notify handle across several keys of a database.
    /// A push to any of them fires the handle.
    pub fn register(&mut self, db: usize, keys: &[String]) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        for key in keys {
            self.waiters
                .entry((db, key.clone()))
                .or_default()
                .push(notify.clone());
        }
        notify
    }

    /// Wake every waiter parked on the given key.
    pub fn notify(&mut self, db: usize, key: &str) {
        if let Some(waiters) = self.waiters.remove(&(db, key.to_string())) {
            for waiter in waiters {
                waiter.notify_one();
            }
        }
    }

    /// Detach a waiter from its keys after a pop or timeout.
    pub fn unregister(&mut self, db: usize, keys: &[String], notify: &Arc<Notify>) {
        for key in keys {
            if let Some(waiters) = self.waiters.get_mut(&(db, key.clone())) {
                waiters.retain(|w| !Arc::ptr_eq(w, notify));
                if waiters.is_empty() {
                    self.waiters.remove(&(db, key.clone()));
                }
            }
        }
    }
}

pub type SharedKeyWatcher = Arc<RwLock<KeyWatcher>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_wakes_registered_waiter() {
        let mut watcher = KeyWatcher::new();
        let keys = vec!["q".to_string()];
        let notify = watcher.register(0, &keys);
        watcher.notify(0, "q");
        // The permit was stored; this resolves immediately.
        notify.notified().await;
    }

    #[test]
    fn notify_is_scoped_to_database() {
        let mut watcher = KeyWatcher::new();
        let keys = vec!["q".to_string()];
        let _notify = watcher.register(1, &keys);
        watcher.notify(0, "q");
        assert!(watcher.waiters.contains_key(&(1, "q".to_string())));
    }

    #[test]
    fn unregister_removes_only_that_waiter() {
        let mut watcher = KeyWatcher::new();
        let keys = vec!["q".to_string()];
        let first = watcher.register(0, &keys);
        let _second = watcher.register(0, &keys);
        watcher.unregister(0, &keys, &first);
        assert_eq!(watcher.waiters[&(0, "q".to_string())].len(), 1);
    }
}
