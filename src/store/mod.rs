pub mod entry;

use crate::config::NUM_DATABASES;
use crate::glob::glob_match;
use crate::types::Value;
use entry::Entry;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Errors reported by the direct keyspace accessors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("no such key")]
    NotFound,
}

/// One numbered database: keys with typed values, TTLs, and per-key version
/// counters.
///
/// Version bookkeeping: every mutation of a key (create, overwrite, delete,
/// TTL change, or a field/element update inside a composite value) bumps its
/// counter. The counters drive WATCH/EXEC: a transaction aborts when any
/// watched key's version moved. Deleted keys keep their version entry so a
/// delete is observable.
#[derive(Debug, Default)]
pub struct Database {
    id: usize,
    data: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
}

impl Database {
    fn new(id: usize) -> Self {
        Database {
            id,
            ..Default::default()
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Bump a key's version counter. Called by every mutating operation,
    /// including composite in-place updates done through `get_mut`.
    pub fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn key_version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// Remove a key whose TTL has been driven to zero, counting the removal
    /// as a mutation. Only relevant while the harness is time-travelling.
    fn reap_if_expired(&mut self, key: &str) {
        if self.data.get(key).is_some_and(Entry::is_expired) {
            self.data.remove(key);
            self.bump(key);
        }
    }

    pub fn get(&mut self, key: &str) -> Option<&Entry> {
        self.reap_if_expired(key);
        self.data.get(key)
    }

    /// Mutable access for in-place composite updates. Callers that mutate
    /// must `bump` the key afterwards; the existing TTL is left alone.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.reap_if_expired(key);
        self.data.get_mut(key)
    }

    pub fn contains(&mut self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn type_of(&mut self, key: &str) -> Option<&'static str> {
        self.get(key).map(|e| e.value.type_name())
    }

    /// Replace (or create) a key's value. Clears any TTL, as a plain value
    /// write does.
    pub fn set_value(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), Entry::new(value));
        self.bump(key);
    }

    /// Replace a key with an explicit entry (value + TTL).
    pub fn set_entry(&mut self, key: &str, entry: Entry) {
        self.data.insert(key.to_string(), entry);
        self.bump(key);
    }

    /// Fetch a key for in-place mutation, creating it empty when absent.
    /// The TTL of an existing key is preserved.
    pub fn get_or_create(&mut self, key: &str, make: impl FnOnce() -> Value) -> &mut Entry {
        self.reap_if_expired(key);
        self.data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(make()))
    }

    /// Delete a key. Returns true if it existed.
    pub fn del(&mut self, key: &str) -> bool {
        self.reap_if_expired(key);
        if self.data.remove(key).is_some() {
            self.bump(key);
            true
        } else {
            false
        }
    }

    /// Move a key under a new name, carrying value and TTL. Any existing
    /// destination is overwritten.
    pub fn rename(&mut self, old: &str, new: &str) -> bool {
        self.reap_if_expired(old);
        match self.data.remove(old) {
            Some(entry) => {
                self.bump(old);
                self.data.insert(new.to_string(), entry);
                self.bump(new);
                true
            }
            None => false,
        }
    }

    /// Remove a key's entry, TTL included, for cross-database moves.
    /// The removal counts as a mutation on this side.
    pub fn take(&mut self, key: &str) -> Option<Entry> {
        self.reap_if_expired(key);
        let taken = self.data.remove(key);
        if taken.is_some() {
            self.bump(key);
        }
        taken
    }

    /// Insert an entry as-is, TTL included, for cross-database moves.
    pub fn put(&mut self, key: &str, entry: Entry) {
        self.data.insert(key.to_string(), entry);
        self.bump(key);
    }

    pub fn ttl(&mut self, key: &str) -> Option<Duration> {
        self.get(key).and_then(|e| e.ttl)
    }

    /// Set a key's TTL. A zero duration deletes the key immediately.
    /// Returns false if the key does not exist.
    pub fn set_ttl(&mut self, key: &str, ttl: Duration) -> bool {
        self.reap_if_expired(key);
        if !self.data.contains_key(key) {
            return false;
        }
        if ttl.is_zero() {
            self.data.remove(key);
            self.bump(key);
        } else {
            self.data.get_mut(key).expect("checked above").ttl = Some(ttl);
            self.bump(key);
        }
        true
    }

    /// Drop a key's TTL. Returns true if the key existed and had one.
    pub fn persist(&mut self, key: &str) -> bool {
        self.reap_if_expired(key);
        match self.data.get_mut(key) {
            Some(e) if e.ttl.is_some() => {
                e.ttl = None;
                self.bump(key);
                true
            }
            _ => false,
        }
    }

    /// Live keys, sorted for deterministic iteration.
    pub fn all_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|(_, e)| !e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn keys_matching(&self, pattern: &str) -> Vec<String> {
        self.all_keys()
            .into_iter()
            .filter(|k| glob_match(pattern, k))
            .collect()
    }

    /// Cursor-based iteration over the sorted key list.
    /// Returns (next_cursor, matching keys); a next cursor of 0 means done.
    pub fn scan(&self, cursor: usize, pattern: Option<&str>, count: usize) -> (usize, Vec<String>) {
        let all = self.all_keys();
        if cursor >= all.len() {
            return (0, Vec::new());
        }
        let end = (cursor + count.max(1)).min(all.len());
        let window = all[cursor..end]
            .iter()
            .filter(|k| pattern.is_none_or(|p| glob_match(p, k)))
            .cloned()
            .collect();
        let next = if end >= all.len() { 0 } else { end };
        (next, window)
    }

    pub fn len(&self) -> usize {
        self.data.values().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every key, bumping each version so watchers notice.
    pub fn flush(&mut self) {
        let keys: Vec<String> = self.data.keys().cloned().collect();
        for key in keys {
            self.data.remove(&key);
            self.bump(&key);
        }
    }

    /// Shrink every TTL by `elapsed`; keys that reach zero are deleted.
    fn fast_forward(&mut self, elapsed: Duration) {
        let affected: Vec<String> = self
            .data
            .iter()
            .filter(|(_, e)| e.ttl.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        for key in affected {
            let remaining = self.data[&key].ttl.expect("filtered on ttl");
            if remaining <= elapsed {
                self.data.remove(&key);
                self.bump(&key);
            } else {
                self.data.get_mut(&key).expect("present").ttl = Some(remaining - elapsed);
            }
        }
    }
}

/// The whole keyspace: numbered databases created lazily on first touch,
/// the logical clock, the seedable RNG, and the script cache.
#[derive(Debug, Default)]
pub struct DataStore {
    dbs: HashMap<usize, Database>,
    /// Database targeted by the direct accessors.
    selected: usize,
    /// Logical "now" for EXPIREAT conversions. Wall clock when unset.
    now: Option<SystemTime>,
    rng: Option<StdRng>,
    /// SHA1 hex digest → script source, filled by SCRIPT LOAD.
    pub scripts: HashMap<String, String>,
}

impl DataStore {
    pub fn new() -> Self {
        DataStore::default()
    }

    pub fn db(&mut self, index: usize) -> &mut Database {
        debug_assert!(index < NUM_DATABASES, "database index out of range");
        self.dbs
            .entry(index)
            .or_insert_with(|| Database::new(index))
    }

    pub fn db_if_exists(&self, index: usize) -> Option<&Database> {
        self.dbs.get(&index)
    }

    /// Current version of a key, 0 for untouched keys and databases.
    pub fn key_version(&self, db: usize, key: &str) -> u64 {
        self.dbs.get(&db).map_or(0, |d| d.key_version(key))
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn select(&mut self, index: usize) {
        self.selected = index;
    }

    /// Swap two databases by id. The id labels swap with the contents.
    pub fn swap_dbs(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let mut db_a = self.dbs.remove(&a).unwrap_or_else(|| Database::new(a));
        let mut db_b = self.dbs.remove(&b).unwrap_or_else(|| Database::new(b));
        db_a.id = b;
        db_b.id = a;
        self.dbs.insert(b, db_a);
        self.dbs.insert(a, db_b);
    }

    /// Advance the logical clock: shrink all TTLs everywhere, expiring keys
    /// whose TTL runs out.
    pub fn fast_forward(&mut self, elapsed: Duration) {
        for db in self.dbs.values_mut() {
            db.fast_forward(elapsed);
        }
    }

    pub fn set_time(&mut self, now: SystemTime) {
        self.now = Some(now);
    }

    /// Convert an absolute unix timestamp (milliseconds) into a TTL against
    /// the logical clock. A timestamp at or before "now" yields zero, which
    /// deletes on application.
    pub fn ttl_until_ms(&self, unix_ms: i64) -> Duration {
        let now = self.now.unwrap_or_else(SystemTime::now);
        let now_ms = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        if unix_ms <= now_ms {
            Duration::ZERO
        } else {
            Duration::from_millis((unix_ms - now_ms) as u64)
        }
    }

    /// Fix the RNG so randomised commands become reproducible.
    pub fn seed(&mut self, seed: u64) {
        self.rng = Some(StdRng::seed_from_u64(seed));
    }

    /// Random index below `n`, drawn from the seeded RNG when set.
    pub fn rand_index(&mut self, n: usize) -> usize {
        assert!(n > 0);
        match &mut self.rng {
            Some(rng) => rng.gen_range(0..n),
            None => rand::thread_rng().gen_range(0..n),
        }
    }

    /// In-place Fisher–Yates shuffle through the server RNG.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.rand_index(i + 1);
            items.swap(i, j);
        }
    }
}

pub type SharedStore = Arc<RwLock<DataStore>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn string_entry(s: &str) -> Value {
        Value::Str(s.as_bytes().to_vec())
    }

    #[test]
    fn versions_bump_on_every_mutation() {
        let mut db = Database::new(0);
        assert_eq!(db.key_version("k"), 0);
        db.set_value("k", string_entry("a"));
        assert_eq!(db.key_version("k"), 1);
        db.set_value("k", string_entry("b"));
        assert_eq!(db.key_version("k"), 2);
        db.set_ttl("k", Duration::from_secs(5));
        assert_eq!(db.key_version("k"), 3);
        db.del("k");
        assert_eq!(db.key_version("k"), 4);
        // Version survives deletion.
        assert!(!db.contains("k"));
        assert_eq!(db.key_version("k"), 4);
    }

    #[test]
    fn set_value_clears_ttl() {
        let mut db = Database::new(0);
        db.set_value("k", string_entry("a"));
        db.set_ttl("k", Duration::from_secs(10));
        db.set_value("k", string_entry("b"));
        assert_eq!(db.ttl("k"), None);
    }

    #[test]
    fn zero_ttl_deletes_immediately() {
        let mut db = Database::new(0);
        db.set_value("k", string_entry("a"));
        assert!(db.set_ttl("k", Duration::ZERO));
        assert!(!db.contains("k"));
    }

    #[test]
    fn fast_forward_expires_keys() {
        let mut store = DataStore::new();
        store.db(0).set_value("gone", string_entry("a"));
        store.db(0).set_ttl("gone", Duration::from_secs(10));
        store.db(0).set_value("kept", string_entry("b"));
        store.db(0).set_ttl("kept", Duration::from_secs(100));
        store.db(0).set_value("forever", string_entry("c"));

        let v_before = store.key_version(0, "gone");
        store.fast_forward(Duration::from_secs(11));

        assert!(!store.db(0).contains("gone"));
        assert!(store.key_version(0, "gone") > v_before);
        assert_eq!(store.db(0).ttl("kept"), Some(Duration::from_secs(89)));
        assert!(store.db(0).contains("forever"));
    }

    #[test]
    fn flush_bumps_versions() {
        let mut db = Database::new(0);
        db.set_value("a", string_entry("1"));
        db.set_value("b", string_entry("2"));
        let va = db.key_version("a");
        db.flush();
        assert!(db.is_empty());
        assert_eq!(db.key_version("a"), va + 1);
    }

    #[test]
    fn rename_preserves_ttl() {
        let mut db = Database::new(0);
        db.set_value("old", string_entry("v"));
        db.set_ttl("old", Duration::from_secs(42));
        assert!(db.rename("old", "new"));
        assert!(!db.contains("old"));
        assert_eq!(db.ttl("new"), Some(Duration::from_secs(42)));
    }

    #[test]
    fn databases_are_created_lazily() {
        let mut store = DataStore::new();
        assert!(store.db_if_exists(3).is_none());
        store.db(3).set_value("k", string_entry("v"));
        assert_eq!(store.db_if_exists(3).map(|d| d.id()), Some(3));
        assert!(store.db_if_exists(2).is_none());
    }

    #[test]
    fn swap_dbs_moves_contents_and_labels() {
        let mut store = DataStore::new();
        store.db(0).set_value("here", string_entry("v"));
        store.swap_dbs(0, 5);
        assert!(!store.db(0).contains("here"));
        assert!(store.db(5).contains("here"));
        assert_eq!(store.db(5).id(), 5);
        assert_eq!(store.db(0).id(), 0);
    }

    #[test]
    fn scan_pages_through_sorted_keys() {
        let mut db = Database::new(0);
        for k in ["a", "b", "c", "d", "e"] {
            db.set_value(k, string_entry("v"));
        }
        let (cursor, first) = db.scan(0, None, 2);
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(cursor, 2);
        let (cursor, second) = db.scan(cursor, None, 2);
        assert_eq!(second, vec!["c", "d"]);
        let (cursor, last) = db.scan(cursor, None, 2);
        assert_eq!(last, vec!["e"]);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn seeded_rng_is_deterministic() {
        let mut a = DataStore::new();
        let mut b = DataStore::new();
        a.seed(7);
        b.seed(7);
        let draws_a: Vec<usize> = (0..10).map(|_| a.rand_index(100)).collect();
        let draws_b: Vec<usize> = (0..10).map(|_| b.rand_index(100)).collect();
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn expireat_conversion_uses_logical_clock() {
        let mut store = DataStore::new();
        store.set_time(UNIX_EPOCH + Duration::from_secs(1_000));
        assert_eq!(
            store.ttl_until_ms(1_010_000),
            Duration::from_secs(10)
        );
        assert_eq!(store.ttl_until_ms(999_000), Duration::ZERO);
    }
}
