use crate::commands::{self, CommandGate, CommandRegistry};
use crate::config::{Config, NUM_DATABASES};
use crate::keywatcher::KeyWatcher;
use crate::pubsub::{PubSubRegistry, Subscriber};
use crate::server::{Server, ServerError, Shared};
use crate::store::{DataStore, Database, StoreError};
use crate::types::{format_score, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};

/// An in-process Redis server for tests.
///
/// Start one with [`FauxRedis::run`], point a real Redis client at
/// [`addr`](FauxRedis::addr), and inspect or seed the keyspace directly
/// through the typed accessors. Expiry is driven by a logical clock
/// ([`fast_forward`](FauxRedis::fast_forward)), randomised commands by a
/// seedable RNG ([`seed`](FauxRedis::seed)), so tests stay deterministic.
pub struct FauxRedis {
    shared: Shared,
    registry: Arc<CommandRegistry>,
    server: Mutex<Option<Arc<Server>>>,
    addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl FauxRedis {
    fn new() -> Result<Self, ServerError> {
        let registry = Arc::new(CommandRegistry::new());
        commands::register_all(registry.as_ref())?;
        Ok(FauxRedis {
            shared: Shared {
                store: Arc::new(RwLock::new(DataStore::new())),
                config: Arc::new(RwLock::new(Config::default())),
                pubsub: Arc::new(RwLock::new(PubSubRegistry::new())),
                watcher: Arc::new(RwLock::new(KeyWatcher::new())),
                lock: Arc::new(Mutex::new(())),
            },
            registry,
            server: Mutex::new(None),
            addr: std::sync::Mutex::new(None),
        })
    }

    /// Create and start a server on an ephemeral localhost port.
    pub async fn run() -> Result<FauxRedis, ServerError> {
        let instance = FauxRedis::new()?;
        instance.start_addr("127.0.0.1:0").await?;
        Ok(instance)
    }

    /// Start on a specific address (`host:port`; port 0 picks one). A
    /// listener that is already running is shut down first.
    pub async fn start_addr(&self, addr: &str) -> Result<(), ServerError> {
        let mut slot = self.server.lock().await;
        if let Some(old) = slot.take() {
            old.close().await;
        }
        let server = Server::start(addr, self.shared.clone(), self.registry.clone()).await?;
        *self.addr.lock().expect("addr lock poisoned") = Some(server.addr());
        *slot = Some(server);
        Ok(())
    }

    /// Graceful shutdown: stop accepting, drop every client, wait for the
    /// workers. Safe to call repeatedly. The keyspace survives.
    pub async fn close(&self) {
        let slot = self.server.lock().await;
        if let Some(server) = slot.as_ref() {
            server.close().await;
        }
    }

    /// Bind again on the same port after a close. All data is preserved.
    pub async fn restart(&self) -> Result<(), ServerError> {
        let addr = self
            .addr
            .lock()
            .expect("addr lock poisoned")
            .expect("restart before first start");
        self.start_addr(&addr.to_string()).await
    }

    /// Require clients to AUTH with this password. An empty string disables
    /// authentication again.
    pub async fn require_auth(&self, password: &str) {
        let mut config = self.shared.config.write().await;
        config.requirepass = if password.is_empty() {
            None
        } else {
            Some(password.to_string())
        };
    }

    /// The listener address, e.g. `127.0.0.1:38421`.
    pub fn addr(&self) -> SocketAddr {
        self.addr
            .lock()
            .expect("addr lock poisoned")
            .expect("server was never started")
    }

    pub fn host(&self) -> String {
        self.addr().ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// An in-process client pipe, served exactly like an accepted socket.
    pub async fn pipe(&self) -> tokio::io::DuplexStream {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let slot = self.server.lock().await;
        slot.as_ref()
            .expect("server was never started")
            .serve_stream(server_end);
        client_end
    }

    /// A handle bound to one numbered database (created lazily).
    pub fn db(&self, index: usize) -> DbHandle {
        assert!(index < NUM_DATABASES, "database index out of range");
        DbHandle {
            shared: self.shared.clone(),
            index,
        }
    }

    /// Switch the database targeted by the direct accessors.
    pub async fn select(&self, index: usize) {
        assert!(index < NUM_DATABASES, "database index out of range");
        let _gate = self.gate().await;
        self.shared.store.write().await.select(index);
    }

    /// Swap two databases, contents and id labels, atomically.
    pub async fn swap_db(&self, a: usize, b: usize) {
        assert!(a < NUM_DATABASES && b < NUM_DATABASES, "database index out of range");
        let _gate = self.gate().await;
        self.shared.store.write().await.swap_dbs(a, b);
    }

    /// Shrink every TTL in every database; keys whose TTL runs out expire.
    pub async fn fast_forward(&self, elapsed: Duration) {
        let _gate = self.gate().await;
        self.shared.store.write().await.fast_forward(elapsed);
    }

    /// Pin the logical clock used for EXPIREAT conversions.
    pub async fn set_time(&self, now: SystemTime) {
        let _gate = self.gate().await;
        self.shared.store.write().await.set_time(now);
    }

    /// Seed the RNG behind RANDOMKEY, SRANDMEMBER, SPOP.
    pub async fn seed(&self, seed: u64) {
        let _gate = self.gate().await;
        self.shared.store.write().await.seed(seed);
    }

    /// A standalone pub/sub observer, independent of any connection.
    pub async fn new_subscriber(&self) -> Subscriber {
        let _gate = self.gate().await;
        Subscriber::register(self.shared.pubsub.clone()).await
    }

    /// Commands dispatched since the last (re)start.
    pub async fn command_count(&self) -> u64 {
        self.with_server(Server::total_commands).await
    }

    /// Currently connected clients.
    pub async fn current_connection_count(&self) -> u64 {
        self.with_server(Server::clients_len).await
    }

    /// Connections accepted since the last (re)start.
    pub async fn total_connection_count(&self) -> u64 {
        self.with_server(Server::total_connections).await
    }

    /// Human-readable snapshot of the selected database. Long values are
    /// truncated with a suffix carrying the original length.
    pub async fn dump(&self) -> String {
        let _gate = self.gate().await;
        let mut store = self.shared.store.write().await;
        let index = store.selected();
        render_db(store.db(index))
    }

    async fn with_server(&self, f: impl Fn(&Server) -> u64) -> u64 {
        let slot = self.server.lock().await;
        slot.as_ref().map(|s| f(s)).unwrap_or(0)
    }

    async fn gate(&self) -> CommandGate {
        CommandGate::acquire(self.shared.lock.clone()).await
    }

    async fn selected(&self) -> DbHandle {
        let index = self.shared.store.read().await.selected();
        DbHandle {
            shared: self.shared.clone(),
            index,
        }
    }

    // -- direct accessors against the selected database --

    pub async fn set(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<(), StoreError> {
        self.selected().await.set(key, value).await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.selected().await.get(key).await
    }

    pub async fn del(&self, key: &str) -> bool {
        self.selected().await.del(key).await
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.selected().await.exists(key).await
    }

    pub async fn type_of(&self, key: &str) -> Option<&'static str> {
        self.selected().await.type_of(key).await
    }

    pub async fn keys(&self) -> Vec<String> {
        self.selected().await.keys().await
    }

    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        self.selected().await.ttl(key).await
    }

    pub async fn set_ttl(&self, key: &str, ttl: Duration) -> bool {
        self.selected().await.set_ttl(key, ttl).await
    }

    pub async fn persist(&self, key: &str) -> bool {
        self.selected().await.persist(key).await
    }

    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.selected().await.incr(key, delta).await
    }

    pub async fn hset(
        &self,
        key: &str,
        field: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), StoreError> {
        self.selected().await.hset(key, field, value).await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.selected().await.hget(key, field).await
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        self.selected().await.hgetall(key).await
    }

    pub async fn lpush(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<usize, StoreError> {
        self.selected().await.lpush(key, value).await
    }

    pub async fn rpush(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<usize, StoreError> {
        self.selected().await.rpush(key, value).await
    }

    pub async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.selected().await.lpop(key).await
    }

    pub async fn list(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.selected().await.list(key).await
    }

    pub async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        self.selected().await.lrange(key, start, stop).await
    }

    pub async fn sadd<I, M>(&self, key: &str, members: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = M>,
        M: Into<Vec<u8>>,
    {
        self.selected().await.sadd(key, members).await
    }

    pub async fn srem(&self, key: &str, member: impl Into<Vec<u8>>) -> Result<bool, StoreError> {
        self.selected().await.srem(key, member).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.selected().await.smembers(key).await
    }

    pub async fn is_member(
        &self,
        key: &str,
        member: impl Into<Vec<u8>>,
    ) -> Result<bool, StoreError> {
        self.selected().await.is_member(key, member).await
    }

    pub async fn zadd(
        &self,
        key: &str,
        score: f64,
        member: impl Into<Vec<u8>>,
    ) -> Result<bool, StoreError> {
        self.selected().await.zadd(key, score, member).await
    }

    pub async fn zscore(
        &self,
        key: &str,
        member: impl Into<Vec<u8>>,
    ) -> Result<Option<f64>, StoreError> {
        self.selected().await.zscore(key, member).await
    }

    pub async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        self.selected().await.zrange(key, start, stop).await
    }

    pub async fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(Vec<u8>, f64)>, StoreError> {
        self.selected().await.zrange_with_scores(key, start, stop).await
    }
}

/// Direct access to one numbered database. Every call takes the command
/// gate, so it serialises with wire commands exactly like another client.
#[derive(Clone)]
pub struct DbHandle {
    shared: Shared,
    index: usize,
}

impl DbHandle {
    async fn with_db<R>(&self, f: impl FnOnce(&mut Database) -> R) -> R {
        let _gate = CommandGate::acquire(self.shared.lock.clone()).await;
        let mut store = self.shared.store.write().await;
        f(store.db(self.index))
    }

    pub async fn set(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<(), StoreError> {
        let value = value.into();
        self.with_db(|db| {
            if matches!(db.get(key), Some(e) if e.value.as_str().is_none()) {
                return Err(StoreError::WrongType);
            }
            db.set_value(key, Value::Str(value));
            Ok(())
        })
        .await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.with_db(|db| match db.get(key) {
            Some(entry) => entry
                .value
                .as_str()
                .cloned()
                .ok_or(StoreError::WrongType),
            None => Err(StoreError::NotFound),
        })
        .await
    }

    pub async fn del(&self, key: &str) -> bool {
        self.with_db(|db| db.del(key)).await
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.with_db(|db| db.contains(key)).await
    }

    pub async fn type_of(&self, key: &str) -> Option<&'static str> {
        self.with_db(|db| db.type_of(key)).await
    }

    pub async fn keys(&self) -> Vec<String> {
        self.with_db(|db| db.all_keys()).await
    }

    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        self.with_db(|db| db.ttl(key)).await
    }

    pub async fn set_ttl(&self, key: &str, ttl: Duration) -> bool {
        self.with_db(|db| db.set_ttl(key, ttl)).await
    }

    pub async fn persist(&self, key: &str) -> bool {
        self.with_db(|db| db.persist(key)).await
    }

    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.with_db(|db| {
            let entry = db.get_or_create(key, || Value::Str(b"0".to_vec()));
            let s = entry.value.as_str_mut().ok_or(StoreError::WrongType)?;
            let current: i64 = std::str::from_utf8(s)
                .ok()
                .and_then(|v| v.parse().ok())
                .ok_or(StoreError::WrongType)?;
            let next = current.saturating_add(delta);
            *s = next.to_string().into_bytes();
            db.bump(key);
            Ok(next)
        })
        .await
    }

    pub async fn hset(
        &self,
        key: &str,
        field: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), StoreError> {
        let value = value.into();
        self.with_db(|db| {
            let entry = db.get_or_create(key, || Value::Hash(HashMap::new()));
            let hash = entry.value.as_hash_mut().ok_or(StoreError::WrongType)?;
            hash.insert(field.to_string(), value);
            db.bump(key);
            Ok(())
        })
        .await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_db(|db| match db.get(key) {
            Some(entry) => {
                let hash = entry.value.as_hash().ok_or(StoreError::WrongType)?;
                Ok(hash.get(field).cloned())
            }
            None => Ok(None),
        })
        .await
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        self.with_db(|db| match db.get(key) {
            Some(entry) => entry.value.as_hash().cloned().ok_or(StoreError::WrongType),
            None => Ok(HashMap::new()),
        })
        .await
    }

    pub async fn lpush(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<usize, StoreError> {
        let value = value.into();
        let (len, db_index) = self
            .with_db(|db| {
                let entry = db.get_or_create(key, || Value::List(Default::default()));
                let list = entry.value.as_list_mut().ok_or(StoreError::WrongType)?;
                list.push_front(value);
                let len = list.len();
                db.bump(key);
                Ok::<_, StoreError>((len, db.id()))
            })
            .await?;
        self.shared.watcher.write().await.notify(db_index, key);
        Ok(len)
    }

    pub async fn rpush(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<usize, StoreError> {
        let value = value.into();
        let (len, db_index) = self
            .with_db(|db| {
                let entry = db.get_or_create(key, || Value::List(Default::default()));
                let list = entry.value.as_list_mut().ok_or(StoreError::WrongType)?;
                list.push_back(value);
                let len = list.len();
                db.bump(key);
                Ok::<_, StoreError>((len, db.id()))
            })
            .await?;
        self.shared.watcher.write().await.notify(db_index, key);
        Ok(len)
    }

    pub async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_db(|db| {
            let Some(entry) = db.get_mut(key) else {
                return Ok(None);
            };
            let list = entry.value.as_list_mut().ok_or(StoreError::WrongType)?;
            let value = list.pop_front();
            let emptied = list.is_empty();
            if value.is_some() {
                db.bump(key);
            }
            if emptied {
                db.del(key);
            }
            Ok(value)
        })
        .await
    }

    pub async fn list(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_db(|db| match db.get(key) {
            Some(entry) => entry
                .value
                .as_list()
                .map(|l| l.iter().cloned().collect())
                .ok_or(StoreError::WrongType),
            None => Ok(Vec::new()),
        })
        .await
    }

    pub async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let items = self.list(key).await?;
        let len = items.len() as i64;
        let clamp = |i: i64| if i < 0 { (len + i).max(0) } else { i };
        let start = clamp(start);
        let stop = clamp(stop).min(len - 1);
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(items[start as usize..=stop as usize].to_vec())
    }

    pub async fn sadd<I, M>(&self, key: &str, members: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = M>,
        M: Into<Vec<u8>>,
    {
        let members: Vec<Vec<u8>> = members.into_iter().map(Into::into).collect();
        self.with_db(|db| {
            let entry = db.get_or_create(key, || Value::Set(Default::default()));
            let set = entry.value.as_set_mut().ok_or(StoreError::WrongType)?;
            let added = members.into_iter().filter(|m| set.insert(m.clone())).count();
            db.bump(key);
            Ok(added)
        })
        .await
    }

    pub async fn srem(&self, key: &str, member: impl Into<Vec<u8>>) -> Result<bool, StoreError> {
        let member = member.into();
        self.with_db(|db| {
            let Some(entry) = db.get_mut(key) else {
                return Ok(false);
            };
            let set = entry.value.as_set_mut().ok_or(StoreError::WrongType)?;
            let removed = set.remove(member.as_slice());
            let emptied = set.is_empty();
            if removed {
                db.bump(key);
            }
            if emptied {
                db.del(key);
            }
            Ok(removed)
        })
        .await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_db(|db| match db.get(key) {
            Some(entry) => {
                let set = entry.value.as_set().ok_or(StoreError::WrongType)?;
                let mut members: Vec<Vec<u8>> = set.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            None => Ok(Vec::new()),
        })
        .await
    }

    pub async fn is_member(
        &self,
        key: &str,
        member: impl Into<Vec<u8>>,
    ) -> Result<bool, StoreError> {
        let member = member.into();
        self.with_db(|db| match db.get(key) {
            Some(entry) => {
                let set = entry.value.as_set().ok_or(StoreError::WrongType)?;
                Ok(set.contains(member.as_slice()))
            }
            None => Ok(false),
        })
        .await
    }

    /// Returns true when the member is new to the sorted set.
    pub async fn zadd(
        &self,
        key: &str,
        score: f64,
        member: impl Into<Vec<u8>>,
    ) -> Result<bool, StoreError> {
        let member = member.into();
        self.with_db(|db| {
            let entry = db.get_or_create(key, || Value::SortedSet(Default::default()));
            let zset = entry.value.as_sorted_set_mut().ok_or(StoreError::WrongType)?;
            let added = zset.insert(member, score);
            db.bump(key);
            Ok(added)
        })
        .await
    }

    pub async fn zscore(
        &self,
        key: &str,
        member: impl Into<Vec<u8>>,
    ) -> Result<Option<f64>, StoreError> {
        let member = member.into();
        self.with_db(|db| match db.get(key) {
            Some(entry) => {
                let zset = entry.value.as_sorted_set().ok_or(StoreError::WrongType)?;
                Ok(zset.score(&member))
            }
            None => Ok(None),
        })
        .await
    }

    pub async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self
            .zrange_with_scores(key, start, stop)
            .await?
            .into_iter()
            .map(|(m, _)| m)
            .collect())
    }

    pub async fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(Vec<u8>, f64)>, StoreError> {
        self.with_db(|db| match db.get(key) {
            Some(entry) => {
                let zset = entry.value.as_sorted_set().ok_or(StoreError::WrongType)?;
                Ok(zset.range_by_rank(start, stop, false))
            }
            None => Ok(Vec::new()),
        })
        .await
    }
}

/// The `dump` text format: one block per key, values quoted and truncated.
fn render_db(db: &mut Database) -> String {
    const INDENT: &str = "   ";
    let mut out = String::new();
    for key in db.all_keys() {
        out.push_str(&format!("- {key}\n"));
        let Some(entry) = db.get(&key) else {
            continue;
        };
        match &entry.value {
            Value::Str(s) => {
                out.push_str(&format!("{INDENT}{}\n", fmt_value(s)));
            }
            Value::Hash(h) => {
                let mut fields: Vec<&String> = h.keys().collect();
                fields.sort();
                for field in fields {
                    out.push_str(&format!("{INDENT}{field}: {}\n", fmt_value(&h[field])));
                }
            }
            Value::List(l) => {
                for item in l {
                    out.push_str(&format!("{INDENT}{}\n", fmt_value(item)));
                }
            }
            Value::Set(s) => {
                let mut members: Vec<&Vec<u8>> = s.iter().collect();
                members.sort();
                for member in members {
                    out.push_str(&format!("{INDENT}{}\n", fmt_value(member)));
                }
            }
            Value::SortedSet(z) => {
                for (member, score) in z.iter() {
                    out.push_str(&format!(
                        "{INDENT}{}: {}\n",
                        format_score(score),
                        fmt_value(member)
                    ));
                }
            }
        }
    }
    out
}

/// Quote a value, truncating past 60 characters with a `...(n)` suffix
/// carrying the original length.
fn fmt_value(raw: &[u8]) -> String {
    const MAX: usize = 60;
    let s = String::from_utf8_lossy(raw);
    if s.chars().count() <= MAX {
        return format!("{s:?}");
    }
    let suffix = format!("...({})", raw.len());
    let keep = MAX.saturating_sub(suffix.len());
    let head: String = s.chars().take(keep).collect();
    format!("{head:?}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmt_value_quotes_and_truncates() {
        assert_eq!(fmt_value(b"short"), "\"short\"");
        let long = "x".repeat(80);
        let rendered = fmt_value(long.as_bytes());
        assert!(rendered.ends_with("...(80)"));
        assert!(rendered.starts_with('"'));
    }
}
