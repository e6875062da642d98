use crate::resp::Request;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A key watched by a transaction: (database id, key, version seen at WATCH
/// time). EXEC aborts if any watched key's current version differs.
pub type WatchedKey = (usize, String, u64);

/// Per-client connection state. Owned by the connection's worker task; command
/// handlers receive it as an exclusive borrow.
#[derive(Debug)]
pub struct ClientState {
    pub id: u64,
    pub db_index: usize,
    pub authenticated: bool,
    /// Deferred close: set by QUIT (and friends); the worker tears the
    /// connection down only after the current reply has been written.
    pub should_close: bool,

    // Transaction state
    pub in_multi: bool,
    pub in_exec: bool,
    pub multi_queue: Vec<(String, Request)>,
    pub multi_error: bool,
    pub watched_keys: Vec<WatchedKey>,

    /// Registry id of this client's subscriber entry, if it has entered
    /// subscriber mode.
    pub subscriber_id: Option<u64>,
    /// Number of active channel + pattern subscriptions.
    pub subscriptions: usize,
}

impl ClientState {
    pub fn new() -> Self {
        ClientState {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            db_index: 0,
            authenticated: false,
            should_close: false,
            in_multi: false,
            in_exec: false,
            multi_queue: Vec::new(),
            multi_error: false,
            watched_keys: Vec::new(),
            subscriber_id: None,
            subscriptions: 0,
        }
    }

    /// Once a client has at least one subscription it may only issue the
    /// pub/sub command subset.
    pub fn in_subscribe_mode(&self) -> bool {
        self.subscriptions > 0
    }

    /// Drop all transaction state (after EXEC/DISCARD or an aborted watch).
    pub fn clear_transaction(&mut self) {
        self.in_multi = false;
        self.multi_queue.clear();
        self.multi_error = false;
        self.watched_keys.clear();
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}
