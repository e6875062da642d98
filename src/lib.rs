//! # fauxredis
//!
//! An in-process Redis test double, written for use in Rust test suites.
//!
//! `fauxredis` speaks RESP over real TCP (or in-process pipes), implements
//! the core data structures (strings, hashes, lists, sets, sorted sets) with
//! key expiration, multiple databases, transactions with WATCH, and pub/sub.
//! It also exposes the keyspace directly to the embedding test: typed
//! accessors, deterministic expiry via a logical clock, a seedable RNG, and
//! standalone pub/sub observers.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let server = fauxredis::FauxRedis::run().await?;
//! server.set("greeting", "hello").await?;
//! // point any Redis client at server.addr() ...
//! assert_eq!(server.get("greeting").await?, b"hello");
//! server.close().await;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod config;
pub mod connection;
pub mod glob;
pub mod instance;
pub mod keywatcher;
pub mod pubsub;
pub mod resp;
pub mod server;
pub mod store;
pub mod types;

pub use instance::{DbHandle, FauxRedis};
pub use pubsub::{PushMessage, Subscriber};
pub use server::ServerError;
pub use store::StoreError;
