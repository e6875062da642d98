//! Tests for the embedding surface: direct accessors, time travel, seeded
//! randomness, restart, counters, and frame-exact wire scenarios over raw
//! TCP.

use fauxredis::FauxRedis;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Encode a command as an array of bulk strings.
fn frame(parts: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(format!("${}\r\n{part}\r\n", part.len()).as_bytes());
    }
    out
}

async fn send(stream: &mut TcpStream, parts: &[&str]) {
    stream.write_all(&frame(parts)).await.unwrap();
}

/// Read exactly the expected bytes and assert they match.
async fn expect(stream: &mut TcpStream, expected: &str) {
    let mut buf = vec![0u8; expected.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(
        String::from_utf8_lossy(&buf),
        expected,
        "unexpected wire bytes"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn basic_string_scenario_frame_exact() {
    let server = FauxRedis::run().await.unwrap();
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();

    send(&mut conn, &["SET", "foo", "bar"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["GET", "foo"]).await;
    expect(&mut conn, "$3\r\nbar\r\n").await;
    send(&mut conn, &["GET", "mis"]).await;
    expect(&mut conn, "$-1\r\n").await;

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_gate_scenario() {
    let server = FauxRedis::run().await.unwrap();
    server.require_auth("s3cr").await;
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();

    send(&mut conn, &["PING"]).await;
    expect(&mut conn, "-NOAUTH Authentication required.\r\n").await;
    send(&mut conn, &["AUTH", "wrong"]).await;
    expect(&mut conn, "-ERR invalid password\r\n").await;
    send(&mut conn, &["AUTH", "s3cr"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["PING"]).await;
    expect(&mut conn, "+PONG\r\n").await;

    // Disabling auth opens the door for fresh connections.
    server.require_auth("").await;
    let mut other = TcpStream::connect(server.addr()).await.unwrap();
    send(&mut other, &["PING"]).await;
    expect(&mut other, "+PONG\r\n").await;

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn quit_flushes_reply_before_close() {
    let server = FauxRedis::run().await.unwrap();
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();

    send(&mut conn, &["QUIT"]).await;
    expect(&mut conn, "+OK\r\n").await;

    // Then a clean EOF, not a reset mid-reply.
    let mut rest = Vec::new();
    let n = conn.read_to_end(&mut rest).await.unwrap();
    assert_eq!(n, 0);

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_aborts_exec_when_key_changes() {
    let server = FauxRedis::run().await.unwrap();
    let mut alice = TcpStream::connect(server.addr()).await.unwrap();
    let mut bob = TcpStream::connect(server.addr()).await.unwrap();

    send(&mut alice, &["WATCH", "k"]).await;
    expect(&mut alice, "+OK\r\n").await;
    send(&mut alice, &["MULTI"]).await;
    expect(&mut alice, "+OK\r\n").await;
    send(&mut alice, &["SET", "k", "1"]).await;
    expect(&mut alice, "+QUEUED\r\n").await;

    // Bob races in and touches the watched key.
    send(&mut bob, &["SET", "k", "2"]).await;
    expect(&mut bob, "+OK\r\n").await;

    send(&mut alice, &["EXEC"]).await;
    expect(&mut alice, "*-1\r\n").await;
    send(&mut alice, &["GET", "k"]).await;
    expect(&mut alice, "$1\r\n2\r\n").await;

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_succeeds_when_watched_key_unchanged() {
    let server = FauxRedis::run().await.unwrap();
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();

    send(&mut conn, &["WATCH", "k"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["MULTI"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["SET", "k", "1"]).await;
    expect(&mut conn, "+QUEUED\r\n").await;
    send(&mut conn, &["SET", "k", "2"]).await;
    expect(&mut conn, "+QUEUED\r\n").await;
    send(&mut conn, &["EXEC"]).await;
    expect(&mut conn, "*2\r\n+OK\r\n+OK\r\n").await;
    send(&mut conn, &["GET", "k"]).await;
    expect(&mut conn, "$1\r\n2\r\n").await;

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_time_errors_abort_exec() {
    let server = FauxRedis::run().await.unwrap();
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();

    send(&mut conn, &["MULTI"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["NOSUCH", "x"]).await;
    expect(
        &mut conn,
        "-ERR unknown command `NOSUCH`, with args beginning with: `x`, \r\n",
    )
    .await;
    // Arity errors poison the transaction too.
    send(&mut conn, &["GET"]).await;
    expect(
        &mut conn,
        "-ERR wrong number of arguments for 'get' command\r\n",
    )
    .await;
    send(&mut conn, &["SET", "k", "1"]).await;
    expect(&mut conn, "+QUEUED\r\n").await;
    send(&mut conn, &["EXEC"]).await;
    expect(
        &mut conn,
        "-EXECABORT Transaction discarded because of previous errors.\r\n",
    )
    .await;
    send(&mut conn, &["GET", "k"]).await;
    expect(&mut conn, "$-1\r\n").await;

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn discard_and_nested_multi() {
    let server = FauxRedis::run().await.unwrap();
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();

    send(&mut conn, &["MULTI"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["MULTI"]).await;
    expect(&mut conn, "-ERR MULTI calls can not be nested\r\n").await;
    send(&mut conn, &["WATCH", "k"]).await;
    expect(&mut conn, "-ERR WATCH inside MULTI is not allowed\r\n").await;
    send(&mut conn, &["SET", "k", "1"]).await;
    expect(&mut conn, "+QUEUED\r\n").await;
    send(&mut conn, &["DISCARD"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["GET", "k"]).await;
    expect(&mut conn, "$-1\r\n").await;
    send(&mut conn, &["EXEC"]).await;
    expect(&mut conn, "-ERR EXEC without MULTI\r\n").await;

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn subscriber_mode_restricts_commands() {
    let server = FauxRedis::run().await.unwrap();
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();

    send(&mut conn, &["SUBSCRIBE", "chan"]).await;
    expect(&mut conn, "*3\r\n$9\r\nsubscribe\r\n$4\r\nchan\r\n:1\r\n").await;
    send(&mut conn, &["GET", "x"]).await;
    expect(
        &mut conn,
        "-ERR only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT allowed in this context\r\n",
    )
    .await;
    send(&mut conn, &["PING"]).await;
    expect(&mut conn, "+PONG\r\n").await;
    send(&mut conn, &["UNSUBSCRIBE", "chan"]).await;
    expect(&mut conn, "*3\r\n$11\r\nunsubscribe\r\n$4\r\nchan\r\n:0\r\n").await;
    // Out of subscriber mode again.
    send(&mut conn, &["GET", "x"]).await;
    expect(&mut conn, "$-1\r\n").await;

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn expiry_with_fast_forward() {
    let server = FauxRedis::run().await.unwrap();
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();

    send(&mut conn, &["SET", "k", "v"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["EXPIRE", "k", "10"]).await;
    expect(&mut conn, ":1\r\n").await;
    send(&mut conn, &["TTL", "k"]).await;
    expect(&mut conn, ":10\r\n").await;

    server.fast_forward(Duration::from_secs(11)).await;

    send(&mut conn, &["GET", "k"]).await;
    expect(&mut conn, "$-1\r\n").await;
    send(&mut conn, &["EXISTS", "k"]).await;
    expect(&mut conn, ":0\r\n").await;

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn expireat_against_logical_clock() {
    let server = FauxRedis::run().await.unwrap();
    server
        .set_time(UNIX_EPOCH + Duration::from_secs(1_000))
        .await;
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();

    send(&mut conn, &["SET", "k", "v"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["EXPIREAT", "k", "1010"]).await;
    expect(&mut conn, ":1\r\n").await;
    send(&mut conn, &["TTL", "k"]).await;
    expect(&mut conn, ":10\r\n").await;

    // A timestamp in the logical past deletes immediately.
    send(&mut conn, &["SET", "gone", "v"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["EXPIREAT", "gone", "900"]).await;
    expect(&mut conn, ":1\r\n").await;
    send(&mut conn, &["EXISTS", "gone"]).await;
    expect(&mut conn, ":0\r\n").await;

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn persist_and_ttl_preservation() {
    let server = FauxRedis::run().await.unwrap();
    server.set("k", "v").await.unwrap();
    assert!(server.set_ttl("k", Duration::from_secs(60)).await);

    // In-place composite-style mutation keeps the TTL.
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();
    send(&mut conn, &["APPEND", "k", "x"]).await;
    expect(&mut conn, ":2\r\n").await;
    assert_eq!(server.ttl("k").await, Some(Duration::from_secs(60)));

    assert!(server.persist("k").await);
    assert_eq!(server.ttl("k").await, None);

    // A fresh SET also drops any TTL.
    assert!(server.set_ttl("k", Duration::from_secs(60)).await);
    send(&mut conn, &["SET", "k", "new"]).await;
    expect(&mut conn, "+OK\r\n").await;
    assert_eq!(server.ttl("k").await, None);

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_accessors_roundtrip() {
    let server = FauxRedis::run().await.unwrap();

    server.set("s", "v").await.unwrap();
    assert_eq!(server.get("s").await.unwrap(), b"v");
    assert_eq!(server.type_of("s").await, Some("string"));
    assert!(server.exists("s").await);

    server.hset("h", "f", "1").await.unwrap();
    assert_eq!(server.hget("h", "f").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(server.hgetall("h").await.unwrap().len(), 1);

    server.rpush("l", "a").await.unwrap();
    server.rpush("l", "b").await.unwrap();
    server.lpush("l", "z").await.unwrap();
    assert_eq!(
        server.list("l").await.unwrap(),
        vec![b"z".to_vec(), b"a".to_vec(), b"b".to_vec()]
    );
    assert_eq!(server.lrange("l", 1, -1).await.unwrap().len(), 2);
    assert_eq!(server.lpop("l").await.unwrap(), Some(b"z".to_vec()));

    server.sadd("set", ["a", "b", "c"]).await.unwrap();
    assert!(server.is_member("set", "b").await.unwrap());
    assert_eq!(server.smembers("set").await.unwrap().len(), 3);
    assert!(server.srem("set", "b").await.unwrap());

    server.zadd("z", 2.0, "b").await.unwrap();
    server.zadd("z", 1.0, "a").await.unwrap();
    assert_eq!(server.zscore("z", "b").await.unwrap(), Some(2.0));
    assert_eq!(
        server.zrange("z", 0, -1).await.unwrap(),
        vec![b"a".to_vec(), b"b".to_vec()]
    );

    assert_eq!(server.incr("n", 5).await.unwrap(), 5);

    // Direct writes respect the type index.
    assert_eq!(
        server.set("h", "clobber").await,
        Err(fauxredis::StoreError::WrongType)
    );
    assert_eq!(
        server.get("missing").await,
        Err(fauxredis::StoreError::NotFound)
    );

    let mut keys = server.keys().await;
    keys.sort();
    assert_eq!(keys, vec!["h", "l", "n", "s", "set", "z"]);

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_preserves_keyspace_and_port() {
    let server = FauxRedis::run().await.unwrap();
    let addr = server.addr();
    server.set("sticky", "value").await.unwrap();

    server.close().await;
    // Idempotent.
    server.close().await;
    assert!(TcpStream::connect(addr).await.is_err());

    server.restart().await.unwrap();
    assert_eq!(server.addr(), addr);
    assert_eq!(server.get("sticky").await.unwrap(), b"value");

    let mut conn = TcpStream::connect(addr).await.unwrap();
    send(&mut conn, &["GET", "sticky"]).await;
    expect(&mut conn, "$5\r\nvalue\r\n").await;

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn counters_track_connections_and_commands() {
    let server = FauxRedis::run().await.unwrap();
    assert_eq!(server.total_connection_count().await, 0);

    let mut conn = TcpStream::connect(server.addr()).await.unwrap();
    send(&mut conn, &["PING"]).await;
    expect(&mut conn, "+PONG\r\n").await;
    send(&mut conn, &["BOGUS"]).await;
    expect(
        &mut conn,
        "-ERR unknown command `BOGUS`, with args beginning with: \r\n",
    )
    .await;

    assert_eq!(server.total_connection_count().await, 1);
    assert_eq!(server.current_connection_count().await, 1);
    // Unknown commands don't count.
    assert_eq!(server.command_count().await, 1);

    let mut second = TcpStream::connect(server.addr()).await.unwrap();
    send(&mut second, &["PING"]).await;
    expect(&mut second, "+PONG\r\n").await;
    assert_eq!(server.total_connection_count().await, 2);

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn in_process_pipe_speaks_resp() {
    let server = FauxRedis::run().await.unwrap();
    let mut pipe = server.pipe().await;

    pipe.write_all(&frame(&["SET", "k", "v"])).await.unwrap();
    let mut buf = [0u8; 5];
    pipe.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"+OK\r\n");

    assert_eq!(server.total_connection_count().await, 1);
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn seeded_rng_makes_random_commands_deterministic() {
    let server = FauxRedis::run().await.unwrap();
    for key in ["a", "b", "c", "d", "e"] {
        server.set(key, "v").await.unwrap();
    }
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();

    let mut picks = Vec::new();
    for _ in 0..2 {
        server.seed(42).await;
        send(&mut conn, &["RANDOMKEY"]).await;
        let mut buf = [0u8; 7]; // $1\r\nX\r\n
        conn.read_exact(&mut buf).await.unwrap();
        picks.push(buf.to_vec());
    }
    assert_eq!(picks[0], picks[1]);

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn standalone_subscriber_observes_publishes() {
    let server = FauxRedis::run().await.unwrap();
    let mut sub = server.new_subscriber().await;
    sub.subscribe("events").await;
    sub.psubscribe("logs.*").await;

    let mut conn = TcpStream::connect(server.addr()).await.unwrap();
    send(&mut conn, &["PUBLISH", "events", "one"]).await;
    expect(&mut conn, ":1\r\n").await;
    send(&mut conn, &["PUBLISH", "logs.app", "two"]).await;
    expect(&mut conn, ":1\r\n").await;
    send(&mut conn, &["PUBLISH", "other", "nope"]).await;
    expect(&mut conn, ":0\r\n").await;

    let first = sub.next_message().await.unwrap();
    assert_eq!(first.channel, "events");
    assert_eq!(first.payload, b"one");
    assert_eq!(first.pattern, None);

    let second = sub.next_message().await.unwrap();
    assert_eq!(second.channel, "logs.app");
    assert_eq!(second.pattern.as_deref(), Some("logs.*"));

    // Standalone subscribers survive an empty subscription set.
    sub.unsubscribe("events").await;
    send(&mut conn, &["PUBLISH", "logs.app", "three"]).await;
    expect(&mut conn, ":1\r\n").await;
    assert!(sub.next_message().await.is_some());

    sub.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dump_renders_selected_database() {
    let server = FauxRedis::run().await.unwrap();
    server.set("name", "ada").await.unwrap();
    server.hset("user", "lang", "rust").await.unwrap();
    server.rpush("todo", "write tests").await.unwrap();
    server.set("long", "x".repeat(100)).await.unwrap();

    let dump = server.dump().await;
    assert!(dump.contains("- name\n   \"ada\"\n"), "dump was:\n{dump}");
    assert!(dump.contains("- user\n   lang: \"rust\"\n"), "dump was:\n{dump}");
    assert!(dump.contains("- todo\n   \"write tests\"\n"), "dump was:\n{dump}");
    assert!(dump.contains("...(100)"), "dump was:\n{dump}");

    // Only the selected database is rendered.
    server.db(3).set("elsewhere", "v").await.unwrap();
    assert!(!server.dump().await.contains("elsewhere"));
    server.select(3).await;
    assert!(server.dump().await.contains("elsewhere"));

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn version_counter_feeds_watch() {
    let server = FauxRedis::run().await.unwrap();
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();

    // A direct-API write is a mutation like any other: it must abort a
    // WATCHed transaction.
    send(&mut conn, &["WATCH", "k"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["MULTI"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["SET", "k", "wire"]).await;
    expect(&mut conn, "+QUEUED\r\n").await;

    server.set("k", "direct").await.unwrap();

    send(&mut conn, &["EXEC"]).await;
    expect(&mut conn, "*-1\r\n").await;
    assert_eq!(server.get("k").await.unwrap(), b"direct");

    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_a_watched_key_aborts_exec() {
    let server = FauxRedis::run().await.unwrap();
    server.set("k", "v").await.unwrap();
    let mut conn = TcpStream::connect(server.addr()).await.unwrap();

    send(&mut conn, &["WATCH", "k"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["MULTI"]).await;
    expect(&mut conn, "+OK\r\n").await;
    send(&mut conn, &["GET", "k"]).await;
    expect(&mut conn, "+QUEUED\r\n").await;

    assert!(server.del("k").await);

    send(&mut conn, &["EXEC"]).await;
    expect(&mut conn, "*-1\r\n").await;

    server.close().await;
}
