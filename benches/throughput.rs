//! Rough SET/GET throughput measurement against an in-process server.
//! Run with `cargo bench`.

use fauxredis::FauxRedis;
use redis::Commands;
use std::time::Instant;

fn bench_set_get(conn: &mut redis::Connection, iterations: usize) -> (f64, f64) {
    let start = Instant::now();
    for i in 0..iterations {
        let _: () = conn
            .set(format!("bench_key_{i}"), format!("value_{i}"))
            .unwrap();
    }
    let set_ops = iterations as f64 / start.elapsed().as_secs_f64();

    let start = Instant::now();
    for i in 0..iterations {
        let _: String = conn.get(format!("bench_key_{i}")).unwrap();
    }
    let get_ops = iterations as f64 / start.elapsed().as_secs_f64();

    (set_ops, get_ops)
}

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let server = runtime.block_on(FauxRedis::run()).unwrap();
    let addr = server.addr();

    let client = redis::Client::open(format!("redis://{addr}/")).unwrap();
    let mut conn = client.get_connection().unwrap();

    // Warm up allocator and connection.
    let _ = bench_set_get(&mut conn, 1_000);

    let iterations = 20_000;
    let (set_ops, get_ops) = bench_set_get(&mut conn, iterations);
    println!("SET: {set_ops:.0} ops/sec");
    println!("GET: {get_ops:.0} ops/sec");

    runtime.block_on(server.close());
}
