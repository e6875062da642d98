use super::{
    arg_f64, arg_i64, arg_str, cmd, not_a_float, not_an_integer, wrong_arg_count, wrong_type,
    CommandContext, CommandRegistry,
};
use crate::resp::RespValue;
use crate::server::ServerError;
use crate::store::Database;
use crate::types::Value;
use std::collections::HashMap;

pub fn register(registry: &CommandRegistry) -> Result<(), ServerError> {
    cmd!(registry, "HSET", -4, cmd_hset);
    cmd!(registry, "HSETNX", 4, cmd_hsetnx);
    cmd!(registry, "HGET", 3, cmd_hget);
    cmd!(registry, "HDEL", -3, cmd_hdel);
    cmd!(registry, "HEXISTS", 3, cmd_hexists);
    cmd!(registry, "HGETALL", 2, cmd_hgetall);
    cmd!(registry, "HKEYS", 2, cmd_hkeys);
    cmd!(registry, "HVALS", 2, cmd_hvals);
    cmd!(registry, "HLEN", 2, cmd_hlen);
    cmd!(registry, "HMGET", -3, cmd_hmget);
    cmd!(registry, "HMSET", -4, cmd_hmset);
    cmd!(registry, "HINCRBY", 4, cmd_hincrby);
    cmd!(registry, "HINCRBYFLOAT", 4, cmd_hincrbyfloat);
    cmd!(registry, "HSTRLEN", 3, cmd_hstrlen);
    Ok(())
}

/// Read a key as a hash; absent keys read as empty.
fn read_hash(db: &mut Database, key: &str) -> Result<HashMap<String, Vec<u8>>, RespValue> {
    match db.get(key) {
        Some(entry) => match entry.value.as_hash() {
            Some(h) => Ok(h.clone()),
            None => Err(wrong_type()),
        },
        None => Ok(HashMap::new()),
    }
}

/// Sorted field list, for deterministic multi-value replies.
fn sorted_fields(hash: &HashMap<String, Vec<u8>>) -> Vec<String> {
    let mut fields: Vec<String> = hash.keys().cloned().collect();
    fields.sort();
    fields
}

async fn cmd_hset(ctx: CommandContext<'_>) -> RespValue {
    if ctx.args.len() % 2 != 1 {
        return wrong_arg_count("hset");
    }
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let entry = db.get_or_create(&key, || Value::Hash(HashMap::new()));
    let Some(hash) = entry.value.as_hash_mut() else {
        return wrong_type();
    };
    let mut created = 0;
    for pair in ctx.args[1..].chunks(2) {
        if hash.insert(arg_str(&pair[0]), pair[1].clone()).is_none() {
            created += 1;
        }
    }
    db.bump(&key);
    RespValue::int(created)
}

async fn cmd_hsetnx(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let field = arg_str(&ctx.args[1]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let entry = db.get_or_create(&key, || Value::Hash(HashMap::new()));
    let Some(hash) = entry.value.as_hash_mut() else {
        return wrong_type();
    };
    if hash.contains_key(&field) {
        return RespValue::int(0);
    }
    hash.insert(field, ctx.args[2].clone());
    db.bump(&key);
    RespValue::int(1)
}

async fn cmd_hget(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let field = arg_str(&ctx.args[1]);
    let mut store = ctx.store.write().await;
    match read_hash(store.db(ctx.client.db_index), &key) {
        Ok(hash) => match hash.get(&field) {
            Some(v) => RespValue::bulk(v.clone()),
            None => RespValue::null_bulk(),
        },
        Err(e) => e,
    }
}

async fn cmd_hdel(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let Some(entry) = db.get_mut(&key) else {
        return RespValue::int(0);
    };
    let Some(hash) = entry.value.as_hash_mut() else {
        return wrong_type();
    };
    let mut removed = 0;
    for field in &ctx.args[1..] {
        if hash.remove(&arg_str(field)).is_some() {
            removed += 1;
        }
    }
    let emptied = hash.is_empty();
    if removed > 0 {
        db.bump(&key);
    }
    // A composite key vanishes with its last field.
    if emptied {
        db.del(&key);
    }
    RespValue::int(removed)
}

async fn cmd_hexists(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let field = arg_str(&ctx.args[1]);
    let mut store = ctx.store.write().await;
    match read_hash(store.db(ctx.client.db_index), &key) {
        Ok(hash) => RespValue::int(hash.contains_key(&field) as i64),
        Err(e) => e,
    }
}

async fn cmd_hgetall(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_hash(store.db(ctx.client.db_index), &key) {
        Ok(hash) => {
            let mut items = Vec::with_capacity(hash.len() * 2);
            for field in sorted_fields(&hash) {
                items.push(RespValue::bulk(field.as_bytes()));
                items.push(RespValue::bulk(hash[&field].clone()));
            }
            RespValue::array(items)
        }
        Err(e) => e,
    }
}

async fn cmd_hkeys(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_hash(store.db(ctx.client.db_index), &key) {
        Ok(hash) => RespValue::array(
            sorted_fields(&hash)
                .into_iter()
                .map(RespValue::bulk)
                .collect(),
        ),
        Err(e) => e,
    }
}

async fn cmd_hvals(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_hash(store.db(ctx.client.db_index), &key) {
        Ok(hash) => RespValue::array(
            sorted_fields(&hash)
                .into_iter()
                .map(|f| RespValue::bulk(hash[&f].clone()))
                .collect(),
        ),
        Err(e) => e,
    }
}

async fn cmd_hlen(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_hash(store.db(ctx.client.db_index), &key) {
        Ok(hash) => RespValue::int(hash.len() as i64),
        Err(e) => e,
    }
}

async fn cmd_hmget(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_hash(store.db(ctx.client.db_index), &key) {
        Ok(hash) => RespValue::array(
            ctx.args[1..]
                .iter()
                .map(|f| match hash.get(&arg_str(f)) {
                    Some(v) => RespValue::bulk(v.clone()),
                    None => RespValue::null_bulk(),
                })
                .collect(),
        ),
        Err(e) => e,
    }
}

async fn cmd_hmset(ctx: CommandContext<'_>) -> RespValue {
    if ctx.args.len() % 2 != 1 {
        return wrong_arg_count("hmset");
    }
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let entry = db.get_or_create(&key, || Value::Hash(HashMap::new()));
    let Some(hash) = entry.value.as_hash_mut() else {
        return wrong_type();
    };
    for pair in ctx.args[1..].chunks(2) {
        hash.insert(arg_str(&pair[0]), pair[1].clone());
    }
    db.bump(&key);
    RespValue::ok()
}

async fn cmd_hincrby(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let field = arg_str(&ctx.args[1]);
    let Some(delta) = arg_i64(&ctx.args[2]) else {
        return not_an_integer();
    };
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let entry = db.get_or_create(&key, || Value::Hash(HashMap::new()));
    let Some(hash) = entry.value.as_hash_mut() else {
        return wrong_type();
    };
    let current: i64 = match hash.get(&field) {
        Some(raw) => match std::str::from_utf8(raw).ok().and_then(|s| s.parse().ok()) {
            Some(n) => n,
            None => return RespValue::error("ERR hash value is not an integer"),
        },
        None => 0,
    };
    let next = match current.checked_add(delta) {
        Some(n) => n,
        None => return RespValue::error("ERR increment or decrement would overflow"),
    };
    hash.insert(field, next.to_string().into_bytes());
    db.bump(&key);
    RespValue::int(next)
}

async fn cmd_hincrbyfloat(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let field = arg_str(&ctx.args[1]);
    let Some(delta) = arg_f64(&ctx.args[2]) else {
        return not_a_float();
    };
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let entry = db.get_or_create(&key, || Value::Hash(HashMap::new()));
    let Some(hash) = entry.value.as_hash_mut() else {
        return wrong_type();
    };
    let current: f64 = match hash.get(&field) {
        Some(raw) => match std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            Some(n) => n,
            None => return RespValue::error("ERR hash value is not a float"),
        },
        None => 0.0,
    };
    let next = current + delta;
    if next.is_nan() || next.is_infinite() {
        return RespValue::error("ERR increment would produce NaN or Infinity");
    }
    let formatted = if next == next.trunc() && next.abs() < 1e17 {
        format!("{}", next as i64)
    } else {
        format!("{next}")
    };
    hash.insert(field, formatted.clone().into_bytes());
    db.bump(&key);
    RespValue::bulk(formatted)
}

async fn cmd_hstrlen(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let field = arg_str(&ctx.args[1]);
    let mut store = ctx.store.write().await;
    match read_hash(store.db(ctx.client.db_index), &key) {
        Ok(hash) => RespValue::int(hash.get(&field).map_or(0, Vec::len) as i64),
        Err(e) => e,
    }
}
