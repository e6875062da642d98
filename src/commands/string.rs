use super::{
    arg_f64, arg_i64, arg_str, cmd, not_a_float, not_an_integer, syntax_error, wrong_type,
    CommandContext, CommandRegistry,
};
use crate::resp::RespValue;
use crate::server::ServerError;
use crate::store::entry::Entry;
use crate::store::Database;
use crate::types::Value;
use std::time::Duration;

pub fn register(registry: &CommandRegistry) -> Result<(), ServerError> {
    cmd!(registry, "SET", -3, cmd_set);
    cmd!(registry, "GET", 2, cmd_get);
    cmd!(registry, "GETSET", 3, cmd_getset);
    cmd!(registry, "SETNX", 3, cmd_setnx);
    cmd!(registry, "SETEX", 4, cmd_setex);
    cmd!(registry, "PSETEX", 4, cmd_psetex);
    cmd!(registry, "APPEND", 3, cmd_append);
    cmd!(registry, "STRLEN", 2, cmd_strlen);
    cmd!(registry, "INCR", 2, cmd_incr);
    cmd!(registry, "DECR", 2, cmd_decr);
    cmd!(registry, "INCRBY", 3, cmd_incrby);
    cmd!(registry, "DECRBY", 3, cmd_decrby);
    cmd!(registry, "INCRBYFLOAT", 3, cmd_incrbyfloat);
    cmd!(registry, "MSET", -3, cmd_mset);
    cmd!(registry, "MGET", -2, cmd_mget);
    cmd!(registry, "GETRANGE", 4, cmd_getrange);
    cmd!(registry, "SETRANGE", 4, cmd_setrange);
    Ok(())
}

/// Read a key as a string value; absent keys yield None, other types an
/// error.
fn read_string(db: &mut Database, key: &str) -> Result<Option<Vec<u8>>, RespValue> {
    match db.get(key) {
        Some(entry) => match entry.value.as_str() {
            Some(s) => Ok(Some(s.clone())),
            None => Err(wrong_type()),
        },
        None => Ok(None),
    }
}

async fn cmd_set(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let value = ctx.args[1].clone();

    let mut ttl: Option<Duration> = None;
    let mut nx = false;
    let mut xx = false;

    let mut i = 2;
    while i < ctx.args.len() {
        match arg_str(&ctx.args[i]).to_ascii_uppercase().as_str() {
            "EX" => {
                i += 1;
                match ctx.args.get(i).and_then(|a| arg_i64(a)) {
                    Some(n) if n > 0 => ttl = Some(Duration::from_secs(n as u64)),
                    Some(_) => {
                        return RespValue::error("ERR invalid expire time in 'set' command")
                    }
                    None => return syntax_error(),
                }
            }
            "PX" => {
                i += 1;
                match ctx.args.get(i).and_then(|a| arg_i64(a)) {
                    Some(n) if n > 0 => ttl = Some(Duration::from_millis(n as u64)),
                    Some(_) => {
                        return RespValue::error("ERR invalid expire time in 'set' command")
                    }
                    None => return syntax_error(),
                }
            }
            "NX" => nx = true,
            "XX" => xx = true,
            _ => return syntax_error(),
        }
        i += 1;
    }
    if nx && xx {
        return syntax_error();
    }

    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);

    let exists = db.contains(&key);
    if (nx && exists) || (xx && !exists) {
        return RespValue::null_bulk();
    }

    match ttl {
        Some(d) => db.set_entry(&key, Entry::with_ttl(Value::Str(value), d)),
        None => db.set_value(&key, Value::Str(value)),
    }
    RespValue::ok()
}

async fn cmd_get(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_string(store.db(ctx.client.db_index), &key) {
        Ok(Some(v)) => RespValue::bulk(v),
        Ok(None) => RespValue::null_bulk(),
        Err(e) => e,
    }
}

async fn cmd_getset(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let value = ctx.args[1].clone();
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let old = match read_string(db, &key) {
        Ok(v) => v,
        Err(e) => return e,
    };
    // Like SET, this clears any TTL on the key.
    db.set_value(&key, Value::Str(value));
    match old {
        Some(v) => RespValue::bulk(v),
        None => RespValue::null_bulk(),
    }
}

async fn cmd_setnx(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    if db.contains(&key) {
        return RespValue::int(0);
    }
    db.set_value(&key, Value::Str(ctx.args[1].clone()));
    RespValue::int(1)
}

async fn cmd_setex(ctx: CommandContext<'_>) -> RespValue {
    set_with_ttl(ctx, "setex", Duration::from_secs).await
}

async fn cmd_psetex(ctx: CommandContext<'_>) -> RespValue {
    set_with_ttl(ctx, "psetex", Duration::from_millis).await
}

async fn set_with_ttl(
    ctx: CommandContext<'_>,
    name: &str,
    to_duration: fn(u64) -> Duration,
) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let ttl = match arg_i64(&ctx.args[1]) {
        Some(n) if n > 0 => to_duration(n as u64),
        Some(_) => return RespValue::error(format!("ERR invalid expire time in '{name}' command")),
        None => return not_an_integer(),
    };
    let value = ctx.args[2].clone();
    let mut store = ctx.store.write().await;
    store
        .db(ctx.client.db_index)
        .set_entry(&key, Entry::with_ttl(Value::Str(value), ttl));
    RespValue::ok()
}

async fn cmd_append(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let entry = db.get_or_create(&key, || Value::Str(Vec::new()));
    let Some(s) = entry.value.as_str_mut() else {
        return wrong_type();
    };
    s.extend_from_slice(&ctx.args[1]);
    let len = s.len();
    db.bump(&key);
    RespValue::int(len as i64)
}

async fn cmd_strlen(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_string(store.db(ctx.client.db_index), &key) {
        Ok(Some(v)) => RespValue::int(v.len() as i64),
        Ok(None) => RespValue::int(0),
        Err(e) => e,
    }
}

async fn cmd_incr(ctx: CommandContext<'_>) -> RespValue {
    increment(ctx, 1).await
}

async fn cmd_decr(ctx: CommandContext<'_>) -> RespValue {
    increment(ctx, -1).await
}

async fn cmd_incrby(ctx: CommandContext<'_>) -> RespValue {
    match arg_i64(&ctx.args[1]) {
        Some(delta) => increment(ctx, delta).await,
        None => not_an_integer(),
    }
}

async fn cmd_decrby(ctx: CommandContext<'_>) -> RespValue {
    match arg_i64(&ctx.args[1]) {
        Some(delta) => match delta.checked_neg() {
            Some(neg) => increment(ctx, neg).await,
            None => RespValue::error("ERR decrement would overflow"),
        },
        None => not_an_integer(),
    }
}

/// Shared INCR/DECR/INCRBY/DECRBY body: the counter mutates in place, so an
/// existing TTL survives.
async fn increment(ctx: CommandContext<'_>, delta: i64) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let entry = db.get_or_create(&key, || Value::Str(b"0".to_vec()));
    let Some(s) = entry.value.as_str_mut() else {
        return wrong_type();
    };
    let current: i64 = match std::str::from_utf8(s).ok().and_then(|v| v.parse().ok()) {
        Some(n) => n,
        None => return not_an_integer(),
    };
    let next = match current.checked_add(delta) {
        Some(n) => n,
        None => return RespValue::error("ERR increment or decrement would overflow"),
    };
    *s = next.to_string().into_bytes();
    db.bump(&key);
    RespValue::int(next)
}

async fn cmd_incrbyfloat(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let Some(delta) = arg_f64(&ctx.args[1]) else {
        return not_a_float();
    };
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let entry = db.get_or_create(&key, || Value::Str(b"0".to_vec()));
    let Some(s) = entry.value.as_str_mut() else {
        return wrong_type();
    };
    let current: f64 = match std::str::from_utf8(s).ok().and_then(|v| v.trim().parse().ok()) {
        Some(n) => n,
        None => return not_a_float(),
    };
    let next = current + delta;
    if next.is_nan() || next.is_infinite() {
        return RespValue::error("ERR increment would produce NaN or Infinity");
    }
    let formatted = format_float(next);
    *s = formatted.clone().into_bytes();
    db.bump(&key);
    RespValue::bulk(formatted)
}

/// Render a float without a spurious fractional part.
fn format_float(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e17 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

async fn cmd_mset(ctx: CommandContext<'_>) -> RespValue {
    if ctx.args.len() % 2 != 0 {
        return super::wrong_arg_count("mset");
    }
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    for pair in ctx.args.chunks(2) {
        db.set_value(&arg_str(&pair[0]), Value::Str(pair[1].clone()));
    }
    RespValue::ok()
}

async fn cmd_mget(ctx: CommandContext<'_>) -> RespValue {
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let values = ctx
        .args
        .iter()
        .map(|raw| {
            let key = arg_str(raw);
            match db.get(&key).and_then(|e| e.value.as_str()) {
                // Wrong-typed keys read as missing, like the real server.
                Some(v) => RespValue::bulk(v.clone()),
                None => RespValue::null_bulk(),
            }
        })
        .collect();
    RespValue::array(values)
}

async fn cmd_getrange(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let (Some(start), Some(end)) = (arg_i64(&ctx.args[1]), arg_i64(&ctx.args[2])) else {
        return not_an_integer();
    };
    let mut store = ctx.store.write().await;
    let value = match read_string(store.db(ctx.client.db_index), &key) {
        Ok(Some(v)) => v,
        Ok(None) => return RespValue::bulk(Vec::new()),
        Err(e) => return e,
    };

    let len = value.len() as i64;
    let mut s = if start < 0 { len + start } else { start };
    let mut e = if end < 0 { len + end } else { end };
    s = s.max(0);
    e = e.min(len - 1);
    if len == 0 || s > e {
        return RespValue::bulk(Vec::new());
    }
    RespValue::bulk(value[s as usize..=e as usize].to_vec())
}

async fn cmd_setrange(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let offset = match arg_i64(&ctx.args[1]) {
        Some(n) if n >= 0 => n as usize,
        Some(_) => return RespValue::error("ERR offset is out of range"),
        None => return not_an_integer(),
    };
    let patch = &ctx.args[2];

    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let entry = db.get_or_create(&key, || Value::Str(Vec::new()));
    let Some(s) = entry.value.as_str_mut() else {
        return wrong_type();
    };
    let needed = offset + patch.len();
    if needed > s.len() {
        s.resize(needed, 0);
    }
    s[offset..needed].copy_from_slice(patch);
    let len = s.len();
    db.bump(&key);
    RespValue::int(len as i64)
}
