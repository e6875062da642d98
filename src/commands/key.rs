use super::{arg_i64, arg_str, cmd, not_an_integer, CommandContext, CommandRegistry};
use crate::resp::RespValue;
use crate::server::ServerError;
use std::time::Duration;

pub fn register(registry: &CommandRegistry) -> Result<(), ServerError> {
    cmd!(registry, "DEL", -2, cmd_del);
    cmd!(registry, "EXISTS", -2, cmd_exists);
    cmd!(registry, "TYPE", 2, cmd_type);
    cmd!(registry, "EXPIRE", 3, cmd_expire);
    cmd!(registry, "PEXPIRE", 3, cmd_pexpire);
    cmd!(registry, "EXPIREAT", 3, cmd_expireat);
    cmd!(registry, "PEXPIREAT", 3, cmd_pexpireat);
    cmd!(registry, "TTL", 2, cmd_ttl);
    cmd!(registry, "PTTL", 2, cmd_pttl);
    cmd!(registry, "PERSIST", 2, cmd_persist);
    cmd!(registry, "KEYS", 2, cmd_keys);
    cmd!(registry, "RENAME", 3, cmd_rename);
    cmd!(registry, "RENAMENX", 3, cmd_renamenx);
    cmd!(registry, "RANDOMKEY", 1, cmd_randomkey);
    cmd!(registry, "SCAN", -2, cmd_scan);
    cmd!(registry, "MOVE", 3, cmd_move);
    Ok(())
}

async fn cmd_del(ctx: CommandContext<'_>) -> RespValue {
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let mut removed = 0;
    for raw in &ctx.args {
        if db.del(&arg_str(raw)) {
            removed += 1;
        }
    }
    RespValue::int(removed)
}

async fn cmd_exists(ctx: CommandContext<'_>) -> RespValue {
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let mut found = 0;
    for raw in &ctx.args {
        if db.contains(&arg_str(raw)) {
            found += 1;
        }
    }
    RespValue::int(found)
}

async fn cmd_type(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match store.db(ctx.client.db_index).type_of(&key) {
        Some(name) => RespValue::simple(name),
        None => RespValue::simple("none"),
    }
}

async fn cmd_expire(ctx: CommandContext<'_>) -> RespValue {
    apply_relative_expire(ctx, Duration::from_secs).await
}

async fn cmd_pexpire(ctx: CommandContext<'_>) -> RespValue {
    apply_relative_expire(ctx, Duration::from_millis).await
}

/// EXPIRE/PEXPIRE. A non-positive lifetime deletes the key on the spot.
async fn apply_relative_expire(
    ctx: CommandContext<'_>,
    to_duration: fn(u64) -> Duration,
) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let Some(amount) = arg_i64(&ctx.args[1]) else {
        return not_an_integer();
    };
    let ttl = if amount <= 0 {
        Duration::ZERO
    } else {
        to_duration(amount as u64)
    };
    let mut store = ctx.store.write().await;
    let applied = store.db(ctx.client.db_index).set_ttl(&key, ttl);
    RespValue::int(applied as i64)
}

async fn cmd_expireat(ctx: CommandContext<'_>) -> RespValue {
    apply_absolute_expire(ctx, 1_000).await
}

async fn cmd_pexpireat(ctx: CommandContext<'_>) -> RespValue {
    apply_absolute_expire(ctx, 1).await
}

/// EXPIREAT/PEXPIREAT: the timestamp is converted to a duration against the
/// store's logical clock, so time-travelling tests see deterministic TTLs.
async fn apply_absolute_expire(ctx: CommandContext<'_>, unit_ms: i64) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let Some(stamp) = arg_i64(&ctx.args[1]) else {
        return not_an_integer();
    };
    let mut store = ctx.store.write().await;
    let ttl = store.ttl_until_ms(stamp.saturating_mul(unit_ms));
    let applied = store.db(ctx.client.db_index).set_ttl(&key, ttl);
    RespValue::int(applied as i64)
}

async fn cmd_ttl(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    if !db.contains(&key) {
        return RespValue::int(-2);
    }
    match db.ttl(&key) {
        // Seconds, rounded up so a freshly set sub-second TTL reads as live.
        Some(d) => RespValue::int(d.as_millis().div_ceil(1000) as i64),
        None => RespValue::int(-1),
    }
}

async fn cmd_pttl(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    if !db.contains(&key) {
        return RespValue::int(-2);
    }
    match db.ttl(&key) {
        Some(d) => RespValue::int(d.as_millis() as i64),
        None => RespValue::int(-1),
    }
}

async fn cmd_persist(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let cleared = store.db(ctx.client.db_index).persist(&key);
    RespValue::int(cleared as i64)
}

async fn cmd_keys(ctx: CommandContext<'_>) -> RespValue {
    let pattern = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let keys = store.db(ctx.client.db_index).keys_matching(&pattern);
    RespValue::array(keys.into_iter().map(RespValue::bulk).collect())
}

async fn cmd_rename(ctx: CommandContext<'_>) -> RespValue {
    let old = arg_str(&ctx.args[0]);
    let new = arg_str(&ctx.args[1]);
    let mut store = ctx.store.write().await;
    if store.db(ctx.client.db_index).rename(&old, &new) {
        RespValue::ok()
    } else {
        RespValue::error("ERR no such key")
    }
}

async fn cmd_renamenx(ctx: CommandContext<'_>) -> RespValue {
    let old = arg_str(&ctx.args[0]);
    let new = arg_str(&ctx.args[1]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    if !db.contains(&old) {
        return RespValue::error("ERR no such key");
    }
    if db.contains(&new) {
        return RespValue::int(0);
    }
    db.rename(&old, &new);
    RespValue::int(1)
}

async fn cmd_randomkey(ctx: CommandContext<'_>) -> RespValue {
    let mut store = ctx.store.write().await;
    let keys = store.db(ctx.client.db_index).all_keys();
    if keys.is_empty() {
        return RespValue::null_bulk();
    }
    let pick = store.rand_index(keys.len());
    RespValue::bulk(keys[pick].clone())
}

async fn cmd_scan(ctx: CommandContext<'_>) -> RespValue {
    let Some(cursor) = arg_i64(&ctx.args[0]).filter(|c| *c >= 0) else {
        return RespValue::error("ERR invalid cursor");
    };
    let mut pattern = None;
    let mut count = 10usize;

    let mut i = 1;
    while i < ctx.args.len() {
        match arg_str(&ctx.args[i]).to_ascii_uppercase().as_str() {
            "MATCH" => {
                i += 1;
                match ctx.args.get(i) {
                    Some(p) => pattern = Some(arg_str(p)),
                    None => return super::syntax_error(),
                }
            }
            "COUNT" => {
                i += 1;
                match ctx.args.get(i).and_then(|a| arg_i64(a)) {
                    Some(n) if n > 0 => count = n as usize,
                    _ => return super::syntax_error(),
                }
            }
            _ => return super::syntax_error(),
        }
        i += 1;
    }

    let mut store = ctx.store.write().await;
    let (next, keys) =
        store
            .db(ctx.client.db_index)
            .scan(cursor as usize, pattern.as_deref(), count);
    RespValue::array(vec![
        RespValue::bulk(next.to_string()),
        RespValue::array(keys.into_iter().map(RespValue::bulk).collect()),
    ])
}

async fn cmd_move(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let target = match arg_i64(&ctx.args[1]) {
        Some(i) if i >= 0 => i as usize,
        Some(_) => return RespValue::error("ERR DB index is out of range"),
        None => return RespValue::error("ERR invalid DB index"),
    };
    if target >= ctx.config.read().await.databases {
        return RespValue::error("ERR DB index is out of range");
    }
    if target == ctx.client.db_index {
        return RespValue::error("ERR source and destination objects are the same");
    }

    let mut store = ctx.store.write().await;
    if store.db(target).contains(&key) {
        return RespValue::int(0);
    }
    match store.db(ctx.client.db_index).take(&key) {
        Some(entry) => {
            store.db(target).put(&key, entry);
            RespValue::int(1)
        }
        None => RespValue::int(0),
    }
}
