use super::{
    arg_i64, arg_str, cmd, not_an_integer, wrong_type, CommandContext, CommandRegistry,
};
use crate::resp::RespValue;
use crate::server::ServerError;
use crate::store::Database;
use crate::types::Value;
use std::collections::VecDeque;
use std::time::Duration;

pub fn register(registry: &CommandRegistry) -> Result<(), ServerError> {
    cmd!(registry, "LPUSH", -3, cmd_lpush);
    cmd!(registry, "RPUSH", -3, cmd_rpush);
    cmd!(registry, "LPOP", -2, cmd_lpop);
    cmd!(registry, "RPOP", -2, cmd_rpop);
    cmd!(registry, "LLEN", 2, cmd_llen);
    cmd!(registry, "LRANGE", 4, cmd_lrange);
    cmd!(registry, "LINDEX", 3, cmd_lindex);
    cmd!(registry, "LSET", 4, cmd_lset);
    cmd!(registry, "LREM", 4, cmd_lrem);
    cmd!(registry, "LTRIM", 4, cmd_ltrim);
    cmd!(registry, "RPOPLPUSH", 3, cmd_rpoplpush);
    cmd!(registry, "BLPOP", -3, cmd_blpop);
    cmd!(registry, "BRPOP", -3, cmd_brpop);
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum End {
    Left,
    Right,
}

fn read_list(db: &mut Database, key: &str) -> Result<VecDeque<Vec<u8>>, RespValue> {
    match db.get(key) {
        Some(entry) => match entry.value.as_list() {
            Some(l) => Ok(l.clone()),
            None => Err(wrong_type()),
        },
        None => Ok(VecDeque::new()),
    }
}

async fn cmd_lpush(ctx: CommandContext<'_>) -> RespValue {
    push(ctx, End::Left).await
}

async fn cmd_rpush(ctx: CommandContext<'_>) -> RespValue {
    push(ctx, End::Right).await
}

async fn push(ctx: CommandContext<'_>, end: End) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let len = {
        let mut store = ctx.store.write().await;
        let db = store.db(ctx.client.db_index);
        let entry = db.get_or_create(&key, || Value::List(VecDeque::new()));
        let Some(list) = entry.value.as_list_mut() else {
            return wrong_type();
        };
        for value in &ctx.args[1..] {
            match end {
                End::Left => list.push_front(value.clone()),
                End::Right => list.push_back(value.clone()),
            }
        }
        let len = list.len();
        db.bump(&key);
        len
    };
    // Wake any BLPOP/BRPOP parked on this key.
    ctx.watcher
        .write()
        .await
        .notify(ctx.client.db_index, &key);
    RespValue::int(len as i64)
}

async fn cmd_lpop(ctx: CommandContext<'_>) -> RespValue {
    pop(ctx, End::Left).await
}

async fn cmd_rpop(ctx: CommandContext<'_>) -> RespValue {
    pop(ctx, End::Right).await
}

async fn pop(ctx: CommandContext<'_>, end: End) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let count = match ctx.args.get(1) {
        None => None,
        Some(raw) => match arg_i64(raw) {
            Some(n) if n >= 0 => Some(n as usize),
            _ => return RespValue::error("ERR value is out of range, must be positive"),
        },
    };

    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let Some(entry) = db.get_mut(&key) else {
        return match count {
            None => RespValue::null_bulk(),
            Some(_) => RespValue::null_array(),
        };
    };
    let Some(list) = entry.value.as_list_mut() else {
        return wrong_type();
    };

    let take = count.unwrap_or(1).min(list.len());
    let mut popped = Vec::with_capacity(take);
    for _ in 0..take {
        let item = match end {
            End::Left => list.pop_front(),
            End::Right => list.pop_back(),
        };
        match item {
            Some(v) => popped.push(v),
            None => break,
        }
    }
    let emptied = list.is_empty();
    if !popped.is_empty() {
        db.bump(&key);
    }
    if emptied {
        db.del(&key);
    }

    match count {
        None => match popped.into_iter().next() {
            Some(v) => RespValue::bulk(v),
            None => RespValue::null_bulk(),
        },
        Some(_) => {
            if popped.is_empty() {
                RespValue::null_array()
            } else {
                RespValue::array(popped.into_iter().map(RespValue::bulk).collect())
            }
        }
    }
}

async fn cmd_llen(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_list(store.db(ctx.client.db_index), &key) {
        Ok(list) => RespValue::int(list.len() as i64),
        Err(e) => e,
    }
}

async fn cmd_lrange(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let (Some(start), Some(stop)) = (arg_i64(&ctx.args[1]), arg_i64(&ctx.args[2])) else {
        return not_an_integer();
    };
    let mut store = ctx.store.write().await;
    let list = match read_list(store.db(ctx.client.db_index), &key) {
        Ok(l) => l,
        Err(e) => return e,
    };

    let len = list.len() as i64;
    let start = clamp_index(start, len);
    let stop = clamp_index(stop, len);
    if start > stop || start >= len {
        return RespValue::array(Vec::new());
    }
    let stop = stop.min(len - 1);
    RespValue::array(
        list.iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|v| RespValue::bulk(v.clone()))
            .collect(),
    )
}

async fn cmd_lindex(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let Some(index) = arg_i64(&ctx.args[1]) else {
        return not_an_integer();
    };
    let mut store = ctx.store.write().await;
    let list = match read_list(store.db(ctx.client.db_index), &key) {
        Ok(l) => l,
        Err(e) => return e,
    };
    let len = list.len() as i64;
    let index = if index < 0 { len + index } else { index };
    if index < 0 || index >= len {
        return RespValue::null_bulk();
    }
    RespValue::bulk(list[index as usize].clone())
}

async fn cmd_lset(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let Some(index) = arg_i64(&ctx.args[1]) else {
        return not_an_integer();
    };
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let Some(entry) = db.get_mut(&key) else {
        return RespValue::error("ERR no such key");
    };
    let Some(list) = entry.value.as_list_mut() else {
        return wrong_type();
    };
    let len = list.len() as i64;
    let index = if index < 0 { len + index } else { index };
    if index < 0 || index >= len {
        return RespValue::error("ERR index out of range");
    }
    list[index as usize] = ctx.args[2].clone();
    db.bump(&key);
    RespValue::ok()
}

async fn cmd_lrem(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let Some(count) = arg_i64(&ctx.args[1]) else {
        return not_an_integer();
    };
    let needle = &ctx.args[2];

    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let Some(entry) = db.get_mut(&key) else {
        return RespValue::int(0);
    };
    let Some(list) = entry.value.as_list_mut() else {
        return wrong_type();
    };

    let limit = if count == 0 {
        usize::MAX
    } else {
        count.unsigned_abs() as usize
    };
    let mut removed = 0;
    if count >= 0 {
        let mut i = 0;
        while i < list.len() && removed < limit {
            if &list[i] == needle {
                list.remove(i);
                removed += 1;
            } else {
                i += 1;
            }
        }
    } else {
        let mut i = list.len();
        while i > 0 && removed < limit {
            i -= 1;
            if &list[i] == needle {
                list.remove(i);
                removed += 1;
            }
        }
    }
    let emptied = list.is_empty();
    if removed > 0 {
        db.bump(&key);
    }
    if emptied {
        db.del(&key);
    }
    RespValue::int(removed as i64)
}

async fn cmd_ltrim(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let (Some(start), Some(stop)) = (arg_i64(&ctx.args[1]), arg_i64(&ctx.args[2])) else {
        return not_an_integer();
    };
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let Some(entry) = db.get_mut(&key) else {
        return RespValue::ok();
    };
    let Some(list) = entry.value.as_list_mut() else {
        return wrong_type();
    };

    let len = list.len() as i64;
    let start = clamp_index(start, len);
    let stop = clamp_index(stop, len).min(len - 1);
    let kept: VecDeque<Vec<u8>> = if start > stop || start >= len {
        VecDeque::new()
    } else {
        list.iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect()
    };
    let emptied = kept.is_empty();
    *list = kept;
    db.bump(&key);
    if emptied {
        db.del(&key);
    }
    RespValue::ok()
}

async fn cmd_rpoplpush(ctx: CommandContext<'_>) -> RespValue {
    let source = arg_str(&ctx.args[0]);
    let dest = arg_str(&ctx.args[1]);

    let value = {
        let mut store = ctx.store.write().await;
        let db = store.db(ctx.client.db_index);

        // Type-check the destination before popping.
        if let Some(entry) = db.get(&dest) {
            if entry.value.as_list().is_none() {
                return wrong_type();
            }
        }

        let Some(entry) = db.get_mut(&source) else {
            return RespValue::null_bulk();
        };
        let Some(list) = entry.value.as_list_mut() else {
            return wrong_type();
        };
        let Some(value) = list.pop_back() else {
            return RespValue::null_bulk();
        };
        let emptied = list.is_empty();
        db.bump(&source);
        if emptied {
            db.del(&source);
        }

        let entry = db.get_or_create(&dest, || Value::List(VecDeque::new()));
        let list = entry.value.as_list_mut().expect("checked above");
        list.push_front(value.clone());
        db.bump(&dest);
        value
    };

    ctx.watcher
        .write()
        .await
        .notify(ctx.client.db_index, &dest);
    RespValue::bulk(value)
}

async fn cmd_blpop(ctx: CommandContext<'_>) -> RespValue {
    blocking_pop(ctx, End::Left).await
}

async fn cmd_brpop(ctx: CommandContext<'_>) -> RespValue {
    blocking_pop(ctx, End::Right).await
}

/// BLPOP/BRPOP. Waiters park on the key watcher with the command gate
/// released, so producers can get in; they re-acquire and re-check after
/// every wake-up. Inside EXEC the blocking variants degrade to an immediate
/// poll.
async fn blocking_pop(mut ctx: CommandContext<'_>, end: End) -> RespValue {
    let keys: Vec<String> = ctx.args[..ctx.args.len() - 1]
        .iter()
        .map(|a| arg_str(a))
        .collect();
    let timeout = match parse_timeout(ctx.args.last().expect("arity checked")) {
        Ok(t) => t,
        Err(e) => return e,
    };
    let db_index = ctx.client.db_index;
    let deadline = timeout.map(|d| tokio::time::Instant::now() + d);

    loop {
        {
            let mut store = ctx.store.write().await;
            let db = store.db(db_index);
            match try_pop_first(db, &keys, end) {
                Ok(Some((key, value))) => {
                    return RespValue::array(vec![RespValue::bulk(key), RespValue::bulk(value)]);
                }
                Ok(None) => {}
                Err(e) => return e,
            }
        }

        if ctx.client.in_exec {
            return RespValue::null_array();
        }

        // Register before releasing the gate so a push between our check and
        // the wait cannot be missed.
        let notify = ctx.watcher.write().await.register(db_index, &keys);
        ctx.gate.release();

        let woken = match deadline {
            Some(deadline) => tokio::select! {
                _ = notify.notified() => true,
                _ = tokio::time::sleep_until(deadline) => false,
                _ = ctx.shutdown.cancelled() => false,
            },
            None => tokio::select! {
                _ = notify.notified() => true,
                _ = ctx.shutdown.cancelled() => false,
            },
        };

        ctx.gate.reacquire().await;
        ctx.watcher
            .write()
            .await
            .unregister(db_index, &keys, &notify);

        if !woken {
            return RespValue::null_array();
        }
    }
}

/// Pop from the first non-empty key, in argument order.
fn try_pop_first(
    db: &mut Database,
    keys: &[String],
    end: End,
) -> Result<Option<(String, Vec<u8>)>, RespValue> {
    for key in keys {
        let Some(entry) = db.get_mut(key) else {
            continue;
        };
        let Some(list) = entry.value.as_list_mut() else {
            return Err(wrong_type());
        };
        let value = match end {
            End::Left => list.pop_front(),
            End::Right => list.pop_back(),
        };
        if let Some(value) = value {
            let emptied = list.is_empty();
            db.bump(key);
            if emptied {
                db.del(key);
            }
            return Ok(Some((key.clone(), value)));
        }
    }
    Ok(None)
}

/// The trailing BLPOP timeout in seconds; zero means wait forever.
fn parse_timeout(raw: &[u8]) -> Result<Option<Duration>, RespValue> {
    let secs: f64 = match std::str::from_utf8(raw).ok().and_then(|s| s.parse().ok()) {
        Some(v) => v,
        None => {
            return Err(RespValue::error(
                "ERR timeout is not a float or out of range",
            ))
        }
    };
    if secs < 0.0 || !secs.is_finite() {
        return Err(RespValue::error("ERR timeout is negative"));
    }
    if secs == 0.0 {
        Ok(None)
    } else {
        Ok(Some(Duration::from_secs_f64(secs)))
    }
}

fn clamp_index(index: i64, len: i64) -> i64 {
    if index < 0 {
        (len + index).max(0)
    } else {
        index
    }
}
