use super::{arg_i64, arg_str, cmd, wrong_type, CommandContext, CommandRegistry};
use crate::resp::RespValue;
use crate::server::ServerError;
use crate::store::Database;
use crate::types::Value;
use std::collections::HashSet;

pub fn register(registry: &CommandRegistry) -> Result<(), ServerError> {
    cmd!(registry, "SADD", -3, cmd_sadd);
    cmd!(registry, "SREM", -3, cmd_srem);
    cmd!(registry, "SCARD", 2, cmd_scard);
    cmd!(registry, "SISMEMBER", 3, cmd_sismember);
    cmd!(registry, "SMEMBERS", 2, cmd_smembers);
    cmd!(registry, "SPOP", -2, cmd_spop);
    cmd!(registry, "SRANDMEMBER", -2, cmd_srandmember);
    cmd!(registry, "SMOVE", 4, cmd_smove);
    Ok(())
}

fn read_set(db: &mut Database, key: &str) -> Result<HashSet<Vec<u8>>, RespValue> {
    match db.get(key) {
        Some(entry) => match entry.value.as_set() {
            Some(s) => Ok(s.clone()),
            None => Err(wrong_type()),
        },
        None => Ok(HashSet::new()),
    }
}

/// Members in lexicographic order, for deterministic replies and seeded
/// random draws.
fn sorted_members(set: &HashSet<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut members: Vec<Vec<u8>> = set.iter().cloned().collect();
    members.sort();
    members
}

async fn cmd_sadd(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let entry = db.get_or_create(&key, || Value::Set(HashSet::new()));
    let Some(set) = entry.value.as_set_mut() else {
        return wrong_type();
    };
    let mut added = 0;
    for member in &ctx.args[1..] {
        if set.insert(member.clone()) {
            added += 1;
        }
    }
    db.bump(&key);
    RespValue::int(added)
}

async fn cmd_srem(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let Some(entry) = db.get_mut(&key) else {
        return RespValue::int(0);
    };
    let Some(set) = entry.value.as_set_mut() else {
        return wrong_type();
    };
    let mut removed = 0;
    for member in &ctx.args[1..] {
        if set.remove(member.as_slice()) {
            removed += 1;
        }
    }
    let emptied = set.is_empty();
    if removed > 0 {
        db.bump(&key);
    }
    if emptied {
        db.del(&key);
    }
    RespValue::int(removed)
}

async fn cmd_scard(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_set(store.db(ctx.client.db_index), &key) {
        Ok(set) => RespValue::int(set.len() as i64),
        Err(e) => e,
    }
}

async fn cmd_sismember(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_set(store.db(ctx.client.db_index), &key) {
        Ok(set) => RespValue::int(set.contains(ctx.args[1].as_slice()) as i64),
        Err(e) => e,
    }
}

async fn cmd_smembers(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_set(store.db(ctx.client.db_index), &key) {
        Ok(set) => RespValue::array(
            sorted_members(&set)
                .into_iter()
                .map(RespValue::bulk)
                .collect(),
        ),
        Err(e) => e,
    }
}

async fn cmd_spop(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let count = match ctx.args.get(1) {
        None => None,
        Some(raw) => match arg_i64(raw) {
            Some(n) if n >= 0 => Some(n as usize),
            _ => return RespValue::error("ERR value is out of range, must be positive"),
        },
    };

    let mut store = ctx.store.write().await;
    let members = match read_set(store.db(ctx.client.db_index), &key) {
        Ok(set) => sorted_members(&set),
        Err(e) => return e,
    };
    if members.is_empty() {
        return match count {
            None => RespValue::null_bulk(),
            Some(_) => RespValue::array(Vec::new()),
        };
    }

    let take = count.unwrap_or(1).min(members.len());
    let mut pool = members;
    store.shuffle(&mut pool);
    let picked: Vec<Vec<u8>> = pool.into_iter().take(take).collect();

    let db = store.db(ctx.client.db_index);
    let entry = db.get_mut(&key).expect("member list was non-empty");
    let set = entry.value.as_set_mut().expect("type checked above");
    for member in &picked {
        set.remove(member.as_slice());
    }
    let emptied = set.is_empty();
    db.bump(&key);
    if emptied {
        db.del(&key);
    }

    match count {
        None => RespValue::bulk(picked.into_iter().next().expect("take >= 1")),
        Some(_) => RespValue::array(picked.into_iter().map(RespValue::bulk).collect()),
    }
}

async fn cmd_srandmember(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let count = match ctx.args.get(1) {
        None => None,
        Some(raw) => match arg_i64(raw) {
            Some(n) => Some(n),
            None => return super::not_an_integer(),
        },
    };

    let mut store = ctx.store.write().await;
    let members = match read_set(store.db(ctx.client.db_index), &key) {
        Ok(set) => sorted_members(&set),
        Err(e) => return e,
    };
    if members.is_empty() {
        return match count {
            None => RespValue::null_bulk(),
            Some(_) => RespValue::array(Vec::new()),
        };
    }

    match count {
        None => {
            let pick = store.rand_index(members.len());
            RespValue::bulk(members[pick].clone())
        }
        Some(n) if n >= 0 => {
            // Distinct members, at most the cardinality.
            let mut pool = members;
            store.shuffle(&mut pool);
            RespValue::array(
                pool.into_iter()
                    .take(n as usize)
                    .map(RespValue::bulk)
                    .collect(),
            )
        }
        Some(n) => {
            // Negative count draws with repetition.
            let draws = n.unsigned_abs() as usize;
            let mut out = Vec::with_capacity(draws);
            for _ in 0..draws {
                let pick = store.rand_index(members.len());
                out.push(RespValue::bulk(members[pick].clone()));
            }
            RespValue::array(out)
        }
    }
}

async fn cmd_smove(ctx: CommandContext<'_>) -> RespValue {
    let source = arg_str(&ctx.args[0]);
    let dest = arg_str(&ctx.args[1]);
    let member = ctx.args[2].clone();

    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);

    if let Some(entry) = db.get(&dest) {
        if entry.value.as_set().is_none() {
            return wrong_type();
        }
    }

    let Some(entry) = db.get_mut(&source) else {
        return RespValue::int(0);
    };
    let Some(set) = entry.value.as_set_mut() else {
        return wrong_type();
    };
    if !set.remove(member.as_slice()) {
        return RespValue::int(0);
    }
    let emptied = set.is_empty();
    db.bump(&source);
    if emptied {
        db.del(&source);
    }

    let entry = db.get_or_create(&dest, || Value::Set(HashSet::new()));
    let set = entry.value.as_set_mut().expect("checked above");
    set.insert(member);
    db.bump(&dest);
    RespValue::int(1)
}
