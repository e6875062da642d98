use super::{
    arg_f64, arg_i64, arg_str, cmd, not_a_float, not_an_integer, syntax_error, wrong_type,
    CommandContext, CommandRegistry,
};
use crate::resp::RespValue;
use crate::server::ServerError;
use crate::store::Database;
use crate::types::sorted_set::ScoredSet;
use crate::types::{format_score, Value};

pub fn register(registry: &CommandRegistry) -> Result<(), ServerError> {
    cmd!(registry, "ZADD", -4, cmd_zadd);
    cmd!(registry, "ZREM", -3, cmd_zrem);
    cmd!(registry, "ZSCORE", 3, cmd_zscore);
    cmd!(registry, "ZCARD", 2, cmd_zcard);
    cmd!(registry, "ZCOUNT", 4, cmd_zcount);
    cmd!(registry, "ZINCRBY", 4, cmd_zincrby);
    cmd!(registry, "ZRANK", 3, cmd_zrank);
    cmd!(registry, "ZREVRANK", 3, cmd_zrevrank);
    cmd!(registry, "ZRANGE", -4, cmd_zrange);
    cmd!(registry, "ZREVRANGE", -4, cmd_zrevrange);
    cmd!(registry, "ZRANGEBYSCORE", -4, cmd_zrangebyscore);
    cmd!(registry, "ZREVRANGEBYSCORE", -4, cmd_zrevrangebyscore);
    cmd!(registry, "ZRANGEBYLEX", -4, cmd_zrangebylex);
    cmd!(registry, "ZREMRANGEBYRANK", 4, cmd_zremrangebyrank);
    Ok(())
}

fn read_zset(db: &mut Database, key: &str) -> Result<ScoredSet, RespValue> {
    match db.get(key) {
        Some(entry) => match entry.value.as_sorted_set() {
            Some(z) => Ok(z.clone()),
            None => Err(wrong_type()),
        },
        None => Ok(ScoredSet::new()),
    }
}

/// A score window bound: the value plus whether it is exclusive (`(` prefix).
fn parse_score_bound(raw: &[u8]) -> Option<(f64, bool)> {
    if let Some(rest) = raw.strip_prefix(b"(") {
        arg_f64(rest).map(|v| (v, true))
    } else {
        arg_f64(raw).map(|v| (v, false))
    }
}

/// A lex window bound: None is unbounded (`-`/`+`), otherwise the member
/// prefix plus exclusivity.
#[allow(clippy::type_complexity)]
fn parse_lex_bound(raw: &[u8], open: u8) -> Result<Option<(Vec<u8>, bool)>, RespValue> {
    match raw {
        [b] if *b == open => Ok(None),
        [b'(', rest @ ..] => Ok(Some((rest.to_vec(), true))),
        [b'[', rest @ ..] => Ok(Some((rest.to_vec(), false))),
        _ => Err(RespValue::error(
            "ERR min or max not valid string range item",
        )),
    }
}

fn members_reply(items: Vec<(Vec<u8>, f64)>, with_scores: bool) -> RespValue {
    let mut out = Vec::with_capacity(items.len() * if with_scores { 2 } else { 1 });
    for (member, score) in items {
        out.push(RespValue::bulk(member));
        if with_scores {
            out.push(RespValue::bulk(format_score(score)));
        }
    }
    RespValue::array(out)
}

async fn cmd_zadd(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);

    let mut nx = false;
    let mut xx = false;
    let mut ch = false;
    let mut i = 1;
    while i < ctx.args.len() {
        match arg_str(&ctx.args[i]).to_ascii_uppercase().as_str() {
            "NX" => nx = true,
            "XX" => xx = true,
            "CH" => ch = true,
            _ => break,
        }
        i += 1;
    }
    if nx && xx {
        return RespValue::error(
            "ERR XX and NX options at the same time are not compatible",
        );
    }
    let rest = &ctx.args[i..];
    if rest.is_empty() || rest.len() % 2 != 0 {
        return syntax_error();
    }

    // Validate every score before mutating anything.
    let mut pairs = Vec::with_capacity(rest.len() / 2);
    for chunk in rest.chunks(2) {
        let Some(score) = arg_f64(&chunk[0]) else {
            return not_a_float();
        };
        pairs.push((score, chunk[1].clone()));
    }

    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let entry = db.get_or_create(&key, || Value::SortedSet(ScoredSet::new()));
    let Some(zset) = entry.value.as_sorted_set_mut() else {
        return wrong_type();
    };

    let mut added = 0;
    let mut changed = 0;
    for (score, member) in pairs {
        let existing = zset.score(&member);
        match existing {
            Some(_) if nx => continue,
            None if xx => continue,
            _ => {}
        }
        if existing != Some(score) {
            changed += 1;
        }
        if zset.insert(member, score) {
            added += 1;
        }
    }
    db.bump(&key);
    RespValue::int(if ch { changed } else { added })
}

async fn cmd_zrem(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let Some(entry) = db.get_mut(&key) else {
        return RespValue::int(0);
    };
    let Some(zset) = entry.value.as_sorted_set_mut() else {
        return wrong_type();
    };
    let mut removed = 0;
    for member in &ctx.args[1..] {
        if zset.remove(member) {
            removed += 1;
        }
    }
    let emptied = zset.is_empty();
    if removed > 0 {
        db.bump(&key);
    }
    if emptied {
        db.del(&key);
    }
    RespValue::int(removed)
}

async fn cmd_zscore(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_zset(store.db(ctx.client.db_index), &key) {
        Ok(zset) => match zset.score(&ctx.args[1]) {
            Some(score) => RespValue::bulk(format_score(score)),
            None => RespValue::null_bulk(),
        },
        Err(e) => e,
    }
}

async fn cmd_zcard(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_zset(store.db(ctx.client.db_index), &key) {
        Ok(zset) => RespValue::int(zset.len() as i64),
        Err(e) => e,
    }
}

async fn cmd_zcount(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let (Some((min, min_ex)), Some((max, max_ex))) = (
        parse_score_bound(&ctx.args[1]),
        parse_score_bound(&ctx.args[2]),
    ) else {
        return RespValue::error("ERR min or max is not a float");
    };
    let mut store = ctx.store.write().await;
    match read_zset(store.db(ctx.client.db_index), &key) {
        Ok(zset) => RespValue::int(zset.count_by_score(min, min_ex, max, max_ex) as i64),
        Err(e) => e,
    }
}

async fn cmd_zincrby(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let Some(delta) = arg_f64(&ctx.args[1]) else {
        return not_a_float();
    };
    let member = ctx.args[2].clone();
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let entry = db.get_or_create(&key, || Value::SortedSet(ScoredSet::new()));
    let Some(zset) = entry.value.as_sorted_set_mut() else {
        return wrong_type();
    };
    let score = zset.increment(member, delta);
    db.bump(&key);
    RespValue::bulk(format_score(score))
}

async fn cmd_zrank(ctx: CommandContext<'_>) -> RespValue {
    rank(ctx, false).await
}

async fn cmd_zrevrank(ctx: CommandContext<'_>) -> RespValue {
    rank(ctx, true).await
}

async fn rank(ctx: CommandContext<'_>, rev: bool) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let mut store = ctx.store.write().await;
    match read_zset(store.db(ctx.client.db_index), &key) {
        Ok(zset) => {
            let rank = if rev {
                zset.rev_rank(&ctx.args[1])
            } else {
                zset.rank(&ctx.args[1])
            };
            match rank {
                Some(r) => RespValue::int(r as i64),
                None => RespValue::null_bulk(),
            }
        }
        Err(e) => e,
    }
}

async fn cmd_zrange(ctx: CommandContext<'_>) -> RespValue {
    rank_range(ctx, false).await
}

async fn cmd_zrevrange(ctx: CommandContext<'_>) -> RespValue {
    rank_range(ctx, true).await
}

async fn rank_range(ctx: CommandContext<'_>, rev: bool) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let (Some(start), Some(stop)) = (arg_i64(&ctx.args[1]), arg_i64(&ctx.args[2])) else {
        return not_an_integer();
    };
    let with_scores = match ctx.args.get(3) {
        None => false,
        Some(opt) if arg_str(opt).eq_ignore_ascii_case("WITHSCORES") => true,
        Some(_) => return syntax_error(),
    };
    if ctx.args.len() > 4 {
        return syntax_error();
    }

    let mut store = ctx.store.write().await;
    match read_zset(store.db(ctx.client.db_index), &key) {
        Ok(zset) => members_reply(zset.range_by_rank(start, stop, rev), with_scores),
        Err(e) => e,
    }
}

async fn cmd_zrangebyscore(ctx: CommandContext<'_>) -> RespValue {
    score_range(ctx, false).await
}

async fn cmd_zrevrangebyscore(ctx: CommandContext<'_>) -> RespValue {
    score_range(ctx, true).await
}

async fn score_range(ctx: CommandContext<'_>, rev: bool) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    // For the REV variant the bounds arrive max-first.
    let (lo_raw, hi_raw) = if rev {
        (&ctx.args[2], &ctx.args[1])
    } else {
        (&ctx.args[1], &ctx.args[2])
    };
    let (Some((min, min_ex)), Some((max, max_ex))) =
        (parse_score_bound(lo_raw), parse_score_bound(hi_raw))
    else {
        return RespValue::error("ERR min or max is not a float");
    };

    let mut with_scores = false;
    let mut limit: Option<(i64, i64)> = None;
    let mut i = 3;
    while i < ctx.args.len() {
        match arg_str(&ctx.args[i]).to_ascii_uppercase().as_str() {
            "WITHSCORES" => with_scores = true,
            "LIMIT" => {
                let (Some(offset), Some(count)) = (
                    ctx.args.get(i + 1).and_then(|a| arg_i64(a)),
                    ctx.args.get(i + 2).and_then(|a| arg_i64(a)),
                ) else {
                    return syntax_error();
                };
                limit = Some((offset, count));
                i += 2;
            }
            _ => return syntax_error(),
        }
        i += 1;
    }

    let mut store = ctx.store.write().await;
    let mut items = match read_zset(store.db(ctx.client.db_index), &key) {
        Ok(zset) => zset.range_by_score(min, min_ex, max, max_ex),
        Err(e) => return e,
    };
    if rev {
        items.reverse();
    }
    if let Some((offset, count)) = limit {
        let offset = offset.max(0) as usize;
        items = if count < 0 {
            items.into_iter().skip(offset).collect()
        } else {
            items.into_iter().skip(offset).take(count as usize).collect()
        };
    }
    members_reply(items, with_scores)
}

async fn cmd_zrangebylex(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let min = match parse_lex_bound(&ctx.args[1], b'-') {
        Ok(b) => b,
        Err(e) => return e,
    };
    let max = match parse_lex_bound(&ctx.args[2], b'+') {
        Ok(b) => b,
        Err(e) => return e,
    };
    if ctx.args.len() > 3 {
        return syntax_error();
    }

    let mut store = ctx.store.write().await;
    match read_zset(store.db(ctx.client.db_index), &key) {
        Ok(zset) => {
            let members = zset.range_by_lex(
                min.as_ref().map(|(b, ex)| (b.as_slice(), *ex)),
                max.as_ref().map(|(b, ex)| (b.as_slice(), *ex)),
            );
            RespValue::array(members.into_iter().map(RespValue::bulk).collect())
        }
        Err(e) => e,
    }
}

async fn cmd_zremrangebyrank(ctx: CommandContext<'_>) -> RespValue {
    let key = arg_str(&ctx.args[0]);
    let (Some(start), Some(stop)) = (arg_i64(&ctx.args[1]), arg_i64(&ctx.args[2])) else {
        return not_an_integer();
    };
    let mut store = ctx.store.write().await;
    let db = store.db(ctx.client.db_index);
    let doomed: Vec<Vec<u8>> = match read_zset(db, &key) {
        Ok(zset) => zset
            .range_by_rank(start, stop, false)
            .into_iter()
            .map(|(m, _)| m)
            .collect(),
        Err(e) => return e,
    };
    if doomed.is_empty() {
        return RespValue::int(0);
    }
    let entry = db.get_mut(&key).expect("range was non-empty");
    let zset = entry.value.as_sorted_set_mut().expect("type checked");
    for member in &doomed {
        zset.remove(member);
    }
    let emptied = zset.is_empty();
    db.bump(&key);
    if emptied {
        db.del(&key);
    }
    RespValue::int(doomed.len() as i64)
}
