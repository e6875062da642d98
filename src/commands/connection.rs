use super::{arg_i64, arg_str, cmd, CommandContext, CommandRegistry};
use crate::resp::RespValue;
use crate::server::ServerError;

pub fn register(registry: &CommandRegistry) -> Result<(), ServerError> {
    cmd!(registry, "AUTH", 2, cmd_auth);
    cmd!(registry, "PING", -1, cmd_ping);
    cmd!(registry, "ECHO", 2, cmd_echo);
    cmd!(registry, "QUIT", 1, cmd_quit);
    cmd!(registry, "SELECT", 2, cmd_select);
    cmd!(registry, "SWAPDB", 3, cmd_swapdb);
    cmd!(registry, "DBSIZE", 1, cmd_dbsize);
    cmd!(registry, "FLUSHDB", 1, cmd_flushdb);
    cmd!(registry, "FLUSHALL", 1, cmd_flushall);
    Ok(())
}

async fn cmd_auth(ctx: CommandContext<'_>) -> RespValue {
    let given = arg_str(&ctx.args[0]);
    let expected = ctx.config.read().await.requirepass.clone();
    match expected {
        None => RespValue::error("ERR Client sent AUTH, but no password is set"),
        Some(pw) if pw == given => {
            ctx.client.authenticated = true;
            RespValue::ok()
        }
        Some(_) => RespValue::error("ERR invalid password"),
    }
}

async fn cmd_ping(ctx: CommandContext<'_>) -> RespValue {
    match ctx.args.first() {
        None => RespValue::simple("PONG"),
        Some(msg) => RespValue::bulk(msg.clone()),
    }
}

async fn cmd_echo(ctx: CommandContext<'_>) -> RespValue {
    RespValue::bulk(ctx.args[0].clone())
}

/// Reply OK and mark the connection for deferred close: the worker tears the
/// socket down only after this reply has been flushed.
async fn cmd_quit(ctx: CommandContext<'_>) -> RespValue {
    ctx.client.should_close = true;
    RespValue::ok()
}

async fn cmd_select(ctx: CommandContext<'_>) -> RespValue {
    let index = match arg_i64(&ctx.args[0]) {
        Some(i) if i >= 0 => i as usize,
        Some(_) => return RespValue::error("ERR DB index is out of range"),
        None => return RespValue::error("ERR invalid DB index"),
    };
    if index >= ctx.config.read().await.databases {
        return RespValue::error("ERR DB index is out of range");
    }
    ctx.client.db_index = index;
    RespValue::ok()
}

async fn cmd_swapdb(ctx: CommandContext<'_>) -> RespValue {
    let limit = ctx.config.read().await.databases;
    let mut indexes = [0usize; 2];
    for (slot, arg) in indexes.iter_mut().zip(&ctx.args) {
        match arg_i64(arg) {
            Some(i) if i >= 0 && (i as usize) < limit => *slot = i as usize,
            Some(_) => return RespValue::error("ERR DB index is out of range"),
            None => return RespValue::error("ERR invalid DB index"),
        }
    }
    ctx.store.write().await.swap_dbs(indexes[0], indexes[1]);
    RespValue::ok()
}

async fn cmd_dbsize(ctx: CommandContext<'_>) -> RespValue {
    let mut store = ctx.store.write().await;
    let len = store.db(ctx.client.db_index).len();
    RespValue::int(len as i64)
}

async fn cmd_flushdb(ctx: CommandContext<'_>) -> RespValue {
    let mut store = ctx.store.write().await;
    store.db(ctx.client.db_index).flush();
    RespValue::ok()
}

async fn cmd_flushall(ctx: CommandContext<'_>) -> RespValue {
    let limit = ctx.config.read().await.databases;
    let mut store = ctx.store.write().await;
    for index in 0..limit {
        if store.db_if_exists(index).is_some() {
            store.db(index).flush();
        }
    }
    RespValue::ok()
}
