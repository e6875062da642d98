use super::{arg_str, cmd, dispatch, CommandContext, CommandRegistry};
use crate::resp::RespValue;
use crate::server::ServerError;

pub fn register(registry: &CommandRegistry) -> Result<(), ServerError> {
    cmd!(registry, "MULTI", 1, cmd_multi);
    cmd!(registry, "EXEC", 1, cmd_exec);
    cmd!(registry, "DISCARD", 1, cmd_discard);
    cmd!(registry, "WATCH", -2, cmd_watch);
    cmd!(registry, "UNWATCH", 1, cmd_unwatch);
    Ok(())
}

async fn cmd_multi(ctx: CommandContext<'_>) -> RespValue {
    if ctx.client.in_multi {
        return RespValue::error("ERR MULTI calls can not be nested");
    }
    ctx.client.in_multi = true;
    ctx.client.multi_queue.clear();
    ctx.client.multi_error = false;
    RespValue::ok()
}

/// Run the queued commands. The command gate stays held for the whole replay,
/// so the transaction is atomic against every other connection.
async fn cmd_exec(mut ctx: CommandContext<'_>) -> RespValue {
    if !ctx.client.in_multi {
        return RespValue::error("ERR EXEC without MULTI");
    }
    ctx.client.in_multi = false;

    if ctx.client.multi_error {
        ctx.client.clear_transaction();
        return RespValue::error("EXECABORT Transaction discarded because of previous errors.");
    }

    // Optimistic check: a watched key whose version moved aborts the whole
    // transaction with a null array.
    {
        let store = ctx.store.read().await;
        for (db, key, seen) in &ctx.client.watched_keys {
            if store.key_version(*db, key) != *seen {
                drop(store);
                ctx.client.clear_transaction();
                return RespValue::null_array();
            }
        }
    }

    let queue = std::mem::take(&mut ctx.client.multi_queue);
    ctx.client.watched_keys.clear();

    ctx.client.in_exec = true;
    let mut replies = Vec::with_capacity(queue.len());
    for (name, args) in queue {
        let sub = CommandContext {
            args,
            client: &mut *ctx.client,
            gate: &mut *ctx.gate,
            store: ctx.store,
            config: ctx.config,
            pubsub: ctx.pubsub,
            push_tx: ctx.push_tx,
            watcher: ctx.watcher,
            registry: ctx.registry,
            shutdown: ctx.shutdown,
        };
        replies.push(dispatch(name, sub).await);
    }
    ctx.client.in_exec = false;

    RespValue::array(replies)
}

async fn cmd_discard(ctx: CommandContext<'_>) -> RespValue {
    if !ctx.client.in_multi {
        return RespValue::error("ERR DISCARD without MULTI");
    }
    ctx.client.clear_transaction();
    RespValue::ok()
}

/// Record the current version of each key under the selected database.
/// Untouched keys record version 0, so creation is an observable change.
async fn cmd_watch(ctx: CommandContext<'_>) -> RespValue {
    if ctx.client.in_multi {
        return RespValue::error("ERR WATCH inside MULTI is not allowed");
    }
    let db_index = ctx.client.db_index;
    let store = ctx.store.read().await;
    for raw in &ctx.args {
        let key = arg_str(raw);
        let version = store.key_version(db_index, &key);
        ctx.client.watched_keys.push((db_index, key, version));
    }
    RespValue::ok()
}

async fn cmd_unwatch(ctx: CommandContext<'_>) -> RespValue {
    ctx.client.watched_keys.clear();
    RespValue::ok()
}
