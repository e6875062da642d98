use super::{arg_str, cmd, wrong_arg_count, CommandContext, CommandRegistry};
use crate::pubsub::Push;
use crate::resp::RespValue;
use crate::server::ServerError;

pub fn register(registry: &CommandRegistry) -> Result<(), ServerError> {
    cmd!(registry, "SUBSCRIBE", -2, cmd_subscribe);
    cmd!(registry, "UNSUBSCRIBE", -1, cmd_unsubscribe);
    cmd!(registry, "PSUBSCRIBE", -2, cmd_psubscribe);
    cmd!(registry, "PUNSUBSCRIBE", -1, cmd_punsubscribe);
    cmd!(registry, "PUBLISH", 3, cmd_publish);
    cmd!(registry, "PUBSUB", -2, cmd_pubsub);
    Ok(())
}

fn confirmation(action: &str, subject: Option<&str>, count: usize) -> RespValue {
    RespValue::array(vec![
        RespValue::bulk(action),
        match subject {
            Some(s) => RespValue::bulk(s.as_bytes()),
            None => RespValue::null_bulk(),
        },
        RespValue::int(count as i64),
    ])
}

/// One confirmation frame per channel: the first is the command reply, the
/// rest ride the connection's push queue so they hit the wire in order.
fn deliver(ctx: &CommandContext<'_>, mut confirmations: Vec<RespValue>) -> RespValue {
    let first = confirmations.remove(0);
    for frame in confirmations {
        let _ = ctx.push_tx.send(Push::Frame(frame));
    }
    first
}

/// The peer's subscriber registry entry, created on its first subscription.
async fn subscriber_id(ctx: &mut CommandContext<'_>) -> u64 {
    match ctx.client.subscriber_id {
        Some(id) => id,
        None => {
            let id = ctx.pubsub.write().await.add(ctx.push_tx.clone());
            ctx.client.subscriber_id = Some(id);
            id
        }
    }
}

/// Once the last subscription is gone the peer leaves subscriber mode and
/// its registry entry is dropped.
async fn maybe_end_subscriber(ctx: &mut CommandContext<'_>) {
    if ctx.client.subscriptions == 0 {
        if let Some(id) = ctx.client.subscriber_id.take() {
            ctx.pubsub.write().await.remove(id);
        }
    }
}

async fn cmd_subscribe(mut ctx: CommandContext<'_>) -> RespValue {
    let id = subscriber_id(&mut ctx).await;
    let mut registry = ctx.pubsub.write().await;
    let mut confirmations = Vec::with_capacity(ctx.args.len());
    for raw in &ctx.args {
        let channel = arg_str(raw);
        let count = registry.subscribe(id, &channel);
        ctx.client.subscriptions = count;
        confirmations.push(confirmation("subscribe", Some(channel.as_str()), count));
    }
    drop(registry);
    deliver(&ctx, confirmations)
}

async fn cmd_psubscribe(mut ctx: CommandContext<'_>) -> RespValue {
    let id = subscriber_id(&mut ctx).await;
    let mut registry = ctx.pubsub.write().await;
    let mut confirmations = Vec::with_capacity(ctx.args.len());
    for raw in &ctx.args {
        let pattern = arg_str(raw);
        let count = registry.psubscribe(id, &pattern);
        ctx.client.subscriptions = count;
        confirmations.push(confirmation("psubscribe", Some(pattern.as_str()), count));
    }
    drop(registry);
    deliver(&ctx, confirmations)
}

async fn cmd_unsubscribe(mut ctx: CommandContext<'_>) -> RespValue {
    let id = match ctx.client.subscriber_id {
        Some(id) => id,
        None => return confirmation("unsubscribe", None, 0),
    };
    let mut registry = ctx.pubsub.write().await;
    let channels: Vec<String> = if ctx.args.is_empty() {
        registry.channel_list(id)
    } else {
        ctx.args.iter().map(|a| arg_str(a)).collect()
    };
    if channels.is_empty() {
        let count = registry.subscription_count(id);
        ctx.client.subscriptions = count;
        drop(registry);
        maybe_end_subscriber(&mut ctx).await;
        return confirmation("unsubscribe", None, count);
    }
    let mut confirmations = Vec::with_capacity(channels.len());
    for channel in &channels {
        let count = registry.unsubscribe(id, channel);
        ctx.client.subscriptions = count;
        confirmations.push(confirmation("unsubscribe", Some(channel.as_str()), count));
    }
    drop(registry);
    maybe_end_subscriber(&mut ctx).await;
    deliver(&ctx, confirmations)
}

async fn cmd_punsubscribe(mut ctx: CommandContext<'_>) -> RespValue {
    let id = match ctx.client.subscriber_id {
        Some(id) => id,
        None => return confirmation("punsubscribe", None, 0),
    };
    let mut registry = ctx.pubsub.write().await;
    let patterns: Vec<String> = if ctx.args.is_empty() {
        registry.pattern_list(id)
    } else {
        ctx.args.iter().map(|a| arg_str(a)).collect()
    };
    if patterns.is_empty() {
        let count = registry.subscription_count(id);
        ctx.client.subscriptions = count;
        drop(registry);
        maybe_end_subscriber(&mut ctx).await;
        return confirmation("punsubscribe", None, count);
    }
    let mut confirmations = Vec::with_capacity(patterns.len());
    for pattern in &patterns {
        let count = registry.punsubscribe(id, pattern);
        ctx.client.subscriptions = count;
        confirmations.push(confirmation("punsubscribe", Some(pattern.as_str()), count));
    }
    drop(registry);
    maybe_end_subscriber(&mut ctx).await;
    deliver(&ctx, confirmations)
}

async fn cmd_publish(ctx: CommandContext<'_>) -> RespValue {
    let channel = arg_str(&ctx.args[0]);
    let delivered = ctx.pubsub.read().await.publish(&channel, &ctx.args[1]);
    RespValue::int(delivered as i64)
}

async fn cmd_pubsub(ctx: CommandContext<'_>) -> RespValue {
    let sub = arg_str(&ctx.args[0]).to_ascii_uppercase();
    let registry = ctx.pubsub.read().await;
    match sub.as_str() {
        "CHANNELS" => {
            if ctx.args.len() > 2 {
                return wrong_arg_count("pubsub");
            }
            let pattern = ctx.args.get(1).map(|a| arg_str(a));
            RespValue::array(
                registry
                    .active_channels(pattern.as_deref())
                    .into_iter()
                    .map(RespValue::bulk)
                    .collect(),
            )
        }
        "NUMSUB" => {
            let channels: Vec<String> = ctx.args[1..].iter().map(|a| arg_str(a)).collect();
            let mut out = Vec::with_capacity(channels.len() * 2);
            for (channel, count) in registry.numsub(&channels) {
                out.push(RespValue::bulk(channel));
                out.push(RespValue::int(count as i64));
            }
            RespValue::array(out)
        }
        "NUMPAT" => {
            if ctx.args.len() > 1 {
                return wrong_arg_count("pubsub");
            }
            RespValue::int(registry.numpat() as i64)
        }
        other => RespValue::error(format!(
            "ERR Unknown PUBSUB subcommand or wrong number of arguments for '{other}'"
        )),
    }
}
