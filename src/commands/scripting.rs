use super::{arg_str, cmd, wrong_arg_count, CommandContext, CommandRegistry};
use crate::resp::RespValue;
use crate::server::ServerError;

pub fn register(registry: &CommandRegistry) -> Result<(), ServerError> {
    cmd!(registry, "SCRIPT", -2, cmd_script);
    cmd!(registry, "EVAL", -3, cmd_eval);
    cmd!(registry, "EVALSHA", -3, cmd_evalsha);
    Ok(())
}

/// SHA1 hex digest of a script body, the key into the script cache.
pub fn script_sha1(source: &str) -> String {
    sha1_smol::Sha1::from(source).digest().to_string()
}

async fn cmd_script(ctx: CommandContext<'_>) -> RespValue {
    let sub = arg_str(&ctx.args[0]).to_ascii_uppercase();
    match sub.as_str() {
        "LOAD" => {
            if ctx.args.len() != 2 {
                return wrong_arg_count("script|load");
            }
            let source = arg_str(&ctx.args[1]);
            let sha = script_sha1(&source);
            let mut store = ctx.store.write().await;
            store.scripts.insert(sha.clone(), source);
            RespValue::bulk(sha)
        }
        "EXISTS" => {
            let store = ctx.store.read().await;
            RespValue::array(
                ctx.args[1..]
                    .iter()
                    .map(|raw| {
                        let sha = arg_str(raw).to_lowercase();
                        RespValue::int(store.scripts.contains_key(&sha) as i64)
                    })
                    .collect(),
            )
        }
        "FLUSH" => {
            ctx.store.write().await.scripts.clear();
            RespValue::ok()
        }
        other => RespValue::error(format!(
            "ERR Unknown SCRIPT subcommand or wrong number of arguments for '{other}'"
        )),
    }
}

/// Script bodies are cached but never executed; evaluation needs a Lua
/// engine this server deliberately does not carry.
async fn cmd_eval(_ctx: CommandContext<'_>) -> RespValue {
    RespValue::error("ERR script execution is not supported by this server")
}

async fn cmd_evalsha(ctx: CommandContext<'_>) -> RespValue {
    let sha = arg_str(&ctx.args[0]).to_lowercase();
    let store = ctx.store.read().await;
    if !store.scripts.contains_key(&sha) {
        return RespValue::error(
            "NOSCRIPT No matching script. Please use EVAL.",
        );
    }
    RespValue::error("ERR script execution is not supported by this server")
}
