pub mod connection;
pub mod hash;
pub mod key;
pub mod list;
pub mod pubsub;
pub mod scripting;
pub mod set;
pub mod sorted_set;
pub mod string;
pub mod transaction;

use crate::config::SharedConfig;
use crate::connection::ClientState;
use crate::keywatcher::SharedKeyWatcher;
use crate::pubsub::{PushSender, SharedPubSub};
use crate::resp::{Request, RespValue};
use crate::server::ServerError;
use crate::store::SharedStore;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// The lock serialising command execution. One command (or one direct
/// harness call) runs at a time, which is what makes EXEC atomic against
/// other connections.
pub type CommandLock = Arc<Mutex<()>>;

/// Holds the command lock for the duration of one command. Blocking
/// commands release it while parked and re-acquire before re-checking their
/// predicate, like a wait on a condition variable tied to the big lock.
pub struct CommandGate {
    lock: CommandLock,
    guard: Option<OwnedMutexGuard<()>>,
}

impl CommandGate {
    pub async fn acquire(lock: CommandLock) -> Self {
        let guard = lock.clone().lock_owned().await;
        CommandGate {
            lock,
            guard: Some(guard),
        }
    }

    pub fn release(&mut self) {
        self.guard.take();
    }

    pub async fn reacquire(&mut self) {
        if self.guard.is_none() {
            self.guard = Some(self.lock.clone().lock_owned().await);
        }
    }
}

/// Everything a command handler can touch, borrowed for the lifetime of one
/// dispatch.
pub struct CommandContext<'a> {
    /// Arguments after the command name, raw bytes.
    pub args: Request,
    pub client: &'a mut ClientState,
    pub gate: &'a mut CommandGate,
    pub store: &'a SharedStore,
    pub config: &'a SharedConfig,
    pub pubsub: &'a SharedPubSub,
    /// This connection's push queue, used for pub/sub confirmations beyond
    /// the first and for server pushes.
    pub push_tx: &'a PushSender,
    pub watcher: &'a SharedKeyWatcher,
    pub registry: &'a CommandRegistry,
    /// Fired on server shutdown so parked blocking commands give up.
    pub shutdown: &'a CancellationToken,
}

pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = RespValue> + Send + 'a>>;

/// A command handler: a plain function from context to boxed reply future.
pub type Handler = for<'a> fn(CommandContext<'a>) -> CommandFuture<'a>;

#[derive(Clone, Copy)]
struct CommandSpec {
    /// Redis-style arity: positive means the exact token count including
    /// the command name; negative means a minimum.
    arity: i32,
    handler: Handler,
}

/// The command table: uppercased name → handler. Registration is allowed at
/// any time, including while the server is accepting connections, so command
/// groups can be installed in any order during setup.
#[derive(Default)]
pub struct CommandRegistry {
    cmds: RwLock<HashMap<String, CommandSpec>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        CommandRegistry::default()
    }

    /// Add a handler under the uppercased command name. Fails if the name is
    /// already taken.
    pub fn register(&self, name: &str, arity: i32, handler: Handler) -> Result<(), ServerError> {
        let name = name.to_ascii_uppercase();
        let mut cmds = self.cmds.write().expect("registry lock poisoned");
        if cmds.contains_key(&name) {
            return Err(ServerError::AlreadyRegistered(name));
        }
        cmds.insert(name, CommandSpec { arity, handler });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cmds
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    fn spec(&self, name: &str) -> Option<CommandSpec> {
        self.cmds
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .copied()
    }

    fn arity_of(&self, name: &str) -> Option<i32> {
        self.spec(name).map(|s| s.arity)
    }
}

fn arity_matches(arity: i32, tokens: usize) -> bool {
    if arity >= 0 {
        tokens == arity as usize
    } else {
        tokens >= (-arity) as usize
    }
}

/// Look the command up and run it, or queue it when the client is inside
/// MULTI. `name` must already be uppercased.
pub fn dispatch<'a>(name: String, ctx: CommandContext<'a>) -> CommandFuture<'a> {
    Box::pin(async move {
        if ctx.client.in_multi && !transaction_control(&name) {
            return queue_for_exec(name, ctx);
        }

        let Some(spec) = ctx.registry.spec(&name) else {
            return unknown_command(&name, &ctx.args);
        };
        if !arity_matches(spec.arity, ctx.args.len() + 1) {
            return wrong_arg_count(&name.to_lowercase());
        }
        (spec.handler)(ctx).await
    })
}

/// Commands that act on the transaction itself and are never queued.
fn transaction_control(name: &str) -> bool {
    matches!(name, "MULTI" | "EXEC" | "DISCARD" | "WATCH" | "UNWATCH")
}

/// Inside MULTI: validate the command syntactically, then buffer it. A bad
/// command poisons the transaction (EXEC will abort) but queueing continues.
fn queue_for_exec(name: String, ctx: CommandContext<'_>) -> RespValue {
    match ctx.registry.arity_of(&name) {
        None => {
            ctx.client.multi_error = true;
            unknown_command(&name, &ctx.args)
        }
        Some(arity) if !arity_matches(arity, ctx.args.len() + 1) => {
            ctx.client.multi_error = true;
            wrong_arg_count(&name.to_lowercase())
        }
        Some(_) => {
            ctx.client.multi_queue.push((name, ctx.args));
            RespValue::simple("QUEUED")
        }
    }
}

/// Install every built-in command group.
pub fn register_all(registry: &CommandRegistry) -> Result<(), ServerError> {
    connection::register(registry)?;
    key::register(registry)?;
    string::register(registry)?;
    hash::register(registry)?;
    list::register(registry)?;
    set::register(registry)?;
    sorted_set::register(registry)?;
    pubsub::register(registry)?;
    transaction::register(registry)?;
    scripting::register(registry)?;
    Ok(())
}

/// Registration shorthand: adapts an `async fn(CommandContext<'_>) ->
/// RespValue` into the boxed handler shape.
macro_rules! cmd {
    ($registry:expr, $name:expr, $arity:expr, $handler:path) => {{
        fn shim<'a>(
            ctx: $crate::commands::CommandContext<'a>,
        ) -> $crate::commands::CommandFuture<'a> {
            Box::pin($handler(ctx))
        }
        $registry.register($name, $arity, shim)?;
    }};
}
pub(crate) use cmd;

// ---- argument helpers ----

/// Decode an argument as text. Keys, fields, channels and option words go
/// through here; payloads stay raw bytes.
pub fn arg_str(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

pub fn arg_i64(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.trim().parse().ok()
}

pub fn arg_f64(arg: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(arg).ok()?.trim();
    match s.to_ascii_lowercase().as_str() {
        "inf" | "+inf" | "infinity" | "+infinity" => return Some(f64::INFINITY),
        "-inf" | "-infinity" => return Some(f64::NEG_INFINITY),
        _ => {}
    }
    let v: f64 = s.parse().ok()?;
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

// ---- error replies ----

pub fn wrong_arg_count(cmd: &str) -> RespValue {
    RespValue::error(format!("ERR wrong number of arguments for '{cmd}' command"))
}

pub fn wrong_type() -> RespValue {
    RespValue::error("WRONGTYPE Operation against a key holding the wrong kind of value")
}

pub fn syntax_error() -> RespValue {
    RespValue::error("ERR syntax error")
}

pub fn not_an_integer() -> RespValue {
    RespValue::error("ERR value is not an integer or out of range")
}

pub fn not_a_float() -> RespValue {
    RespValue::error("ERR value is not a valid float")
}

pub fn unknown_command(cmd: &str, args: &[Vec<u8>]) -> RespValue {
    let mut msg = format!("ERR unknown command `{cmd}`, with args beginning with: ");
    for arg in args.iter().take(20) {
        msg.push('`');
        msg.push_str(&arg_str(arg));
        msg.push_str("`, ");
    }
    RespValue::error(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop<'a>(_ctx: CommandContext<'a>) -> CommandFuture<'a> {
        Box::pin(async { RespValue::ok() })
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = CommandRegistry::new();
        registry.register("get", 2, noop).unwrap();
        assert!(registry.contains("GET"));
        assert!(matches!(
            registry.register("GET", 2, noop),
            Err(ServerError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn arity_rules() {
        assert!(arity_matches(2, 2));
        assert!(!arity_matches(2, 3));
        assert!(arity_matches(-3, 3));
        assert!(arity_matches(-3, 7));
        assert!(!arity_matches(-3, 2));
    }

    #[test]
    fn unknown_command_echoes_backticked_args() {
        let args = vec![b"a".to_vec(), b"b".to_vec()];
        let reply = unknown_command("NOPE", &args);
        assert_eq!(
            reply,
            RespValue::error("ERR unknown command `NOPE`, with args beginning with: `a`, `b`, ")
        );
    }

    #[test]
    fn unknown_command_truncates_to_twenty_args() {
        let args: Vec<Vec<u8>> = (0..30).map(|i| format!("a{i}").into_bytes()).collect();
        let RespValue::Error(msg) = unknown_command("X", &args) else {
            panic!("expected error reply");
        };
        assert_eq!(msg.matches('`').count(), 2 + 2 * 20);
    }

    #[test]
    fn float_arguments() {
        assert_eq!(arg_f64(b"1.5"), Some(1.5));
        assert_eq!(arg_f64(b"+inf"), Some(f64::INFINITY));
        assert_eq!(arg_f64(b"-inf"), Some(f64::NEG_INFINITY));
        assert_eq!(arg_f64(b"nan"), None);
        assert_eq!(arg_f64(b"abc"), None);
    }
}
