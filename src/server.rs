use crate::commands::{dispatch, CommandContext, CommandGate, CommandLock, CommandRegistry};
use crate::config::SharedConfig;
use crate::connection::ClientState;
use crate::keywatcher::SharedKeyWatcher;
use crate::pubsub::{PushSender, SharedPubSub};
use crate::resp::{parse_request, Request, RespValue};
use crate::store::SharedStore;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command already registered: {0}")]
    AlreadyRegistered(String),
}

/// Shared handles every connection worker and every direct harness call
/// operates on.
#[derive(Clone)]
pub(crate) struct Shared {
    pub store: SharedStore,
    pub config: SharedConfig,
    pub pubsub: SharedPubSub,
    pub watcher: SharedKeyWatcher,
    /// The coarse per-command lock; see `CommandGate`.
    pub lock: CommandLock,
}

/// The TCP front end: accept loop, per-connection workers, command registry
/// and counters. One instance per listening socket; a restart builds a fresh
/// one over the same shared keyspace.
pub struct Server {
    addr: SocketAddr,
    registry: Arc<CommandRegistry>,
    shared: Shared,
    cancel: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
    total_commands: AtomicU64,
    total_connections: AtomicU64,
    current_clients: AtomicU64,
}

impl Server {
    /// Bind and start accepting. `addr` is `host:port`; port 0 picks an
    /// ephemeral port.
    pub(crate) async fn start(
        addr: &str,
        shared: Shared,
        registry: Arc<CommandRegistry>,
    ) -> Result<Arc<Server>, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let server = Arc::new(Server {
            addr: local,
            registry,
            shared,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
            total_commands: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            current_clients: AtomicU64::new(0),
        });
        info!("listening on {local}");

        let acceptor = server.clone();
        server.tracker.spawn(async move {
            acceptor.accept_loop(listener).await;
        });
        Ok(server)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!("connection from {peer}");
                        self.serve_stream(socket);
                    }
                    Err(e) => {
                        debug!("accept failed: {e}");
                        break;
                    }
                },
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    /// Attach any bidirectional byte stream as if it had been accepted.
    /// In-process duplex pipes work as well as real sockets.
    pub fn serve_stream<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.current_clients.fetch_add(1, Ordering::Relaxed);
        let server = self.clone();
        self.tracker.spawn(async move {
            let mut client = ClientState::new();
            if let Err(e) = server.connection_loop(stream, &mut client).await {
                debug!("connection error: {e}");
            }
            server.disconnect(&client).await;
            server.current_clients.fetch_sub(1, Ordering::Relaxed);
            debug!("connection closed");
        });
    }

    /// The per-peer worker: read a frame, dispatch, write the reply block,
    /// honour deferred close, interleave pub/sub pushes between commands.
    async fn connection_loop<S>(
        &self,
        mut stream: S,
        client: &mut ClientState,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut buf = BytesMut::with_capacity(4096);
        let (push_tx, mut push_rx) = mpsc::unbounded_channel();

        loop {
            // Drain every complete frame already buffered.
            loop {
                match parse_request(&mut buf) {
                    Ok(Some(request)) => {
                        let reply = self.process_command(request, client, &push_tx).await;
                        stream.write_all(&reply.serialize()).await?;
                        stream.flush().await?;
                        if client.should_close {
                            return Ok(());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // An unparsable frame poisons the stream; drop the peer.
                        debug!("{e}");
                        return Ok(());
                    }
                }
            }

            tokio::select! {
                read = stream.read_buf(&mut buf) => match read {
                    Ok(0) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                },
                Some(push) = push_rx.recv() => {
                    stream.write_all(&push.frame().serialize()).await?;
                    stream.flush().await?;
                }
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// Gates (auth, subscriber mode), counters, then dispatch under the
    /// command gate.
    async fn process_command(
        &self,
        mut request: Request,
        client: &mut ClientState,
        push_tx: &PushSender,
    ) -> RespValue {
        let name_raw = request.remove(0);
        let name = String::from_utf8_lossy(&name_raw).to_ascii_uppercase();
        let args = request;

        if !client.authenticated
            && self.shared.config.read().await.requirepass.is_some()
            && !matches!(name.as_str(), "AUTH" | "QUIT")
        {
            return RespValue::error("NOAUTH Authentication required.");
        }

        if client.in_subscribe_mode()
            && !matches!(
                name.as_str(),
                "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE" | "PING" | "QUIT"
            )
        {
            return RespValue::error(
                "ERR only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT allowed in this context",
            );
        }

        if self.registry.contains(&name) {
            self.total_commands.fetch_add(1, Ordering::Relaxed);
        }

        let mut gate = CommandGate::acquire(self.shared.lock.clone()).await;
        let ctx = CommandContext {
            args,
            client,
            gate: &mut gate,
            store: &self.shared.store,
            config: &self.shared.config,
            pubsub: &self.shared.pubsub,
            push_tx,
            watcher: &self.shared.watcher,
            registry: self.registry.as_ref(),
            shutdown: &self.cancel,
        };
        dispatch(name, ctx).await
    }

    /// Post-loop cleanup: a peer-owned subscriber dies with its peer.
    async fn disconnect(&self, client: &ClientState) {
        if let Some(id) = client.subscriber_id {
            self.shared.pubsub.write().await.remove(id);
        }
    }

    /// Stop accepting, cancel every worker, and wait for them to finish.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Commands dispatched to a registered handler since start.
    pub fn total_commands(&self) -> u64 {
        self.total_commands.load(Ordering::Relaxed)
    }

    /// Connections accepted (or attached) since start.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Currently connected clients.
    pub fn clients_len(&self) -> u64 {
        self.current_clients.load(Ordering::Relaxed)
    }
}
