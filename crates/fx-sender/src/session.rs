//! Sender-side sessions: the dial loop with exponential backoff (client
//! role), the accept loop (server role), and the per-connection read/write
//! tasks.
//!
//! Writes are funneled through an outbox channel drained by a single writer
//! task per connection, so the tracker's re-sends, the keep-alive ticker,
//! and user requests all serialize without sharing the socket.

use crate::config::{SenderClientConfig, SenderOptions, SenderServerConfig};
use crate::error::{SendError, TrackerError};
use crate::tracker::{ResponseStream, Tracker};
use fx_protocol::codec::encode_packet;
use fx_protocol::{
    PacketCodec, PacketType, Request, RequestBuilder, RequestType, Response, TriState, auth,
};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type RemoteFunctionHook =
    Box<dyn Fn(&Response) -> Option<serde_json::Value> + Send + Sync>;
pub(crate) type StatusHook = Box<dyn Fn(&Response) + Send + Sync>;
pub(crate) type ConnectListener = Box<dyn Fn(&SenderConnection) + Send + Sync>;

/// Await a bool watch channel becoming `true`.
///
/// Equivalent to `rx.wait_for(|v| *v).await`, but avoids holding the
/// non-`Send` `RwLockReadGuard` backing `watch::Ref` across the other
/// branches of a `tokio::select!` in a spawned (and therefore
/// `Send`-bound) future.
async fn wait_until_true(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Authenticating,
    Open,
    Closed,
}

pub(crate) struct SenderConnInner {
    id: u64,
    state: std::sync::Mutex<Phase>,
    tracker: Tracker,
    outbox: mpsc::UnboundedSender<Request>,
    closed_tx: watch::Sender<bool>,
}

impl SenderConnInner {
    pub(crate) fn phase(&self) -> Phase {
        *self.state.lock().expect("state mutex")
    }

    fn set_phase(&self, phase: Phase) {
        *self.state.lock().expect("state mutex") = phase;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.phase() == Phase::Open
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Terminal: stop both tasks and fail whatever the tracker still holds.
    fn close(&self, error: TrackerError) {
        self.set_phase(Phase::Closed);
        let _ = self.closed_tx.send(true);
        self.tracker.fail_all(error);
    }
}

/// Public handle to one sender-side connection.
#[derive(Clone)]
pub struct SenderConnection {
    pub(crate) inner: Arc<SenderConnInner>,
}

impl SenderConnection {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// True once the login handshake (when any) has completed.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Assign the next request id, write the request, and return its
    /// response stream. Effect requests require the connection to be open.
    pub fn send_request(&self, request: RequestBuilder) -> Result<ResponseStream, SendError> {
        self.inner.tracker.send(self.inner.is_open(), request)
    }

    /// The availability learned from the first response for `effect`.
    pub fn effect_available(&self, effect: &str) -> TriState {
        self.inner.tracker.effect_available(effect)
    }

    pub fn close(&self) {
        self.inner.close(TrackerError::Closed);
    }
}

/// State shared by the session loop, the connection tasks, and the public
/// [`Sender`](crate::Sender) handle.
pub(crate) struct SenderShared {
    pub(crate) options: SenderOptions,
    pub(crate) password: Option<String>,
    connections: tokio::sync::Mutex<HashMap<u64, Arc<SenderConnInner>>>,
    remote_functions: std::sync::Mutex<Option<RemoteFunctionHook>>,
    status_hook: std::sync::Mutex<Option<StatusHook>>,
    connect_listeners: std::sync::Mutex<Vec<ConnectListener>>,
    shutdown_tx: watch::Sender<bool>,
    next_id: AtomicU64,
}

impl SenderShared {
    pub(crate) fn new(password: Option<String>, options: SenderOptions) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(SenderShared {
            options,
            password,
            connections: tokio::sync::Mutex::new(HashMap::new()),
            remote_functions: std::sync::Mutex::new(None),
            status_hook: std::sync::Mutex::new(None),
            connect_listeners: std::sync::Mutex::new(Vec::new()),
            shutdown_tx,
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub(crate) fn set_remote_function_hook(&self, hook: RemoteFunctionHook) {
        *self.remote_functions.lock().expect("hook mutex") = Some(hook);
    }

    pub(crate) fn set_status_hook(&self, hook: StatusHook) {
        *self.status_hook.lock().expect("hook mutex") = Some(hook);
    }

    pub(crate) fn add_connect_listener(&self, listener: ConnectListener) {
        self.connect_listeners
            .lock()
            .expect("listener mutex")
            .push(listener);
    }

    pub(crate) async fn connections(&self) -> Vec<SenderConnection> {
        self.connections
            .lock()
            .await
            .values()
            .map(|inner| SenderConnection {
                inner: Arc::clone(inner),
            })
            .collect()
    }

    /// The only connection in the client role; arbitrary in the server role.
    pub(crate) async fn any_connection(&self) -> Option<SenderConnection> {
        self.connections
            .lock()
            .await
            .values()
            .next()
            .map(|inner| SenderConnection {
                inner: Arc::clone(inner),
            })
    }

    async fn remove_connection(&self, id: u64) {
        self.connections.lock().await.remove(&id);
    }

    /// Graceful: stop dialing/accepting, give every tracker its drain
    /// window, then close the connections.
    pub(crate) async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let targets: Vec<Arc<SenderConnInner>> =
            self.connections.lock().await.values().cloned().collect();
        let drains = targets
            .iter()
            .map(|conn| conn.tracker.shutdown())
            .collect::<Vec<_>>();
        futures_util::future::join_all(drains).await;
        for conn in targets {
            conn.close(TrackerError::Shutdown);
        }
    }

    /// Adopt a freshly established stream: spawn its writer and read tasks
    /// and notify connect listeners before the first packet is processed.
    async fn adopt(self: &Arc<Self>, stream: TcpStream, phase: Phase) -> Arc<SenderConnInner> {
        let (read_half, write_half) = stream.into_split();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(SenderConnInner {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            state: std::sync::Mutex::new(phase),
            tracker: Tracker::new(outbox_tx.clone(), self.options.clone()),
            outbox: outbox_tx,
            closed_tx,
        });
        self.connections
            .lock()
            .await
            .insert(inner.id, Arc::clone(&inner));

        let handle = SenderConnection {
            inner: Arc::clone(&inner),
        };
        for listener in self.connect_listeners.lock().expect("listener mutex").iter() {
            listener(&handle);
        }

        tokio::spawn(run_writer(
            outbox_rx,
            Box::new(write_half) as BoxedWriter,
            Arc::clone(&inner),
        ));
        tokio::spawn(run_read_loop(
            Arc::clone(&inner),
            Box::new(read_half) as BoxedReader,
            Arc::clone(self),
        ));
        inner
    }
}

/// Drain the outbox onto the socket; the single writer per connection.
async fn run_writer(
    mut outbox: mpsc::UnboundedReceiver<Request>,
    mut writer: BoxedWriter,
    conn: Arc<SenderConnInner>,
) {
    let mut closed = conn.closed_signal();
    loop {
        tokio::select! {
            biased;
            _ = wait_until_true(&mut closed) => break,
            request = outbox.recv() => match request {
                None => break,
                Some(request) => {
                    let bytes = match encode_packet(&request) {
                        Ok(bytes) => bytes,
                        Err(error) => {
                            warn!(conn = conn.id, error = %error, "dropping unencodable request");
                            continue;
                        }
                    };
                    if let Err(error) = writer.write_all(&bytes).await {
                        warn!(conn = conn.id, error = %error, "write failed");
                        conn.close(TrackerError::Closed);
                        break;
                    }
                    let _ = writer.flush().await;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Decode inbound responses and drive the handshake, the tracker, and the
/// keep-alive ticker.
pub(crate) async fn run_read_loop(
    conn: Arc<SenderConnInner>,
    reader: BoxedReader,
    shared: Arc<SenderShared>,
) {
    let mut frames = FramedRead::new(reader, PacketCodec::<Response>::new());
    let mut closed = conn.closed_signal();
    let mut keep_alive = shared
        .options
        .keep_alive_interval
        .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));
    loop {
        tokio::select! {
            biased;
            _ = wait_until_true(&mut closed) => break,
            _ = tick(keep_alive.as_mut()) => {
                if conn.is_open() {
                    if let Ok(ping) = Request::builder(RequestType::KeepAlive).build() {
                        let _ = conn.outbox.send(ping);
                    }
                }
            }
            frame = frames.next() => match frame {
                None => {
                    debug!(conn = conn.id, "peer disconnected");
                    conn.close(TrackerError::Closed);
                    break;
                }
                Some(Err(error)) => {
                    warn!(conn = conn.id, error = %error, "read failed");
                    conn.close(TrackerError::Closed);
                    break;
                }
                Some(Ok(Err(bad_frame))) => {
                    warn!(conn = conn.id, error = %bad_frame, "skipping unparseable frame");
                }
                Some(Ok(Ok(response))) => handle_response(&conn, &shared, response),
            }
        }
    }
    shared.remove_connection(conn.id).await;
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn handle_response(conn: &Arc<SenderConnInner>, shared: &Arc<SenderShared>, response: Response) {
    match conn.phase() {
        Phase::Authenticating => match response.packet {
            PacketType::Login => match &shared.password {
                Some(password) => {
                    debug!(conn = conn.id, "answering login challenge");
                    match Request::builder(RequestType::Login)
                        .password(auth::hash_password(password))
                        .build()
                    {
                        Ok(login) => {
                            let _ = conn.outbox.send(login);
                        }
                        Err(error) => warn!(conn = conn.id, error = %error, "bad login request"),
                    }
                }
                None => {
                    warn!(conn = conn.id, "challenged but no password configured");
                    conn.close(TrackerError::Closed);
                }
            },
            PacketType::LoginSuccess => {
                info!(conn = conn.id, "login accepted");
                conn.set_phase(Phase::Open);
            }
            PacketType::Disconnect => {
                warn!(conn = conn.id, reason = ?response.message, "disconnected during login");
                conn.close(TrackerError::Closed);
            }
            _ => {
                // An unauthenticated peer skips the handshake entirely.
                debug!(conn = conn.id, "peer did not challenge; treating as open");
                conn.set_phase(Phase::Open);
                handle_open(conn, shared, &response);
            }
        },
        Phase::Open => handle_open(conn, shared, &response),
        Phase::Closed => debug!(conn = conn.id, "dropping packet on closed connection"),
    }
}

fn handle_open(conn: &Arc<SenderConnInner>, shared: &Arc<SenderShared>, response: &Response) {
    match response.packet {
        PacketType::EffectResult => conn.tracker.handle_response(response),
        PacketType::EffectStatus => {
            if let Some(hook) = shared.status_hook.lock().expect("hook mutex").as_ref() {
                hook(response);
            }
        }
        PacketType::RemoteFunction => {
            let value = shared
                .remote_functions
                .lock()
                .expect("hook mutex")
                .as_ref()
                .and_then(|hook| hook(response));
            match value {
                Some(value) => {
                    match Request::builder(RequestType::RemoteFunctionResult)
                        .value(value)
                        .build()
                    {
                        Ok(reply) => {
                            let _ = conn.outbox.send(reply);
                        }
                        Err(error) => {
                            warn!(conn = conn.id, error = %error, "bad remote function reply");
                        }
                    }
                }
                None => debug!(conn = conn.id, method = ?response.method, "remote function unanswered"),
            }
        }
        PacketType::KeepAlive => debug!(conn = conn.id, "keep-alive"),
        PacketType::Disconnect => {
            info!(conn = conn.id, reason = ?response.message, "peer disconnected us");
            conn.close(TrackerError::Closed);
        }
        PacketType::Login | PacketType::LoginSuccess => {
            debug!(conn = conn.id, "unexpected login packet while open; ignored");
        }
    }
}

/// Client role: dial the configured game server, redialing with exponential
/// backoff starting at one second and resetting after each success.
pub(crate) async fn run_dial_loop(shared: Arc<SenderShared>, config: SenderClientConfig) {
    let mut shutdown = shared.shutdown_signal();
    let mut backoff = Duration::from_secs(1);
    loop {
        if shared.is_shutting_down() {
            break;
        }
        match TcpStream::connect((config.host.as_str(), config.port)).await {
            Ok(stream) => {
                info!(host = %config.host, port = config.port, "connected to game");
                backoff = Duration::from_secs(1);
                let conn = shared.adopt(stream, Phase::Authenticating).await;
                let mut closed = conn.closed_signal();
                tokio::select! {
                    biased;
                    _ = wait_until_true(&mut shutdown) => break,
                    _ = wait_until_true(&mut closed) => {
                        debug!("connection ended; redialing");
                    }
                }
            }
            Err(error) => {
                warn!(
                    host = %config.host,
                    port = config.port,
                    error = %error,
                    delay_s = backoff.as_secs(),
                    "connect failed; backing off"
                );
                tokio::select! {
                    biased;
                    _ = wait_until_true(&mut shutdown) => break,
                    () = tokio::time::sleep(backoff) => {}
                }
                backoff *= 2;
            }
        }
    }
}

/// Server role: accept dialing games; they are open immediately (only a
/// game-hosted server challenges, because only requests carry a password).
pub(crate) async fn run_accept_loop(shared: Arc<SenderShared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown_signal();
    loop {
        tokio::select! {
            biased;
            _ = wait_until_true(&mut shutdown) => {
                info!("accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "game connected");
                    let _conn = shared.adopt(stream, Phase::Open).await;
                }
                Err(error) => {
                    warn!(error = %error, "accept failed");
                }
            }
        }
    }
}

/// Bind the server-role listener.
pub(crate) async fn bind_server(config: &SenderServerConfig) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = listener.local_addr()?.port(), "listening for games");
    Ok(listener)
}
