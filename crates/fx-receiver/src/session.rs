//! Session management: ownership of the connection set, the server accept
//! loop, and the client dial loop with exponential backoff.

use crate::config::{ClientConfig, ServerConfig};
use crate::connection::{ConnState, Connection, ConnectionInner, run_read_loop};
use crate::error::WriteError;
use crate::router::Registry;
use fx_protocol::{Request, Response, Source};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub(crate) type ConnectListener = Box<dyn Fn(&Connection) + Send + Sync>;
pub(crate) type RemoteResultHook = Box<dyn Fn(&Request) + Send + Sync>;

/// Await a bool watch channel becoming `true`.
///
/// Equivalent to `rx.wait_for(|v| *v).await`, but avoids holding the
/// non-`Send` `RwLockReadGuard` backing `watch::Ref` across the other
/// branches of a `tokio::select!` in a spawned (and therefore
/// `Send`-bound) future.
pub(crate) async fn wait_until_true(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// State shared by the session loop, every connection read task, and the
/// public [`Receiver`](crate::Receiver) handle.
pub(crate) struct Shared {
    pub(crate) registry: Registry,
    pub(crate) password: Option<String>,
    connections: tokio::sync::Mutex<HashMap<u64, Arc<ConnectionInner>>>,
    connect_listeners: std::sync::Mutex<Vec<ConnectListener>>,
    remote_results: std::sync::Mutex<Option<RemoteResultHook>>,
    shutdown_tx: watch::Sender<bool>,
    next_id: AtomicU64,
}

impl Shared {
    pub(crate) fn new(password: Option<String>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Shared {
            registry: Registry::default(),
            password,
            connections: tokio::sync::Mutex::new(HashMap::new()),
            connect_listeners: std::sync::Mutex::new(Vec::new()),
            remote_results: std::sync::Mutex::new(None),
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

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn insert_connection(&self, conn: Arc<ConnectionInner>) {
        self.connections.lock().await.insert(conn.id(), conn);
    }

    pub(crate) async fn remove_connection(&self, id: u64) {
        self.connections.lock().await.remove(&id);
    }

    pub(crate) async fn connections(&self) -> Vec<Connection> {
        self.connections
            .lock()
            .await
            .values()
            .map(|inner| Connection {
                inner: Arc::clone(inner),
            })
            .collect()
    }

    /// Union of every connection's attached source, where known.
    pub(crate) async fn sources(&self) -> Vec<Source> {
        self.connections
            .lock()
            .await
            .values()
            .filter_map(|inner| inner.source())
            .collect()
    }

    pub(crate) fn add_connect_listener(&self, listener: ConnectListener) {
        self.connect_listeners
            .lock()
            .expect("listener mutex")
            .push(listener);
    }

    fn notify_connected(&self, conn: &Arc<ConnectionInner>) {
        let handle = Connection {
            inner: Arc::clone(conn),
        };
        for listener in self.connect_listeners.lock().expect("listener mutex").iter() {
            listener(&handle);
        }
    }

    pub(crate) fn set_remote_result_hook(&self, hook: RemoteResultHook) {
        *self.remote_results.lock().expect("hook mutex") = Some(hook);
    }

    pub(crate) fn handle_remote_result(&self, request: &Request) {
        match self.remote_results.lock().expect("hook mutex").as_ref() {
            Some(hook) => hook(request),
            None => debug!(id = request.id, "remote function result with no hook; dropped"),
        }
    }

    /// Deliver a response with no originating connection to every open
    /// connection. Per-connection failures are collected and reported once;
    /// one failing connection never blocks the rest.
    pub(crate) async fn broadcast(&self, response: &Response) -> Result<(), WriteError> {
        let targets: Vec<Arc<ConnectionInner>> =
            self.connections.lock().await.values().cloned().collect();
        let mut failures = Vec::new();
        for conn in targets {
            if let Err(error) = conn.write(response).await {
                warn!(conn = conn.id(), error = %error, "broadcast write failed");
                failures.push((conn.id(), error));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(WriteError::Broadcast(failures))
        }
    }

    /// Stop the accept/dial loop and close every connection in turn.
    pub(crate) async fn shutdown(&self, reason: &str) {
        let _ = self.shutdown_tx.send(true);
        let targets: Vec<Arc<ConnectionInner>> =
            self.connections.lock().await.values().cloned().collect();
        for conn in targets {
            conn.request_shutdown();
            conn.close(Some(reason)).await;
        }
    }

    /// Adopt a freshly established stream: build the connection, fire the
    /// connect listeners, then start the read task.
    async fn adopt(
        self: &Arc<Self>,
        stream: TcpStream,
        initial_state: ConnState,
    ) -> Arc<ConnectionInner> {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let conn = ConnectionInner::new(
            self.next_connection_id(),
            peer,
            Box::new(write_half),
            initial_state,
        );
        self.insert_connection(Arc::clone(&conn)).await;
        // Listeners fire before the first request is processed.
        self.notify_connected(&conn);
        tokio::spawn(run_read_loop(
            Arc::clone(&conn),
            Box::new(read_half),
            Arc::clone(self),
        ));
        conn
    }
}

/// Accept loop for the server role. Each accepted peer is challenged with a
/// LOGIN packet and parked in `Authenticating` until it presents the shared
/// secret.
pub(crate) async fn run_accept_loop(shared: Arc<Shared>, listener: TcpListener) {
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
                    info!(%peer, "peer connected");
                    let conn = shared.adopt(stream, ConnState::Authenticating).await;
                    if let Err(error) = conn.write(&Response::login_challenge()).await {
                        warn!(conn = conn.id(), error = %error, "failed to send login challenge");
                        conn.close(None).await;
                    }
                }
                Err(error) => {
                    warn!(error = %error, "accept failed");
                }
            }
        }
    }
}

/// Dial loop for the client role: connect, serve until disconnect, then
/// retry with exponential backoff starting at one second. Shutdown
/// interrupts both the sleep and an established connection.
pub(crate) async fn run_dial_loop(shared: Arc<Shared>, config: ClientConfig) {
    let mut shutdown = shared.shutdown_signal();
    let mut backoff = Duration::from_secs(1);
    loop {
        if shared.is_shutting_down() {
            break;
        }
        match TcpStream::connect((config.host.as_str(), config.port)).await {
            Ok(stream) => {
                info!(host = %config.host, port = config.port, "connected to upstream");
                backoff = Duration::from_secs(1);
                let conn = shared.adopt(stream, ConnState::Open).await;
                let mut closed = conn.closed_signal();
                tokio::select! {
                    biased;
                    _ = wait_until_true(&mut shutdown) => {
                        break;
                    }
                    _ = wait_until_true(&mut closed) => {
                        debug!("upstream connection ended; redialing");
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
                    _ = wait_until_true(&mut shutdown) => {
                        break;
                    }
                    () = tokio::time::sleep(backoff) => {}
                }
                backoff *= 2;
            }
        }
    }
}

/// Bind the server-role listener.
pub(crate) async fn bind_server(config: &ServerConfig) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = listener.local_addr()?.port(), "listening for peers");
    Ok(listener)
}
