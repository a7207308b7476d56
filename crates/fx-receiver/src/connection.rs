//! One authenticated pipe to an upstream service.
//!
//! Each connection owns its socket halves: a dedicated read task decodes
//! NUL-framed requests, and all writes are serialized behind the write
//! mutex. State machine:
//!
//! ```text
//! Authenticating -> Open -> Closing -> Closed
//! ```
//!
//! Client-role connections skip `Authenticating` (the dial loop in
//! `session` owns the connecting phase); server-role connections stay in
//! `Authenticating` until the peer presents the shared secret.

use crate::error::WriteError;
use crate::router;
use crate::session::{Shared, wait_until_true};
use crate::status::StatusFilter;
use fx_protocol::codec::encode_packet;
use fx_protocol::{
    PacketCodec, PacketType, Request, RequestType, Response, ResultType, Source, auth,
};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Authenticating,
    Open,
    Closing,
    Closed,
}

pub(crate) struct ConnectionInner {
    id: u64,
    peer: Option<SocketAddr>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    state: std::sync::Mutex<ConnState>,
    source: std::sync::Mutex<Option<Source>>,
    filter: std::sync::Mutex<StatusFilter>,
    shutting_down: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl ConnectionInner {
    pub(crate) fn new(
        id: u64,
        peer: Option<SocketAddr>,
        writer: BoxedWriter,
        state: ConnState,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(ConnectionInner {
            id,
            peer,
            writer: tokio::sync::Mutex::new(writer),
            state: std::sync::Mutex::new(state),
            source: std::sync::Mutex::new(None),
            filter: std::sync::Mutex::new(StatusFilter::default()),
            shutting_down: AtomicBool::new(false),
            closed_tx,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> ConnState {
        *self.state.lock().expect("state mutex")
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock().expect("state mutex") = state;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    pub(crate) fn source(&self) -> Option<Source> {
        self.source.lock().expect("source mutex").clone()
    }

    pub(crate) fn set_source(&self, source: Source) {
        *self.source.lock().expect("source mutex") = Some(source);
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    fn close_reason(&self) -> &'static str {
        if self.shutting_down.load(Ordering::SeqCst) {
            "Server is shutting down"
        } else {
            "Server encountered an error"
        }
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Write one response, serialized behind the connection's write mutex.
    /// EFFECT_STATUS packets pass the diff filter first and may be reduced
    /// or suppressed entirely.
    pub(crate) async fn write(&self, response: &Response) -> Result<(), WriteError> {
        if matches!(self.state(), ConnState::Closed) {
            return Err(WriteError::Closed);
        }
        let filtered = if response.packet == PacketType::EffectStatus {
            match self.filter.lock().expect("filter mutex").apply(response) {
                Some(reduced) => Some(reduced),
                None => {
                    debug!(conn = self.id, "status packet suppressed by diff filter");
                    return Ok(());
                }
            }
        } else {
            None
        };
        let bytes = encode_packet(filtered.as_ref().unwrap_or(response))?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Transition to Closing, best-effort emit a DISCONNECT carrying the
    /// reason, then close the socket. Idempotent.
    pub(crate) async fn close(&self, reason: Option<&str>) {
        {
            let mut state = self.state.lock().expect("state mutex");
            if matches!(*state, ConnState::Closing | ConnState::Closed) {
                return;
            }
            *state = ConnState::Closing;
        }
        if let Some(reason) = reason {
            if let Ok(bytes) = encode_packet(&Response::disconnect(reason)) {
                let mut writer = self.writer.lock().await;
                let _ = writer.write_all(&bytes).await;
                let _ = writer.flush().await;
            }
        }
        let _ = self.writer.lock().await.shutdown().await;
        self.set_state(ConnState::Closed);
        let _ = self.closed_tx.send(true);
        info!(conn = self.id, peer = ?self.peer, "connection closed");
    }

    /// Terminal transition without a DISCONNECT packet, for peer EOF.
    fn mark_closed(&self) {
        self.set_state(ConnState::Closed);
        let _ = self.closed_tx.send(true);
    }
}

/// Public handle to a live connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// The player identity last reported by a PLAYER_INFO request.
    pub fn source(&self) -> Option<Source> {
        self.inner.source()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub async fn write(&self, response: &Response) -> Result<(), WriteError> {
        self.inner.write(response).await
    }

    pub async fn close(&self, reason: &str) {
        self.inner.close(Some(reason)).await;
    }
}

/// Drive one connection's read side until the peer goes away or the
/// connection is closed locally.
pub(crate) async fn run_read_loop(
    conn: Arc<ConnectionInner>,
    reader: BoxedReader,
    shared: Arc<Shared>,
) {
    let mut frames = FramedRead::new(reader, PacketCodec::<Request>::new());
    let mut closed = conn.closed_signal();
    loop {
        tokio::select! {
            biased;
            _ = wait_until_true(&mut closed) => {
                break;
            }
            frame = frames.next() => match frame {
                None => {
                    debug!(conn = conn.id(), "peer disconnected");
                    conn.mark_closed();
                    break;
                }
                Some(Err(error)) => {
                    let reason = conn.close_reason();
                    warn!(conn = conn.id(), error = %error, "read failed");
                    conn.close(Some(reason)).await;
                    break;
                }
                Some(Ok(Err(bad_frame))) => {
                    warn!(conn = conn.id(), error = %bad_frame, "skipping unparseable frame");
                }
                Some(Ok(Ok(request))) => handle_request(&conn, &shared, request).await,
            }
        }
    }
    shared.remove_connection(conn.id()).await;
}

async fn handle_request(conn: &Arc<ConnectionInner>, shared: &Arc<Shared>, request: Request) {
    match conn.state() {
        ConnState::Authenticating => handle_authenticating(conn, shared, request).await,
        ConnState::Open => handle_open(conn, shared, request).await,
        ConnState::Closing | ConnState::Closed => {
            debug!(conn = conn.id(), "dropping request on closing connection");
        }
    }
}

async fn handle_authenticating(
    conn: &Arc<ConnectionInner>,
    shared: &Arc<Shared>,
    request: Request,
) {
    if request.kind != RequestType::Login {
        // Not logged in yet; anything else is answered NOT_READY when it can
        // carry an EFFECT_RESULT, and dropped otherwise.
        if request.id > 0 {
            let reply = Response::builder(PacketType::EffectResult)
                .id(request.id)
                .result(ResultType::NotReady)
                .build()
                .expect("NOT_READY reply is well-formed");
            if let Err(error) = conn.write(&reply).await {
                warn!(conn = conn.id(), error = %error, "failed to answer NOT_READY");
            }
        }
        return;
    }

    let accepted = match (&shared.password, request.password.as_deref()) {
        (Some(configured), Some(presented)) => auth::verify_password(configured, presented),
        (None, _) => true,
        (Some(_), None) => false,
    };
    if accepted {
        info!(conn = conn.id(), "login accepted");
        conn.set_state(ConnState::Open);
        if let Err(error) = conn.write(&Response::login_success()).await {
            warn!(conn = conn.id(), error = %error, "failed to confirm login");
        }
    } else {
        info!(conn = conn.id(), "login rejected");
        conn.close(Some("Incorrect password")).await;
    }
}

async fn handle_open(conn: &Arc<ConnectionInner>, shared: &Arc<Shared>, request: Request) {
    match request.kind {
        RequestType::KeepAlive => {
            let echo = Response::builder(PacketType::KeepAlive)
                .id(request.id)
                .build()
                .expect("keep-alive echo is well-formed");
            if let Err(error) = conn.write(&echo).await {
                warn!(conn = conn.id(), error = %error, "failed to echo keep-alive");
            }
        }
        RequestType::PlayerInfo => match request.source {
            Some(source) => {
                debug!(conn = conn.id(), "player info updated");
                conn.set_source(source);
            }
            None => debug!(conn = conn.id(), "player info without a source; ignored"),
        },
        RequestType::Login => {
            debug!(conn = conn.id(), "duplicate login ignored");
        }
        RequestType::RemoteFunctionResult => shared.handle_remote_result(&request),
        RequestType::Start | RequestType::Stop => {
            if let Err(error) = request.validate() {
                warn!(conn = conn.id(), error = %error, "malformed effect request");
                if request.id > 0 {
                    let reply = Response::builder(PacketType::EffectResult)
                        .id(request.id)
                        .result(ResultType::Failure)
                        .message(error.to_string())
                        .build()
                        .expect("failure reply is well-formed");
                    let _ = conn.write(&reply).await;
                }
                return;
            }
            router::dispatch(
                Arc::clone(shared),
                router::EffectRequest::new(request, Arc::downgrade(conn)),
            );
        }
    }
}
