//! Streamer-side endpoint of the effect dispatch protocol.
//!
//! A [`Sender`] originates effect requests, multiplexes the per-request
//! response streams over one connection, and tracks availability and
//! lifecycle state for every in-flight request. Two deployment shapes:
//!
//! - **client role** ([`Sender::connect`]): dial a game hosting the server
//!   role and log in with the shared secret when challenged;
//! - **server role** ([`Sender::serve`]): accept connections from games
//!   running the client role.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use fx_protocol::{Request, RequestType};
//! use fx_sender::{Sender, SenderClientConfig};
//!
//! let sender = Sender::connect(SenderClientConfig::new("127.0.0.1", 57575, "password")?);
//! let mut responses = sender
//!     .send_request(Request::builder(RequestType::Start).effect("kill").viewer("qixils"))
//!     .await?;
//! while let Some(response) = responses.next().await {
//!     println!("{:?}", response?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod session;
pub mod tracker;

pub use config::{SenderClientConfig, SenderConfig, SenderOptions, SenderServerConfig};
pub use error::{ConfigError, SendError, TrackerError};
pub use session::SenderConnection;
pub use tracker::ResponseStream;

use fx_protocol::{RequestBuilder, Response, TriState};
use session::SenderShared;
use std::sync::Arc;
use tracing::info;

/// The streamer-side endpoint: session manager plus per-connection request
/// trackers.
pub struct Sender {
    shared: Arc<SenderShared>,
    local_addr: Option<std::net::SocketAddr>,
}

impl Sender {
    /// Start in the configured role with default options.
    pub async fn start(config: SenderConfig) -> std::io::Result<Sender> {
        match config {
            SenderConfig::Client(client) => Ok(Sender::connect(client)),
            SenderConfig::Server(server) => Sender::serve(server).await,
        }
    }

    /// Client role with default options.
    pub fn connect(config: SenderClientConfig) -> Sender {
        Sender::connect_with(config, SenderOptions::default())
    }

    /// Client role: dial the game server, retrying with exponential backoff
    /// (1 s, 2 s, 4 s, ...) until shut down.
    pub fn connect_with(config: SenderClientConfig, options: SenderOptions) -> Sender {
        let shared = SenderShared::new(Some(config.password.clone()), options);
        tokio::spawn(session::run_dial_loop(Arc::clone(&shared), config));
        Sender {
            shared,
            local_addr: None,
        }
    }

    /// Server role with default options.
    pub async fn serve(config: SenderServerConfig) -> std::io::Result<Sender> {
        Sender::serve_with(config, SenderOptions::default()).await
    }

    /// Server role: bind the listening socket and accept dialing games.
    pub async fn serve_with(
        config: SenderServerConfig,
        options: SenderOptions,
    ) -> std::io::Result<Sender> {
        let shared = SenderShared::new(None, options);
        let listener = session::bind_server(&config).await?;
        let local_addr = listener.local_addr().ok();
        tokio::spawn(session::run_accept_loop(Arc::clone(&shared), listener));
        Ok(Sender {
            shared,
            local_addr,
        })
    }

    /// The bound listener address; `None` in the client role.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }

    pub async fn connections(&self) -> Vec<SenderConnection> {
        self.shared.connections().await
    }

    /// The current connection, if any (the only one in the client role).
    pub async fn connection(&self) -> Option<SenderConnection> {
        self.shared.any_connection().await
    }

    /// Send a request on the current connection. The tracker stamps the next
    /// id onto the builder; the returned stream yields every response for
    /// that id and ends after the terminating one.
    pub async fn send_request(
        &self,
        request: RequestBuilder,
    ) -> Result<ResponseStream, SendError> {
        match self.connection().await {
            Some(connection) => connection.send_request(request),
            None => Err(SendError::NotConnected),
        }
    }

    /// The availability learned for `effect` on the current connection.
    pub async fn effect_available(&self, effect: &str) -> TriState {
        match self.connection().await {
            Some(connection) => connection.effect_available(effect),
            None => TriState::Unknown,
        }
    }

    /// Hook answering REMOTE_FUNCTION packets; returning `Some(value)`
    /// replies with a REMOTE_FUNCTION_RESULT request carrying it.
    pub fn on_remote_function<F>(&self, hook: F)
    where
        F: Fn(&Response) -> Option<serde_json::Value> + Send + Sync + 'static,
    {
        self.shared.set_remote_function_hook(Box::new(hook));
    }

    /// Hook observing EFFECT_STATUS broadcasts (menu visibility updates).
    pub fn on_effect_status<F>(&self, hook: F)
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.shared.set_status_hook(Box::new(hook));
    }

    /// Listener invoked for each new connection before its first packet.
    pub fn add_connect_listener<F>(&self, listener: F)
    where
        F: Fn(&SenderConnection) + Send + Sync + 'static,
    {
        self.shared.add_connect_listener(Box::new(listener));
    }

    /// Graceful shutdown: stop dialing/accepting, let in-flight requests
    /// drain briefly, then fail whatever is left and close the connections.
    pub async fn shutdown(&self) {
        info!("sender shutting down");
        self.shared.shutdown().await;
    }
}
