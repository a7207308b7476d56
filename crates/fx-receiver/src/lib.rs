//! Game-side endpoint of the effect dispatch protocol.
//!
//! A [`Receiver`] accepts effect requests over NUL-framed JSON TCP, routes
//! each to a registered handler, and writes one or more responses per
//! request. Two deployment shapes:
//!
//! - **client role** ([`Receiver::connect`]): dial a single upstream service
//!   and redial with exponential backoff when the link drops;
//! - **server role** ([`Receiver::serve`]): accept many simultaneous
//!   upstream connections, each authenticated with the shared secret.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use fx_receiver::{Receiver, ServerConfig};
//! use fx_protocol::ResultType;
//!
//! let receiver = Receiver::serve(ServerConfig::new(57575, "password")?).await?;
//! receiver.register_effect("kill", |req| {
//!     Ok(req.response().result(ResultType::Success).build()?)
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod router;
mod session;
mod status;
pub mod timed;

pub use config::{ClientConfig, ReceiverConfig, ServerConfig};
pub use connection::Connection;
pub use error::{
    ConfigError, HandlerError, RegisterError, TimedEffectError, WriteError,
};
pub use router::{CheckResult, EffectRequest, Registry, RegistryBuilder};
pub use timed::{TimedEffect, TimedEffectBuilder, TimedEffectScheduler, TimedEffectState};

use fx_protocol::{
    IdType, PacketType, Request, Response, ResultType, Source, ValidationError,
};
use session::Shared;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

impl From<ValidationError> for HandlerError {
    fn from(error: ValidationError) -> Self {
        HandlerError::Failed(error.to_string())
    }
}

/// The game-side endpoint: session manager, handler registry, and timed
/// effect scheduler under one roof.
pub struct Receiver {
    shared: Arc<Shared>,
    scheduler: TimedEffectScheduler,
    local_addr: Option<std::net::SocketAddr>,
}

impl Receiver {
    /// Start in the configured role.
    pub async fn start(config: ReceiverConfig) -> std::io::Result<Receiver> {
        match config {
            ReceiverConfig::Client(client) => Ok(Receiver::connect(client)),
            ReceiverConfig::Server(server) => Receiver::serve(server).await,
        }
    }

    /// Server role: bind the listening socket and accept upstream peers,
    /// each challenged with the shared secret.
    pub async fn serve(config: ServerConfig) -> std::io::Result<Receiver> {
        let shared = Shared::new(Some(config.password.clone()));
        let listener = session::bind_server(&config).await?;
        let local_addr = listener.local_addr().ok();
        tokio::spawn(session::run_accept_loop(Arc::clone(&shared), listener));
        Ok(Receiver {
            shared,
            scheduler: TimedEffectScheduler::new(),
            local_addr,
        })
    }

    /// The bound listener address; `None` in the client role.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }

    /// Client role: dial the upstream service, retrying with exponential
    /// backoff (1 s, 2 s, 4 s, ...) until shut down.
    pub fn connect(config: ClientConfig) -> Receiver {
        let shared = Shared::new(None);
        tokio::spawn(session::run_dial_loop(Arc::clone(&shared), config));
        Receiver {
            shared,
            scheduler: TimedEffectScheduler::new(),
            local_addr: None,
        }
    }

    /// Register a synchronous handler for `effect`. The handler's response
    /// is written back on the originating connection.
    pub fn register_effect<F>(&self, effect: &str, handler: F) -> Result<(), RegisterError>
    where
        F: Fn(&EffectRequest) -> Result<Response, HandlerError> + Send + Sync + 'static,
    {
        self.shared.registry.register(effect, Box::new(handler))
    }

    /// Register an asynchronous handler for `effect`; it emits responses out
    /// of band through the request it receives.
    pub fn register_async_effect<F, Fut>(
        &self,
        effect: &str,
        handler: F,
    ) -> Result<(), RegisterError>
    where
        F: Fn(EffectRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.shared.registry.register_async(
            effect,
            Box::new(
                move |request| -> futures_util::future::BoxFuture<'static, Result<(), HandlerError>> {
                    Box::pin(handler(request))
                },
            ),
        )
    }

    /// Install a pre-assembled handler set; fails on the first duplicate key
    /// without installing anything.
    pub fn install(&self, handlers: RegistryBuilder) -> Result<(), RegisterError> {
        handlers.install(&self.shared.registry)
    }

    /// Add a check evaluated for every request before any handler runs; a
    /// Disallow answers the request with "The game is unavailable".
    pub fn add_global_check<F>(&self, check: F)
    where
        F: Fn(&Request) -> CheckResult + Send + Sync + 'static,
    {
        self.shared.registry.add_global_check(Box::new(check));
    }

    /// Hook invoked for every REMOTE_FUNCTION_RESULT request.
    pub fn on_remote_function_result<F>(&self, hook: F)
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.shared.set_remote_result_hook(Box::new(hook));
    }

    /// Listener invoked on every new connection before its first request is
    /// processed.
    pub fn add_connect_listener<F>(&self, listener: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.shared.add_connect_listener(Box::new(listener));
    }

    pub async fn connections(&self) -> Vec<Connection> {
        self.shared.connections().await
    }

    /// Union of every connection's player identity, where known.
    pub async fn sources(&self) -> Vec<Source> {
        self.shared.sources().await
    }

    /// Write a response with no originating connection to every open
    /// connection. Per-connection failures are aggregated into a single
    /// [`WriteError::Broadcast`]; they never block the other deliveries.
    pub async fn broadcast(&self, response: &Response) -> Result<(), WriteError> {
        self.shared.broadcast(response).await
    }

    /// Build and broadcast an EFFECT_STATUS packet; each connection's diff
    /// filter drops the ids that peer already knows about.
    pub async fn publish_effect_status(
        &self,
        result: ResultType,
        ids: impl IntoIterator<Item = impl Into<String>>,
        id_type: IdType,
    ) -> Result<(), WriteError> {
        let response = Response::builder(PacketType::EffectStatus)
            .result(result)
            .ids(ids)
            .id_type(id_type)
            .build()?;
        self.broadcast(&response).await
    }

    /// Broadcast a REMOTE_FUNCTION invocation; results come back as
    /// REMOTE_FUNCTION_RESULT requests through the registered hook.
    pub async fn invoke_remote_function(
        &self,
        method: impl Into<String>,
        arguments: Vec<serde_json::Value>,
    ) -> Result<(), WriteError> {
        let mut builder = Response::builder(PacketType::RemoteFunction).method(method);
        for argument in arguments {
            builder = builder.argument(argument);
        }
        self.broadcast(&builder.build()?).await
    }

    /// The timed effect scheduler owned by this receiver.
    pub fn scheduler(&self) -> &TimedEffectScheduler {
        &self.scheduler
    }

    /// Graceful shutdown: stop accepting/dialing, close every connection
    /// with a DISCONNECT carrying `reason`, and tear down the scheduler.
    pub async fn shutdown(&self, reason: Option<&str>) {
        info!("receiver shutting down");
        self.scheduler.shutdown();
        self.shared
            .shutdown(reason.unwrap_or("Server is shutting down"))
            .await;
    }
}
