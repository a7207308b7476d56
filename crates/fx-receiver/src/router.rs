//! Effect handler registry and dispatch.
//!
//! Handlers are keyed by lowercased effect name. Dispatch runs on a spawned
//! task per request so handler code never blocks the connection's read loop:
//! global checks first, then the handler, then error translation onto the
//! wire.

use crate::connection::ConnectionInner;
use crate::error::{HandlerError, RegisterError, WriteError};
use fx_protocol::{
    IdType, PacketType, Request, Response, ResponseBuilder, ResultType,
};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, warn};

/// Verdict of a global check, evaluated before any handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Allow,
    Disallow,
}

pub type SyncHandler =
    Box<dyn Fn(&EffectRequest) -> Result<Response, HandlerError> + Send + Sync>;
pub type AsyncHandler =
    Box<dyn Fn(EffectRequest) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;
pub type GlobalCheck = Box<dyn Fn(&Request) -> CheckResult + Send + Sync>;

enum Handler {
    /// Returns its response; the dispatcher writes it.
    Sync(SyncHandler),
    /// Emits responses out of band through the request it carries.
    Async(AsyncHandler),
}

/// An immutable request snapshot plus a weak handle to the connection it
/// arrived on. Responding through a connection that has since closed fails
/// with a closed-socket error; the request never keeps a connection alive.
#[derive(Clone)]
pub struct EffectRequest {
    request: Arc<Request>,
    origin: Weak<ConnectionInner>,
}

impl EffectRequest {
    pub(crate) fn new(request: Request, origin: Weak<ConnectionInner>) -> Self {
        EffectRequest {
            request: Arc::new(request),
            origin,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// An EFFECT_RESULT builder pre-seeded with this request's id.
    pub fn response(&self) -> ResponseBuilder {
        Response::builder(PacketType::EffectResult).id(self.request.id)
    }

    pub async fn respond(&self, response: &Response) -> Result<(), WriteError> {
        match self.origin.upgrade() {
            Some(conn) => conn.write(response).await,
            None => Err(WriteError::Closed),
        }
    }
}

impl std::ops::Deref for EffectRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.request
    }
}

/// Handler registry. Read-mostly after startup; registration is serialized
/// against dispatch and duplicate keys are rejected atomically.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    handlers: HashMap<String, Arc<Handler>>,
    checks: Vec<Arc<GlobalCheck>>,
}

impl Registry {
    pub fn register(
        &self,
        effect: impl AsRef<str>,
        handler: SyncHandler,
    ) -> Result<(), RegisterError> {
        self.insert(effect.as_ref(), Handler::Sync(handler))
    }

    pub fn register_async(
        &self,
        effect: impl AsRef<str>,
        handler: AsyncHandler,
    ) -> Result<(), RegisterError> {
        self.insert(effect.as_ref(), Handler::Async(handler))
    }

    pub fn add_global_check(&self, check: GlobalCheck) {
        self.inner
            .write()
            .expect("registry lock")
            .checks
            .push(Arc::new(check));
    }

    fn insert(&self, effect: &str, handler: Handler) -> Result<(), RegisterError> {
        let key = effect.to_lowercase();
        let mut inner = self.inner.write().expect("registry lock");
        if inner.handlers.contains_key(&key) {
            return Err(RegisterError::Duplicate(key));
        }
        inner.handlers.insert(key, Arc::new(handler));
        Ok(())
    }

    fn lookup(&self, effect: &str) -> Option<Arc<Handler>> {
        self.inner
            .read()
            .expect("registry lock")
            .handlers
            .get(effect)
            .cloned()
    }

    fn checks(&self) -> Vec<Arc<GlobalCheck>> {
        self.inner.read().expect("registry lock").checks.clone()
    }
}

/// Bulk registration: collect keyed handlers, fail on the first duplicate.
/// The explicit stand-in for scanning a handler object for annotated
/// methods — callers enumerate their handlers instead.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<(String, Handler)>,
    checks: Vec<GlobalCheck>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effect(
        mut self,
        key: impl AsRef<str>,
        handler: impl Fn(&EffectRequest) -> Result<Response, HandlerError> + Send + Sync + 'static,
    ) -> Self {
        self.entries
            .push((key.as_ref().to_lowercase(), Handler::Sync(Box::new(handler))));
        self
    }

    pub fn async_effect(
        mut self,
        key: impl AsRef<str>,
        handler: impl Fn(EffectRequest) -> BoxFuture<'static, Result<(), HandlerError>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.entries
            .push((key.as_ref().to_lowercase(), Handler::Async(Box::new(handler))));
        self
    }

    pub fn check(
        mut self,
        check: impl Fn(&Request) -> CheckResult + Send + Sync + 'static,
    ) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    /// Install every collected handler into `registry`, or fail with the
    /// first duplicate key without installing anything.
    pub fn install(self, registry: &Registry) -> Result<(), RegisterError> {
        let mut inner = registry.inner.write().expect("registry lock");
        let mut seen: Vec<&str> = Vec::with_capacity(self.entries.len());
        for (key, _) in &self.entries {
            if inner.handlers.contains_key(key) || seen.contains(&key.as_str()) {
                return Err(RegisterError::Duplicate(key.clone()));
            }
            seen.push(key);
        }
        for (key, handler) in self.entries {
            inner.handlers.insert(key, Arc::new(handler));
        }
        for check in self.checks {
            inner.checks.push(Arc::new(check));
        }
        Ok(())
    }
}

/// Dispatch one effect request on a worker task.
pub(crate) fn dispatch(shared: Arc<crate::session::Shared>, request: EffectRequest) {
    tokio::spawn(async move {
        run_dispatch(&shared, request).await;
    });
}

async fn run_dispatch(shared: &crate::session::Shared, request: EffectRequest) {
    for check in shared.registry.checks() {
        if check(request.request()) == CheckResult::Disallow {
            debug!(id = request.id, "request disallowed by global check");
            reply_failure(&request, "The game is unavailable").await;
            return;
        }
    }

    let effect = request
        .effect
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let Some(handler) = shared.registry.lookup(&effect) else {
        debug!(%effect, id = request.id, "no handler registered");
        let unavailable = request
            .response()
            .result(ResultType::Unavailable)
            .build()
            .expect("UNAVAILABLE reply is well-formed");
        log_write(&request, request.respond(&unavailable).await);

        let not_visible = Response::builder(PacketType::EffectStatus)
            .result(ResultType::NotVisible)
            .ids([effect.as_str()])
            .id_type(IdType::Effect)
            .build()
            .expect("NOT_VISIBLE status is well-formed");
        log_write(&request, request.respond(&not_visible).await);
        return;
    };

    let outcome = match handler.as_ref() {
        Handler::Sync(handler) => match handler(&request) {
            Ok(response) => {
                log_write(&request, request.respond(&response).await);
                Ok(())
            }
            Err(error) => Err(error),
        },
        Handler::Async(handler) => handler(request.clone()).await,
    };

    match outcome {
        Ok(()) => {}
        Err(HandlerError::NoApplicableTarget) => {
            reply_failure(&request, "Streamer(s) unavailable").await;
        }
        Err(error) => {
            warn!(%effect, id = request.id, error = %error, "handler failed");
            reply_failure(&request, "Request handler threw an exception").await;
        }
    }
}

async fn reply_failure(request: &EffectRequest, message: &str) {
    let response = request
        .response()
        .result(ResultType::Failure)
        .message(message)
        .build()
        .expect("FAILURE reply is well-formed");
    log_write(request, request.respond(&response).await);
}

fn log_write(request: &EffectRequest, result: Result<(), WriteError>) {
    if let Err(error) = result {
        warn!(id = request.id, error = %error, "failed to write reply");
    }
}
