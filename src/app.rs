//! The lifecycle controller.
//!
//! Setup and serving are two different types. [`App`] is the mutable
//! builder: routes, middleware, plugins, the error handler and the transport
//! are all wired on it, single-threaded. [`App::build`] consumes it and
//! freezes everything behind an `Arc` inside a [`Controller`], which is cheap
//! to clone and only ever read. Late registration is therefore impossible
//! rather than merely undefined.
//!
//! ```text
//! Created ──wire──▶ Configured ──start()──▶ Started ──shutdown()──▶ ShuttingDown ──▶ Stopped
//!   (App)             (App / Controller)     (Controller)
//! ```
//!
//! # Per-request dispatch
//!
//! ```text
//! checkout ctx ─▶ reset(request) ─▶ pre ─▶ lookup ─▶ global ─▶ route ─▶ handler
//!                                                                        │
//!        release ctx ◀─ take response ◀─ error handler (on Err) ◀────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::context::{ContextPool, Ctx};
use crate::error::{Error, Result};
use crate::handler::{Handler, Middleware, handler, merge, method_not_allowed, not_found};
use crate::plugin::{Plugin, PluginRegistry};
use crate::router::{Lookup, Muxer, NamedRoute, RadixRouter};
use crate::server::{Server, Transport};
use crate::signal::{self, SignalKind};

/// Crate version, logged at start and advertised in debug mode.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Address the default transport binds to when none is wired.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

/// The single error handler: turns a failed dispatch into a response.
///
/// Called exactly once per failed request and must write a response.
pub type ErrorHandler = Arc<dyn Fn(&Error, &mut Ctx) + Send + Sync + 'static>;

// ── State ─────────────────────────────────────────────────────────────────────

/// Lifecycle state of an app or controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Created,
    Configured,
    Started,
    ShuttingDown,
    Stopped,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Configured,
            2 => Self::Started,
            3 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Configured => "configured",
            Self::Started => "started",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        })
    }
}

// ── Default error handler ─────────────────────────────────────────────────────

/// Writes the error's status with a plain-text body.
///
/// Messages of [`Error::Http`] are sent as-is. Other errors send the status'
/// reason phrase, or the full error text in debug mode. Server errors are
/// logged at `error` level.
pub fn default_error_handler(err: &Error, c: &mut Ctx) {
    let status = err.status();
    if status.is_server_error() {
        error!(method = %c.method(), path = c.path(), error = %err, "request failed");
    } else {
        debug!(method = %c.method(), path = c.path(), %status, "request rejected");
    }

    let body = match err {
        Error::Http { message, .. } => message.clone(),
        _ if c.is_debug() => err.to_string(),
        _ => status.canonical_reason().unwrap_or_default().to_owned(),
    };
    if c.string(status, body).is_err() {
        c.set_status(status);
    }
}

// ── App (setup phase) ─────────────────────────────────────────────────────────

/// The controller under construction.
pub struct App {
    name: String,
    debug: bool,
    configured: bool,
    muxer: Box<dyn Muxer>,
    transport: Option<Box<dyn Transport>>,
    error_handler: ErrorHandler,
    pre: Vec<Middleware>,
    global: Vec<Middleware>,
    plugins: PluginRegistry,
    shutdown_timeout: Duration,
    handle: ControllerRef,
}

impl App {
    /// An app named `main` with a [`RadixRouter`], the default error handler
    /// and the built-in UUID plugin. The transport defaults to a [`Server`]
    /// on [`DEFAULT_BIND_ADDR`] unless one is wired.
    pub fn new() -> Self {
        Self {
            name: "main".to_owned(),
            debug: false,
            configured: false,
            muxer: Box::new(RadixRouter::new()),
            transport: None,
            error_handler: Arc::new(default_error_handler),
            pre: Vec::new(),
            global: Vec::new(),
            plugins: PluginRegistry::with_defaults(),
            shutdown_timeout: Duration::from_secs(10),
            handle: ControllerRef::default(),
        }
    }

    /// An app named, flagged and bound as `config` says.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut app = Self::new()
            .with_transport(Server::bind(&config.http.bind_addr)?)
            .with_shutdown_timeout(config.http.shutdown_timeout);
        app.set_name(&config.name);
        if config.debug {
            app = app.enable_debug();
        }
        Ok(app)
    }

    pub fn with_muxer(mut self, muxer: impl Muxer) -> Self {
        self.muxer = Box::new(muxer);
        self.configured = true;
        self
    }

    pub fn with_transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Box::new(transport));
        self.configured = true;
        self
    }

    pub fn with_error_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error, &mut Ctx) + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(f);
        self.configured = true;
        self
    }

    /// Grace period [`Controller::run`] gives in-flight requests on shutdown.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn enable_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `bough@<name>`.
    pub fn id(&self) -> String {
        format!("bough@{}", self.name)
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn state(&self) -> State {
        if self.configured { State::Configured } else { State::Created }
    }

    // ── Middleware ────────────────────────────────────────────────────────────

    /// Adds middleware that runs before routing, for every request,
    /// including those that end in 404 or 405.
    pub fn pre(&mut self, m: Middleware) -> &mut Self {
        self.pre.push(m);
        self.configured = true;
        self
    }

    /// Adds middleware that runs after routing, around the matched route
    /// (or the 404/405 handler).
    pub fn global(&mut self, m: Middleware) -> &mut Self {
        self.global.push(m);
        self.configured = true;
        self
    }

    /// Adds middleware to the muxer. It wraps routes registered after this
    /// call, inside the global tier and outside route middleware.
    pub fn use_middleware(&mut self, m: Middleware) -> &mut Self {
        self.muxer.use_middleware(m);
        self.configured = true;
        self
    }

    // ── Plugins ───────────────────────────────────────────────────────────────

    /// Registers `plugin`. An [`Attacher`](crate::plugin::Attacher) plugin is
    /// handed a [`ControllerRef`] once, before it is stored.
    pub fn register<P: Plugin>(&mut self, mut plugin: P) -> Result<&mut Self> {
        if self.plugins.contains(plugin.id()) {
            return Err(Error::DuplicatePlugin(plugin.id().to_owned()));
        }
        if let Some(attacher) = plugin.as_attacher() {
            attacher.attach(self.handle.clone());
        }
        self.plugins.insert(Arc::new(plugin))?;
        self.configured = true;
        Ok(self)
    }

    /// Removes a plugin, including the built-in UUID generator.
    pub fn remove_plugin(&mut self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.remove(id)
    }

    pub fn plugin(&self, id: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(id)
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    // ── Routes ────────────────────────────────────────────────────────────────

    /// Registers `handler` for `method` + `pattern`, wrapped in `middleware`.
    pub fn add_handler(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
        middleware: &[Middleware],
    ) -> Result<&mut NamedRoute> {
        self.configured = true;
        self.muxer.add_handler(method, pattern, handler, middleware)
    }

    pub fn get(&mut self, pattern: &str, handler: Handler) -> Result<&mut NamedRoute> {
        self.add_handler(Method::GET, pattern, handler, &[])
    }

    pub fn post(&mut self, pattern: &str, handler: Handler) -> Result<&mut NamedRoute> {
        self.add_handler(Method::POST, pattern, handler, &[])
    }

    pub fn put(&mut self, pattern: &str, handler: Handler) -> Result<&mut NamedRoute> {
        self.add_handler(Method::PUT, pattern, handler, &[])
    }

    pub fn patch(&mut self, pattern: &str, handler: Handler) -> Result<&mut NamedRoute> {
        self.add_handler(Method::PATCH, pattern, handler, &[])
    }

    pub fn delete(&mut self, pattern: &str, handler: Handler) -> Result<&mut NamedRoute> {
        self.add_handler(Method::DELETE, pattern, handler, &[])
    }

    pub fn head(&mut self, pattern: &str, handler: Handler) -> Result<&mut NamedRoute> {
        self.add_handler(Method::HEAD, pattern, handler, &[])
    }

    pub fn options(&mut self, pattern: &str, handler: Handler) -> Result<&mut NamedRoute> {
        self.add_handler(Method::OPTIONS, pattern, handler, &[])
    }

    /// Registers `handler` under every common method.
    pub fn any(&mut self, pattern: &str, handler: Handler) -> Result<()> {
        for method in [
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ] {
            self.add_handler(method, pattern, handler.clone(), &[])?;
        }
        Ok(())
    }

    /// Serves files under `root` at `prefix/*`.
    pub fn static_dir(&mut self, prefix: &str, root: impl Into<std::path::PathBuf>) -> Result<&mut NamedRoute> {
        let pattern = format!("{}/*", prefix.trim_end_matches('/'));
        self.get(&pattern, crate::static_files::static_files(root))
    }

    pub fn routes(&self) -> &[NamedRoute] {
        self.muxer.routes()
    }

    // ── Freeze ────────────────────────────────────────────────────────────────

    /// Freezes the app into a [`Controller`] and attaches the transport.
    pub fn build(self) -> Result<Controller> {
        let mut transport: Box<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Box::new(Server::bind(DEFAULT_BIND_ADDR)?),
        };

        let shared = Arc::new(Shared {
            name: self.name,
            debug: self.debug,
            routes: self.muxer.routes().to_vec(),
            plugins: self.plugins,
        });

        let muxer: Arc<dyn Muxer> = Arc::from(self.muxer);
        let root = merge(routing(muxer, Arc::from(self.global)), &self.pre);

        let handle = self.handle;
        let core = Arc::new_cyclic(|weak: &Weak<Core>| {
            transport.attach(Dispatcher { core: weak.clone() });
            let _ = handle.core.set(weak.clone());
            Core {
                pool: ContextPool::attached(Arc::clone(&shared)),
                shared,
                root,
                error_handler: self.error_handler,
                transport,
                shutdown_timeout: self.shutdown_timeout,
                state: AtomicU8::new(State::Configured as u8),
            }
        });

        debug!(
            name = core.shared.name,
            routes = core.shared.routes.len(),
            plugins = core.shared.plugins.len(),
            "controller built"
        );
        Ok(Controller { core })
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// The handler the pre chain wraps: route, then run global ∘ route ∘ handler.
fn routing(muxer: Arc<dyn Muxer>, global: Arc<[Middleware]>) -> Handler {
    let on_not_found = not_found();
    let on_not_allowed = method_not_allowed();

    handler(move |c| {
        let target = match c.lookup(&*muxer) {
            Lookup::Matched(h) => h,
            Lookup::MethodNotAllowed(allowed) => {
                c.set_allowed_methods(allowed);
                on_not_allowed.clone()
            }
            Lookup::NotFound => on_not_found.clone(),
        };
        let chain = merge(target, &global);
        Box::pin(async move { chain.call(c).await })
    })
}

// ── Controller (serving phase) ────────────────────────────────────────────────

/// Read-only controller state every request context can see.
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) debug: bool,
    pub(crate) plugins: PluginRegistry,
    pub(crate) routes: Vec<NamedRoute>,
}

struct Core {
    shared: Arc<Shared>,
    pool: ContextPool,
    root: Handler,
    error_handler: ErrorHandler,
    transport: Box<dyn Transport>,
    shutdown_timeout: Duration,
    state: AtomicU8,
}

impl Core {
    async fn serve(&self, req: Request<Bytes>) -> Response<Full<Bytes>> {
        let mut c = self.pool.checkout();
        c.reset(req);
        if let Err(err) = self.root.call(&mut c).await {
            (self.error_handler)(&err, &mut c);
        }
        c.take_response()
    }
}

/// The built, running side of an [`App`]. Clones share one controller.
#[derive(Clone)]
pub struct Controller {
    core: Arc<Core>,
}

impl Controller {
    pub fn name(&self) -> &str {
        &self.core.shared.name
    }

    /// `bough@<name>`.
    pub fn id(&self) -> String {
        format!("bough@{}", self.core.shared.name)
    }

    pub fn is_debug(&self) -> bool {
        self.core.shared.debug
    }

    pub fn state(&self) -> State {
        State::from_u8(self.core.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.core.state.store(state as u8, Ordering::Release);
    }

    pub fn plugin(&self, id: &str) -> Option<&Arc<dyn Plugin>> {
        self.core.shared.plugins.get(id)
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.core.shared.plugins
    }

    pub fn routes(&self) -> &[NamedRoute] {
        &self.core.shared.routes
    }

    /// Number of idle pooled contexts.
    pub fn idle_contexts(&self) -> usize {
        self.core.pool.idle()
    }

    /// Runs one request through the full chain, in-process.
    pub async fn dispatch(&self, req: Request<Bytes>) -> Response<Full<Bytes>> {
        self.core.serve(req).await
    }

    /// Runs plugin start hooks in registration order, then serves until the
    /// transport stops accepting and has drained.
    pub async fn start(&self) -> Result<()> {
        let current = self.state();
        if self
            .core
            .state
            .compare_exchange(
                State::Configured as u8,
                State::Started as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::InvalidState { action: "start", state: current });
        }

        info!(id = %self.id(), version = VERSION, "starting");

        for (id, cycler) in self.core.shared.plugins.cyclers() {
            if let Err(e) = cycler.start().await {
                error!(plugin = id, error = %e, "plugin failed to start");
                self.set_state(State::Stopped);
                return Err(Error::Plugin { id: id.to_owned(), source: Box::new(e) });
            }
        }

        let result = self.core.transport.start().await;

        // The transport can also stop on its own, e.g. when binding fails.
        if self.state() == State::Started {
            self.set_state(State::Stopped);
        }
        result
    }

    /// Shuts down within `timeout`.
    ///
    /// Plugin shutdown hooks run first, in registration order, each bounded by
    /// the deadline; their failures are logged and skipped. The transport then
    /// stops accepting, drains in-flight requests until the deadline and
    /// aborts whatever is left, reported as [`Error::ShutdownTimeout`].
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        match self.state() {
            State::Stopped => return Ok(()),
            State::ShuttingDown => {
                return Err(Error::InvalidState { action: "shut down", state: State::ShuttingDown });
            }
            _ => self.set_state(State::ShuttingDown),
        }
        info!(id = %self.id(), ?timeout, "shutting down");

        for (id, cycler) in self.core.shared.plugins.cyclers() {
            match tokio::time::timeout_at(deadline, cycler.shutdown(deadline)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(plugin = id, error = %e, "plugin shutdown failed"),
                Err(_) => warn!(plugin = id, "plugin shutdown overran the deadline"),
            }
        }

        let result = self.core.transport.shutdown(deadline).await;
        self.set_state(State::Stopped);

        match &result {
            Ok(()) => info!(id = %self.id(), "stopped"),
            Err(e) => warn!(id = %self.id(), error = %e, "stopped"),
        }
        result
    }

    /// Reloads every [`Reloader`](crate::plugin::Reloader) plugin, in
    /// registration order. Failures are logged; returns how many succeeded.
    pub fn reload(&self) -> usize {
        let mut reloaded = 0;
        for (id, reloader) in self.core.shared.plugins.reloaders() {
            match reloader.reload() {
                Ok(()) => reloaded += 1,
                Err(e) => warn!(plugin = id, error = %e, "plugin reload failed"),
            }
        }
        info!(reloaded, "reload complete");
        reloaded
    }

    /// Serves until `SIGINT` or `SIGTERM`, then shuts down gracefully within
    /// the configured timeout. `SIGHUP` reloads plugins and keeps serving.
    pub async fn run(&self) -> Result<()> {
        let mut serving = tokio::spawn({
            let me = self.clone();
            async move { me.start().await }
        });

        let mut on_stop = signal::graceful(self.clone(), self.core.shutdown_timeout);
        let mut on_hangup = signal::reload(self.clone());
        let listen = signal::listen(
            &[SignalKind::Interrupt, SignalKind::Terminate, SignalKind::Hangup],
            move |kind| match kind {
                SignalKind::Hangup => Box::pin(on_hangup(kind)) as crate::handler::BoxFuture<'static, bool>,
                _ => on_stop(kind),
            },
        );

        tokio::select! {
            joined = &mut serving => {
                return joined.unwrap_or_else(|e| Err(Error::handler(e)));
            }
            listened = listen => listened?,
        }

        serving.await.unwrap_or_else(|e| Err(Error::handler(e)))
    }
}

/// A plugin's handle on the controller it is registered with.
///
/// Handed out during setup, before the controller exists; resolves once
/// [`App::build`] has run. Does not keep the controller alive.
#[derive(Clone, Default)]
pub struct ControllerRef {
    core: Arc<OnceLock<Weak<Core>>>,
}

impl ControllerRef {
    /// The controller, once built and while any clone of it is alive.
    pub fn upgrade(&self) -> Option<Controller> {
        let core = self.core.get()?.upgrade()?;
        Some(Controller { core })
    }
}

impl fmt::Debug for ControllerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attached = self.core.get().is_some_and(|w| w.strong_count() > 0);
        f.debug_struct("ControllerRef").field("attached", &attached).finish()
    }
}

/// A transport's handle back into its controller.
///
/// Does not keep the controller alive: once every [`Controller`] clone is
/// gone, dispatch answers `503 Service Unavailable`.
#[derive(Clone)]
pub struct Dispatcher {
    core: Weak<Core>,
}

impl Dispatcher {
    pub async fn dispatch(&self, req: Request<Bytes>) -> Response<Full<Bytes>> {
        match self.core.upgrade() {
            Some(core) => core.serve(req).await,
            None => {
                let mut resp = Response::new(Full::new(Bytes::new()));
                *resp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                resp
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").field("attached", &(self.core.strong_count() > 0)).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use http_body_util::BodyExt;

    use super::*;
    use crate::handler::{handler_fn, middleware};
    use crate::plugin::{Attacher, Cycler, IdGenerator};

    /// Accepts nothing; lets lifecycle tests run without sockets.
    #[derive(Default)]
    struct NullTransport {
        stop: Arc<tokio::sync::Notify>,
    }

    impl Transport for NullTransport {
        fn attach(&mut self, _dispatcher: Dispatcher) {}

        fn start(&self) -> crate::handler::BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.stop.notified().await;
                Ok(())
            })
        }

        fn shutdown(&self, _deadline: Instant) -> crate::handler::BoxFuture<'_, Result<()>> {
            self.stop.notify_one();
            Box::pin(async { Ok(()) })
        }
    }

    fn get(uri: &str) -> Request<Bytes> {
        Request::builder().uri(uri).body(Bytes::new()).unwrap()
    }

    async fn body_string(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn trace_layer(name: &'static str, trace: Arc<Mutex<Vec<String>>>) -> Middleware {
        middleware(move |next| {
            let trace = Arc::clone(&trace);
            handler(move |c| {
                let next = next.clone();
                let trace = Arc::clone(&trace);
                Box::pin(async move {
                    trace.lock().unwrap().push(name.to_owned());
                    next.call(c).await
                })
            })
        })
    }

    #[tokio::test]
    async fn tiers_run_pre_then_global_then_route_then_handler() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut app = App::new().with_transport(NullTransport::default());
        app.pre(trace_layer("pre", trace.clone()));
        app.global(trace_layer("global-a", trace.clone()));
        app.global(trace_layer("global-b", trace.clone()));
        let inner = trace.clone();
        app.add_handler(
            Method::GET,
            "/t",
            handler_fn(move |c| {
                inner.lock().unwrap().push("handler".to_owned());
                c.string(StatusCode::OK, "done")
            }),
            &[trace_layer("route", trace.clone())],
        )
        .unwrap();

        let ctl = app.build().unwrap();
        let resp = ctl.dispatch(get("/t")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            *trace.lock().unwrap(),
            ["pre", "global-a", "global-b", "route", "handler"]
        );
    }

    #[tokio::test]
    async fn pre_runs_for_unmatched_paths_and_can_rewrite_before_routing() {
        let strip_slash = middleware(|next| {
            handler(move |c| {
                let next = next.clone();
                Box::pin(async move {
                    let path = c.path();
                    if path.len() > 1 && path.ends_with('/') {
                        let trimmed = path.trim_end_matches('/').to_owned();
                        *c.req_mut().uri_mut() = trimmed.parse().map_err(Error::handler)?;
                    }
                    next.call(c).await
                })
            })
        });

        let mut app = App::new().with_transport(NullTransport::default());
        app.pre(strip_slash);
        app.get("/users", handler_fn(|c| c.string(StatusCode::OK, "users"))).unwrap();
        let ctl = app.build().unwrap();

        let resp = ctl.dispatch(get("/users/")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "users");

        let resp = ctl.dispatch(get("/nope/")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn errors_reach_the_error_handler_once_and_contexts_return_to_the_pool() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut app = App::new()
            .with_transport(NullTransport::default())
            .with_error_handler(move |err, c| {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = c.string(err.status(), format!("custom: {err}"));
            });
        app.get("/boom", handler_fn(|_| Err(Error::http(StatusCode::CONFLICT, "taken")))).unwrap();
        let ctl = app.build().unwrap();

        let resp = ctl.dispatch(get("/boom")).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_string(resp).await, "custom: taken");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let resp = ctl.dispatch(get("/missing")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctl.idle_contexts(), 1);
    }

    #[tokio::test]
    async fn method_not_allowed_lists_allowed_methods() {
        let mut app = App::new().with_transport(NullTransport::default());
        app.get("/users/:id", handler_fn(|c| c.no_content(StatusCode::OK))).unwrap();
        app.delete("/users/:id", handler_fn(|c| c.no_content(StatusCode::NO_CONTENT))).unwrap();
        let ctl = app.build().unwrap();

        let req = Request::builder()
            .method(Method::POST)
            .uri("/users/42")
            .body(Bytes::new())
            .unwrap();
        let resp = ctl.dispatch(req).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()[http::header::ALLOW], "DELETE, GET");
        assert_eq!(body_string(resp).await, "Method Not Allowed");
    }

    #[tokio::test]
    async fn contexts_see_plugins_and_named_routes() {
        let mut app = App::new().with_transport(NullTransport::default());
        app.set_name("api");
        app.get("/users/:id", handler_fn(|c| c.no_content(StatusCode::OK)))
            .unwrap()
            .set_name("user");
        app.get(
            "/whoami",
            handler_fn(|c| {
                let id = c.gen_id().unwrap_or_default();
                let link = c.url("user", &["7"]).unwrap_or_default();
                let name = c.app_name().to_owned();
                c.string(StatusCode::OK, format!("{name} {link} {}", id.len()))
            }),
        )
        .unwrap();
        let ctl = app.build().unwrap();

        let resp = ctl.dispatch(get("/whoami")).await;
        assert_eq!(body_string(resp).await, "api /users/7 32");
    }

    #[tokio::test]
    async fn gen_id_is_absent_once_the_builtin_is_removed() {
        let mut app = App::new().with_transport(NullTransport::default());
        assert!(app.remove_plugin(crate::plugin::UUID_PLUGIN_ID).is_some());
        app.get("/id", handler_fn(|c| {
            let found = c.gen_id().is_some();
            c.string(StatusCode::OK, found.to_string())
        }))
        .unwrap();
        let ctl = app.build().unwrap();
        assert_eq!(body_string(ctl.dispatch(get("/id")).await).await, "false");
    }

    struct Recorder {
        id: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_shutdown: bool,
        controller: Option<ControllerRef>,
    }

    impl Plugin for Recorder {
        fn id(&self) -> &str {
            self.id
        }

        fn as_attacher(&mut self) -> Option<&mut dyn Attacher> {
            Some(self)
        }

        fn as_cycler(&self) -> Option<&dyn Cycler> {
            Some(self)
        }

        fn as_id_generator(&self) -> Option<&dyn IdGenerator> {
            Some(self)
        }
    }

    impl Attacher for Recorder {
        fn attach(&mut self, controller: ControllerRef) {
            assert!(controller.upgrade().is_none(), "no controller before build");
            self.controller = Some(controller);
        }
    }

    /// Reports what the attached controller looks like from inside a plugin:
    /// `<name>/<plugin count>/<sees "second">`.
    impl IdGenerator for Recorder {
        fn next_id(&self) -> String {
            match self.controller.as_ref().and_then(ControllerRef::upgrade) {
                Some(ctl) => format!("{}/{}/{}", ctl.name(), ctl.plugins().len(), ctl.plugin("second").is_some()),
                None => "detached".to_owned(),
            }
        }
    }

    impl Cycler for Recorder {
        fn start(&self) -> crate::handler::BoxFuture<'_, Result<()>> {
            self.log.lock().unwrap().push(format!("start {}", self.id));
            Box::pin(async { Ok(()) })
        }

        fn shutdown(&self, _deadline: Instant) -> crate::handler::BoxFuture<'_, Result<()>> {
            self.log.lock().unwrap().push(format!("shutdown {}", self.id));
            let fail = self.fail_shutdown;
            Box::pin(async move {
                if fail {
                    Err(Error::http(StatusCode::INTERNAL_SERVER_ERROR, "flush failed"))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn lifecycle_hooks_run_in_registration_order_and_survive_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut app = App::new().with_transport(NullTransport::default());
        app.set_name("svc");
        assert_eq!(app.state(), State::Configured);
        for (id, fail_shutdown) in [("first", true), ("second", false)] {
            app.register(Recorder { id, log: log.clone(), fail_shutdown, controller: None })
                .unwrap();
        }
        let ctl = app.build().unwrap();
        assert_eq!(ctl.plugins().id_generator("first").unwrap().next_id(), "svc/3/true");
        assert_eq!(ctl.state(), State::Configured);

        let serving = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.start().await }
        });
        while ctl.state() != State::Started {
            tokio::task::yield_now().await;
        }
        assert!(matches!(ctl.start().await, Err(Error::InvalidState { .. })));

        ctl.shutdown(Duration::from_secs(1)).await.unwrap();
        serving.await.unwrap().unwrap();
        assert_eq!(ctl.state(), State::Stopped);
        assert_eq!(
            *log.lock().unwrap(),
            ["start first", "start second", "shutdown first", "shutdown second"]
        );

        // A second shutdown is a no-op.
        ctl.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[test]
    fn duplicate_plugins_are_rejected_before_attach() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut app = App::new();
        app.register(Recorder { id: "r", log: log.clone(), fail_shutdown: false, controller: None })
            .unwrap();
        let err = app
            .register(Recorder { id: "r", log, fail_shutdown: false, controller: None })
            .err()
            .unwrap();
        assert!(matches!(err, Error::DuplicatePlugin(id) if id == "r"));
    }

    #[tokio::test]
    async fn attached_plugins_reach_the_built_controller_without_owning_it() {
        let mut app = App::new().with_transport(NullTransport::default());
        app.set_name("edge");
        app.register(Recorder { id: "first", log: Arc::default(), fail_shutdown: false, controller: None })
            .unwrap();
        app.get("/who", handler_fn(|c| {
            let id = c.id_generator("first").map(|g| g.next_id()).unwrap_or_default();
            c.string(StatusCode::OK, id)
        }))
        .unwrap();
        let ctl = app.build().unwrap();

        assert_eq!(body_string(ctl.dispatch(get("/who")).await).await, "edge/2/false");

        let plugins = ctl.plugins().get("first").cloned().unwrap();
        drop(ctl);
        let generator = plugins.as_id_generator().unwrap();
        assert_eq!(generator.next_id(), "detached");
    }

    #[test]
    fn fresh_app_is_created_until_wired() {
        let app = App::new();
        assert_eq!(app.state(), State::Created);
        assert_eq!(app.id(), "bough@main");
    }
}
