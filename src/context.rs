//! The per-request context and the pool it lives in.
//!
//! A [`Ctx`] carries everything one request needs on its way through the
//! middleware chain: the inbound request, the response being built, the route
//! parameters bound by the router, and a scratch map middleware can use to
//! hand values to handlers further in.
//!
//! Contexts are not allocated per request. [`ContextPool::checkout`] pops an
//! idle one off a free list (or allocates when the list is empty) and hands it
//! out inside a [`PooledCtx`] guard. Dropping the guard clears the context and
//! pushes it back. The drop runs on every exit path: normal return, error,
//! panic unwinding through the dispatch future, or the future being aborted
//! at the shutdown deadline.

use std::any::Any;
use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, LOCATION};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::app::Shared;
use crate::error::{Error, Result};
use crate::plugin::{Binder, IdGenerator, Plugin, Renderer, UUID_PLUGIN_ID};
use crate::router::{Lookup, Muxer};

// ── Params ────────────────────────────────────────────────────────────────────

/// Route parameters bound by the router, in match order.
///
/// Backed by a `Vec` that keeps its capacity across pooled reuse. Routes
/// rarely bind more than a handful of parameters, so a linear scan wins over
/// hashing.
#[derive(Debug, Default, Clone)]
pub struct Params(Vec<(String, String)>);

impl Params {
    /// Returns the value bound to `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Binds `value` under `name`, replacing an earlier binding.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

// ── Ctx ───────────────────────────────────────────────────────────────────────

/// Mutable state for one in-flight request.
///
/// Obtained from a [`ContextPool`]; never shared between two requests at once.
pub struct Ctx {
    req: Request<Bytes>,

    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,

    params: Params,
    store: HashMap<String, Box<dyn Any + Send + Sync>>,
    allowed: Vec<Method>,

    // Frozen controller state: name, debug flag, plugins, named routes.
    // `None` for contexts from a detached pool.
    shared: Option<Arc<Shared>>,

    in_use: bool,
}

impl Ctx {
    fn new(shared: Option<Arc<Shared>>) -> Self {
        Self {
            req: Request::default(),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            params: Params::default(),
            store: HashMap::new(),
            allowed: Vec::new(),
            shared,
            in_use: false,
        }
    }

    /// Primes the context for `req`, discarding anything left from earlier use.
    pub fn reset(&mut self, req: Request<Bytes>) {
        self.clear();
        self.req = req;
    }

    fn release(&mut self) {
        self.clear();
        self.req = Request::default();
        self.in_use = false;
    }

    fn clear(&mut self) {
        self.status = StatusCode::OK;
        self.headers.clear();
        self.body = Bytes::new();
        self.params.clear();
        self.store.clear();
        self.allowed.clear();
    }

    /// `true` while the context is checked out of its pool.
    pub fn in_use(&self) -> bool {
        self.in_use
    }

    // ── Request ───────────────────────────────────────────────────────────────

    pub fn req(&self) -> &Request<Bytes> {
        &self.req
    }

    /// Mutable access to the request, e.g. for pre middleware rewriting the
    /// path before routing.
    pub fn req_mut(&mut self) -> &mut Request<Bytes> {
        &mut self.req
    }

    pub fn method(&self) -> &Method {
        self.req.method()
    }

    pub fn path(&self) -> &str {
        self.req.uri().path()
    }

    pub fn body(&self) -> &Bytes {
        self.req.body()
    }

    /// Request header value, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.req.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// First query-string value for `name`, percent-decoded.
    pub fn query(&self, name: &str) -> Option<String> {
        let query = self.req.uri().query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    // ── Route parameters ──────────────────────────────────────────────────────

    /// Bound route parameter, or `""` when the route has no such parameter.
    ///
    /// For a route `/users/:id`, `c.param("id")` on `/users/42` returns `"42"`.
    /// A trailing wildcard is bound under `"*"`.
    pub fn param(&self, name: &str) -> &str {
        self.params.get(name).unwrap_or("")
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    /// Runs `mux` against the current method and path, writing bound
    /// parameters into this context.
    pub(crate) fn lookup(&mut self, mux: &dyn Muxer) -> Lookup {
        self.params.clear();
        mux.lookup(self.req.method(), self.req.uri().path(), &mut self.params)
    }

    /// Methods under which the current path would have matched. Filled in
    /// only when routing ended in `405 Method Not Allowed`.
    pub fn allowed_methods(&self) -> &[Method] {
        &self.allowed
    }

    pub(crate) fn set_allowed_methods(&mut self, allowed: Vec<Method>) {
        self.allowed = allowed;
    }

    // ── Scratch map ───────────────────────────────────────────────────────────

    /// Stores a value for later middleware or the handler.
    pub fn set<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.store.insert(key.into(), Box::new(value));
    }

    /// Reads a value stored with [`set`](Ctx::set). `None` if the key is
    /// missing or holds a different type.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.store.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.store.remove(key).is_some()
    }

    // ── Response ──────────────────────────────────────────────────────────────

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn response_body(&self) -> &Bytes {
        &self.body
    }

    /// Sets a response header, replacing earlier values.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(Error::handler)?;
        let value = HeaderValue::from_str(value).map_err(Error::handler)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Writes a body with an explicit content type.
    pub fn bytes(&mut self, status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Result<()> {
        let value = HeaderValue::from_str(content_type).map_err(Error::handler)?;
        self.headers.insert(CONTENT_TYPE, value);
        self.status = status;
        self.body = body.into();
        Ok(())
    }

    /// `text/plain; charset=utf-8`.
    pub fn string(&mut self, status: StatusCode, body: impl Into<String>) -> Result<()> {
        self.bytes(status, "text/plain; charset=utf-8", body.into())
    }

    /// `text/html; charset=utf-8`.
    pub fn html(&mut self, status: StatusCode, body: impl Into<String>) -> Result<()> {
        self.bytes(status, "text/html; charset=utf-8", body.into())
    }

    /// Serializes `value` with serde_json as `application/json`.
    pub fn json<T: Serialize + ?Sized>(&mut self, status: StatusCode, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value).map_err(Error::handler)?;
        self.bytes(status, "application/json", body)
    }

    /// Sets status and body, leaving the response headers as they are.
    pub fn write(&mut self, status: StatusCode, body: impl Into<Bytes>) -> Result<()> {
        self.status = status;
        self.body = body.into();
        Ok(())
    }

    /// Status only, empty body.
    pub fn no_content(&mut self, status: StatusCode) -> Result<()> {
        self.status = status;
        self.body = Bytes::new();
        Ok(())
    }

    pub fn redirect(&mut self, status: StatusCode, location: &str) -> Result<()> {
        if !status.is_redirection() {
            return Err(Error::http(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{status} is not a redirect status"),
            ));
        }
        let value = HeaderValue::from_str(location).map_err(Error::handler)?;
        self.headers.insert(LOCATION, value);
        self.no_content(status)
    }

    /// Sends the file at `path` with a content type guessed from its extension.
    ///
    /// A missing file or a directory is reported as [`Error::NotFound`].
    pub async fn file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = match tokio::fs::read(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) if e.kind() == std::io::ErrorKind::IsADirectory => return Err(Error::NotFound),
            Err(e) => return Err(Error::Io(e)),
        };
        self.bytes(StatusCode::OK, crate::static_files::content_type(path), contents)
    }

    /// Moves the response out, leaving the context's response state empty.
    pub fn take_response(&mut self) -> Response<Full<Bytes>> {
        let mut resp = Response::new(Full::new(std::mem::take(&mut self.body)));
        *resp.status_mut() = std::mem::replace(&mut self.status, StatusCode::OK);
        *resp.headers_mut() = std::mem::take(&mut self.headers);
        resp
    }

    // ── Controller access ─────────────────────────────────────────────────────

    /// Name of the controller serving this request, `""` when detached.
    pub fn app_name(&self) -> &str {
        self.shared.as_deref().map_or("", |s| s.name.as_str())
    }

    pub fn is_debug(&self) -> bool {
        self.shared.as_deref().is_some_and(|s| s.debug)
    }

    pub fn plugin(&self, id: &str) -> Option<&Arc<dyn Plugin>> {
        self.shared.as_deref()?.plugins.get(id)
    }

    pub fn binder(&self, id: &str) -> Option<&dyn Binder> {
        self.shared.as_deref()?.plugins.binder(id)
    }

    pub fn renderer(&self, id: &str) -> Option<&dyn Renderer> {
        self.shared.as_deref()?.plugins.renderer(id)
    }

    pub fn id_generator(&self, id: &str) -> Option<&dyn IdGenerator> {
        self.shared.as_deref()?.plugins.id_generator(id)
    }

    /// A fresh identifier from the built-in UUIDv7 plugin.
    ///
    /// `None` only if that plugin was removed before the controller was built.
    pub fn gen_id(&self) -> Option<String> {
        self.id_generator(UUID_PLUGIN_ID).map(|g| g.next_id())
    }

    /// Decodes request data into `T` using the binder registered under `id`.
    pub fn bind<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        let binder = self.binder(id).ok_or_else(|| Error::PluginAbsent {
            id: id.to_owned(),
            capability: "Binder",
        })?;
        crate::plugin::bind_into(binder, self)
    }

    /// Renders template `name` with the renderer registered under `id` and
    /// writes it as an HTML body.
    pub fn render(
        &mut self,
        id: &str,
        status: StatusCode,
        name: &str,
        data: &serde_json::Value,
    ) -> Result<()> {
        let shared = self.shared.clone();
        let renderer = shared
            .as_deref()
            .and_then(|s| s.plugins.renderer(id))
            .ok_or_else(|| Error::PluginAbsent { id: id.to_owned(), capability: "Renderer" })?;
        let mut out = Vec::new();
        renderer.render(&mut out, name, data, self)?;
        self.bytes(status, "text/html; charset=utf-8", out)
    }

    /// Reverse lookup: the path of the route named `name` with `params`
    /// substituted positionally.
    pub fn url(&self, name: &str, params: &[&str]) -> Option<String> {
        self.shared
            .as_deref()?
            .routes
            .iter()
            .find(|r| r.name() == name)
            .map(|r| r.url(params))
    }
}

// ── Pool ──────────────────────────────────────────────────────────────────────

/// A free list of reusable [`Ctx`] values.
///
/// The lock guards only a `Vec` push or pop, never a request.
pub struct ContextPool {
    free: Mutex<Vec<Box<Ctx>>>,
    shared: Option<Arc<Shared>>,
}

impl ContextPool {
    /// A pool whose contexts are not attached to any controller. Plugin and
    /// reverse-route lookups on them report absence.
    pub fn new() -> Self {
        Self { free: Mutex::new(Vec::new()), shared: None }
    }

    pub(crate) fn attached(shared: Arc<Shared>) -> Self {
        Self { free: Mutex::new(Vec::new()), shared: Some(shared) }
    }

    /// Takes an idle context, allocating a new one when none is idle.
    pub fn checkout(&self) -> PooledCtx<'_> {
        let popped = self.free.lock().pop();
        let mut ctx = popped.unwrap_or_else(|| Box::new(Ctx::new(self.shared.clone())));
        ctx.in_use = true;
        PooledCtx { pool: self, ctx: ManuallyDrop::new(ctx) }
    }

    /// Number of idle contexts waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn put(&self, mut ctx: Box<Ctx>) {
        ctx.release();
        self.free.lock().push(ctx);
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A checked-out context. Dropping it releases the context to its pool.
pub struct PooledCtx<'p> {
    pool: &'p ContextPool,
    ctx: ManuallyDrop<Box<Ctx>>,
}

impl PooledCtx<'_> {
    /// Returns the context to the pool now rather than at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledCtx<'_> {
    type Target = Ctx;

    fn deref(&self) -> &Ctx {
        &self.ctx
    }
}

impl DerefMut for PooledCtx<'_> {
    fn deref_mut(&mut self) -> &mut Ctx {
        &mut self.ctx
    }
}

impl Drop for PooledCtx<'_> {
    fn drop(&mut self) {
        // SAFETY: `ctx` is never touched again after this.
        let ctx = unsafe { ManuallyDrop::take(&mut self.ctx) };
        self.pool.put(ctx);
    }
}
