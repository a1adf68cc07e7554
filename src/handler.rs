//! Handler and middleware types, type erasure, and chain composition.
//!
//! # How async handlers are stored
//!
//! The router holds handlers of *different* closure types in one tree, so
//! every handler is erased behind `dyn ErasedHandler` and shared through an
//! [`Arc`]. A handler borrows the pooled [`Ctx`] mutably for exactly as long
//! as its future runs, which is why the erased signature ties the returned
//! future to the borrow:
//!
//! ```text
//! |c| Box::pin(async move { … })          ← user writes this
//!        ↓ handler(closure)
//! Handler(Arc::new(FnHandler(closure)))   ← heap-allocated once, at startup
//!        ↓ stored in the radix tree, cloned per request (atomic inc)
//! handler.call(&mut ctx)                  ← one vtable dispatch
//! ```
//!
//! # Middleware order
//!
//! A [`Middleware`] turns one handler into another. [`merge`] applies a list
//! of them so that the *first* registered is the *outermost* layer and
//! therefore runs first; see its docs for the exact rule.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{ALLOW, HeaderValue};
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::service::Service;

use crate::context::Ctx;
use crate::error::{Error, Result};

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future borrowing the request context for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` because it appears inside the public [`Handler`]
/// type. Construct handlers with [`handler`] or [`handler_fn`] instead.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call<'a>(&'a self, ctx: &'a mut Ctx) -> BoxFuture<'a, Result<()>>;
}

// ── Handler ───────────────────────────────────────────────────────────────────

/// A request handler: async function from [`Ctx`] to an optional [`Error`].
///
/// Cheap to clone (one `Arc`). Responses are written into the context; the
/// `Result` only reports failure, which the controller routes to its error
/// handler.
#[derive(Clone)]
pub struct Handler(Arc<dyn ErasedHandler + Send + Sync + 'static>);

impl Handler {
    /// Runs the handler against `ctx`.
    pub fn call<'a>(&'a self, ctx: &'a mut Ctx) -> BoxFuture<'a, Result<()>> {
        self.0.call(ctx)
    }

    /// Registers this handler on `mux`. Sugar for [`Muxer::add_handler`].
    ///
    /// [`Muxer::add_handler`]: crate::Muxer::add_handler
    pub fn mount<'m>(
        self,
        mux: &'m mut dyn crate::Muxer,
        method: http::Method,
        path: &str,
        middleware: &[Middleware],
    ) -> Result<&'m mut crate::NamedRoute> {
        mux.add_handler(method, path, self, middleware)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Handler")
    }
}

/// Builds a [`Handler`] from an async closure.
///
/// The closure receives the context and returns a boxed future borrowing it:
///
/// ```rust
/// use bough::{handler, Handler};
/// use http::StatusCode;
///
/// let get_user: Handler = handler(|c| Box::pin(async move {
///     let id = c.param("id").to_owned();
///     c.string(StatusCode::OK, id)
/// }));
/// ```
pub fn handler<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    Handler(Arc::new(FnHandler(f)))
}

/// Builds a [`Handler`] from a synchronous closure.
///
/// For handlers that never await: health probes, redirects, fixed bodies.
pub fn handler_fn<F>(f: F) -> Handler
where
    F: Fn(&mut Ctx) -> Result<()> + Send + Sync + 'static,
{
    Handler(Arc::new(SyncHandler(f)))
}

/// Holds an async handler closure and bridges it to [`ErasedHandler`].
struct FnHandler<F>(F);

impl<F> ErasedHandler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    fn call<'a>(&'a self, ctx: &'a mut Ctx) -> BoxFuture<'a, Result<()>> {
        (self.0)(ctx)
    }
}

struct SyncHandler<F>(F);

impl<F> ErasedHandler for SyncHandler<F>
where
    F: Fn(&mut Ctx) -> Result<()> + Send + Sync,
{
    fn call<'a>(&'a self, ctx: &'a mut Ctx) -> BoxFuture<'a, Result<()>> {
        Box::pin(std::future::ready((self.0)(ctx)))
    }
}

/// Adapts a hyper [`Service`] into a [`Handler`].
///
/// The service sees a copy of the request (method, URI, version, headers and
/// body); its response status, headers and collected body are written into
/// the context. Service and body errors surface as [`Error::Handler`].
pub fn wrap_service<S, B>(service: S) -> Handler
where
    S: Service<Request<Bytes>, Response = Response<B>> + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    handler(move |c| {
        let pending = service.call(forward(c.req()));
        Box::pin(async move {
            let (parts, body) = pending.await.map_err(Error::handler)?.into_parts();
            let body = body.collect().await.map_err(Error::handler)?.to_bytes();
            c.response_headers_mut().extend(parts.headers);
            c.write(parts.status, body)
        })
    })
}

fn forward(req: &Request<Bytes>) -> Request<Bytes> {
    let mut out = Request::new(req.body().clone());
    *out.method_mut() = req.method().clone();
    *out.uri_mut() = req.uri().clone();
    *out.version_mut() = req.version();
    *out.headers_mut() = req.headers().clone();
    out
}

// ── Middleware ────────────────────────────────────────────────────────────────

/// A decorator turning one [`Handler`] into another.
///
/// The returned handler may run logic before and after delegating to the
/// wrapped one, or short-circuit by not delegating at all.
#[derive(Clone)]
pub struct Middleware(Arc<dyn Fn(Handler) -> Handler + Send + Sync + 'static>);

impl Middleware {
    /// Wraps `next` in this layer.
    pub fn apply(&self, next: Handler) -> Handler {
        (self.0)(next)
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Middleware")
    }
}

/// Builds a [`Middleware`] from a `Handler → Handler` closure.
///
/// ```rust
/// use bough::{handler, middleware, Middleware};
///
/// let log: Middleware = middleware(|next| handler(move |c| {
///     let next = next.clone();
///     Box::pin(async move {
///         tracing::debug!(path = c.path(), "before");
///         let res = next.call(c).await;
///         tracing::debug!(status = %c.status(), "after");
///         res
///     })
/// }));
/// ```
pub fn middleware<F>(f: F) -> Middleware
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Middleware(Arc::new(f))
}

/// Composes `handler` with an ordered list of middleware.
///
/// An empty list returns the handler unchanged. Otherwise the *last* element
/// wraps the handler first and becomes the innermost layer; composition
/// proceeds backwards through the list so the *first* element ends up
/// outermost. At run time the layers therefore execute in registration order,
/// then the handler.
pub fn merge(handler: Handler, middleware: &[Middleware]) -> Handler {
    let mut h = handler;
    for m in middleware.iter().rev() {
        h = m.apply(h);
    }
    h
}

// ── Terminal handlers ─────────────────────────────────────────────────────────

/// Dispatched when no route matches the path.
pub fn not_found() -> Handler {
    handler_fn(|_| Err(Error::NotFound))
}

/// Dispatched when the path matches under other methods only.
///
/// Advertises the methods that would have matched in an `Allow` header.
pub fn method_not_allowed() -> Handler {
    handler_fn(|c| {
        let allow = c
            .allowed_methods()
            .iter()
            .map(http::Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&allow) {
            c.response_headers_mut().insert(ALLOW, value);
        }
        Err(Error::MethodNotAllowed)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::context::ContextPool;

    fn tracing_layer(name: &'static str, trace: Arc<Mutex<Vec<&'static str>>>) -> Middleware {
        middleware(move |next| {
            let trace = Arc::clone(&trace);
            handler(move |c| {
                let next = next.clone();
                let trace = Arc::clone(&trace);
                Box::pin(async move {
                    trace.lock().unwrap().push(name);
                    next.call(c).await
                })
            })
        })
    }

    #[tokio::test]
    async fn merge_runs_middleware_in_registration_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&trace);
        let h = handler_fn(move |_| {
            inner.lock().unwrap().push("H");
            Ok(())
        });
        let chain = merge(
            h,
            &[tracing_layer("A", trace.clone()), tracing_layer("B", trace.clone())],
        );

        let pool = ContextPool::new();
        let mut ctx = pool.checkout();
        chain.call(&mut ctx).await.unwrap();

        assert_eq!(*trace.lock().unwrap(), vec!["A", "B", "H"]);
    }

    #[tokio::test]
    async fn merge_with_empty_list_is_the_handler() {
        let pool = ContextPool::new();
        let mut ctx = pool.checkout();
        let chain = merge(handler_fn(|c| {
            c.set("hit", true);
            Ok(())
        }), &[]);
        chain.call(&mut ctx).await.unwrap();
        assert_eq!(ctx.get::<bool>("hit"), Some(&true));
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_layers() {
        let guard = middleware(|_next| handler_fn(|_| Err(Error::http(http::StatusCode::UNAUTHORIZED, "no"))));
        let chain = merge(handler_fn(|_| panic!("handler must not run")), &[guard]);

        let pool = ContextPool::new();
        let mut ctx = pool.checkout();
        let err = chain.call(&mut ctx).await.unwrap_err();
        assert_eq!(err.status(), http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrapped_service_writes_its_response_into_the_context() {
        let echo = hyper::service::service_fn(|req: Request<Bytes>| async move {
            let text = format!("{} {} {}", req.method(), req.uri().path(), req.body().len());
            let mut resp = Response::new(http_body_util::Full::new(Bytes::from(text)));
            *resp.status_mut() = http::StatusCode::ACCEPTED;
            resp.headers_mut().insert("x-wrapped", HeaderValue::from_static("yes"));
            Ok::<_, std::convert::Infallible>(resp)
        });
        let h = wrap_service(echo);

        let pool = ContextPool::new();
        let mut ctx = pool.checkout();
        ctx.reset(
            Request::builder()
                .method(http::Method::POST)
                .uri("/legacy/items?x=1")
                .body(Bytes::from_static(b"abc"))
                .unwrap(),
        );
        h.call(&mut ctx).await.unwrap();

        assert_eq!(ctx.status(), http::StatusCode::ACCEPTED);
        assert_eq!(ctx.response_headers()["x-wrapped"], "yes");
        assert_eq!(ctx.response_body().as_ref(), b"POST /legacy/items 3");
    }

    #[tokio::test]
    async fn method_not_allowed_sets_allow_header() {
        let pool = ContextPool::new();
        let mut ctx = pool.checkout();
        ctx.set_allowed_methods(vec![http::Method::GET, http::Method::PUT]);

        let err = method_not_allowed().call(&mut ctx).await.unwrap_err();
        assert!(matches!(err, Error::MethodNotAllowed));
        assert_eq!(ctx.response_headers().get(ALLOW).unwrap(), "GET, PUT");
    }
}
