//! # bough
//!
//! The request-dispatch core of an HTTP application framework: a radix-tree
//! router, three-tier middleware, pooled request contexts, capability-based
//! plugins and a lifecycle controller with signal-driven graceful shutdown.
//!
//! ## What a request goes through
//!
//! ```text
//! transport ─▶ pre middleware ─▶ router ─▶ global middleware ─▶ route middleware ─▶ handler
//!                                  │
//!                                  ├─ no path match      ─▶ 404 handler
//!                                  └─ path, wrong method ─▶ 405 handler (+ Allow)
//! ```
//!
//! Pre middleware see every request, matched or not, and may rewrite the path
//! before routing. Any layer can fail; the error skips the rest of the chain
//! and lands in the controller's single error handler, which writes the
//! response.
//!
//! - Radix-tree routing via [`matchit`]: literal > `:param` > trailing `*`
//! - Existing hyper services mount as handlers through [`wrap_service`]
//! - HTTP/1.1 and HTTP/2 via hyper
//! - Contexts are pooled and returned on every exit path, panics included
//! - Plugins opt into capabilities: binding, rendering, ids, start/stop hooks, reload
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use bough::{App, Error, handler, health, middleware};
//! use http::StatusCode;
//!
//! #[tokio::main]
//! async fn main() -> bough::Result<()> {
//!     let mut app = App::new().with_transport(bough::Server::bind("0.0.0.0:3000")?);
//!     app.pre(middleware::trace());
//!     app.global(middleware::server_info());
//!
//!     app.get("/users/:id", handler(|c| Box::pin(async move {
//!         let id = c.param("id").to_owned();
//!         if id == "0" {
//!             return Err(Error::http(StatusCode::NOT_FOUND, "no such user"));
//!         }
//!         c.json(StatusCode::OK, &serde_json::json!({ "id": id }))
//!     })))?
//!     .set_name("user");
//!
//!     app.get("/healthz", health::liveness())?;
//!
//!     // Serves until SIGINT/SIGTERM, then drains within the shutdown timeout.
//!     app.build()?.run().await
//! }
//! ```

mod app;
mod context;
mod error;
mod handler;
mod router;
mod server;

pub mod config;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod plugin;
pub mod signal;
pub mod static_files;

pub use app::{
    App, Controller, ControllerRef, DEFAULT_BIND_ADDR, Dispatcher, ErrorHandler, State, VERSION,
    default_error_handler,
};
pub use config::Config;
pub use context::{ContextPool, Ctx, Params, PooledCtx};
pub use error::{Error, Result};
pub use handler::{
    BoxFuture, Handler, Middleware, handler, handler_fn, merge, method_not_allowed, middleware,
    not_found, wrap_service,
};
pub use plugin::Plugin;
pub use router::{Lookup, Muxer, NamedRoute, RadixRouter};
pub use server::{Server, Transport};
pub use static_files::static_files;
