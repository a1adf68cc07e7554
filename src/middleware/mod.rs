//! Built-in middleware.
//!
//! | Middleware | Effect |
//! |---|---|
//! | [`server_info`] | `server: <name>`; in debug mode also `x-powered-by: bough/<version>` |
//! | [`request_id`] | echoes or generates `x-request-id` using the id-generator plugin |
//! | [`trace`] | one `tracing` span per request, with status and latency on completion |
//!
//! All of them are plain [`Middleware`] values and can sit in any tier:
//!
//! ```rust
//! use bough::{App, middleware};
//!
//! let mut app = App::new();
//! app.pre(middleware::trace());
//! app.global(middleware::server_info());
//! ```

use std::time::Instant;

use http::HeaderValue;
use http::header::SERVER;
use tracing::{Instrument, info, info_span, warn};

use crate::handler::{Middleware, handler, middleware};

pub const X_POWERED_BY: &str = "x-powered-by";
pub const X_REQUEST_ID: &str = "x-request-id";

/// Sets the `server` header to the controller's name.
pub fn server_info() -> Middleware {
    middleware(|next| {
        handler(move |c| {
            let next = next.clone();
            Box::pin(async move {
                if let Ok(name) = HeaderValue::from_str(c.app_name()) {
                    c.response_headers_mut().insert(SERVER, name);
                }
                if c.is_debug() {
                    c.response_headers_mut().insert(
                        X_POWERED_BY,
                        HeaderValue::from_static(concat!("bough/", env!("CARGO_PKG_VERSION"))),
                    );
                }
                next.call(c).await
            })
        })
    })
}

/// Propagates the caller's `x-request-id`, or assigns one from the
/// id-generator plugin. The id is also stored in the context under
/// [`X_REQUEST_ID`].
pub fn request_id() -> Middleware {
    middleware(|next| {
        handler(move |c| {
            let next = next.clone();
            Box::pin(async move {
                let id = match c.header(X_REQUEST_ID) {
                    Some(id) => Some(id.to_owned()),
                    None => c.gen_id(),
                };
                if let Some(id) = id {
                    if let Ok(value) = HeaderValue::from_str(&id) {
                        c.response_headers_mut().insert(X_REQUEST_ID, value);
                    }
                    c.set(X_REQUEST_ID, id);
                }
                next.call(c).await
            })
        })
    })
}

/// Logs one line per request inside a `request` span.
///
/// The status logged is the one the chain set; failed requests are logged
/// with their error instead, since the error handler runs afterwards.
pub fn trace() -> Middleware {
    middleware(|next| {
        handler(move |c| {
            let next = next.clone();
            let span = info_span!("request", method = %c.method(), path = c.path());
            Box::pin(
                async move {
                    let started = Instant::now();
                    let result = next.call(c).await;
                    let latency = started.elapsed();
                    match &result {
                        Ok(()) => info!(status = c.status().as_u16(), ?latency, "handled"),
                        Err(e) => warn!(status = e.status().as_u16(), error = %e, ?latency, "failed"),
                    }
                    result
                }
                .instrument(span),
            )
        })
    })
}
