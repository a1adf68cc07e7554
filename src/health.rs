//! Kubernetes health-check handlers.
//!
//! | Probe | Path | Question |
//! |---|---|---|
//! | **Liveness** | `/healthz` | Is the process alive? Failure → restart. |
//! | **Readiness** | `/readyz` | Can the pod serve traffic? Failure → pulled from load-balancer. |
//!
//! ```rust
//! use bough::{App, health};
//!
//! let mut app = App::new();
//! app.get("/healthz", health::liveness()).unwrap();
//! app.get("/readyz", health::readiness()).unwrap();
//! ```
//!
//! To gate readiness on dependencies, register your own handler on `/readyz`
//! that answers `503 Service Unavailable` until they are up.

use http::StatusCode;

use crate::handler::{Handler, handler_fn};

/// Always `200 OK` with body `ok`. Deliberately dependency-free: if the
/// process can answer HTTP at all, it is alive.
pub fn liveness() -> Handler {
    handler_fn(|c| c.string(StatusCode::OK, "ok"))
}

/// `200 OK` with body `ready`.
pub fn readiness() -> Handler {
    handler_fn(|c| c.string(StatusCode::OK, "ready"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextPool;

    #[tokio::test]
    async fn probes_answer_ok() {
        let pool = ContextPool::new();
        for (h, body) in [(liveness(), "ok"), (readiness(), "ready")] {
            let mut c = pool.checkout();
            h.call(&mut c).await.unwrap();
            assert_eq!(c.status(), StatusCode::OK);
            assert_eq!(c.response_body().as_ref(), body.as_bytes());
        }
    }
}
