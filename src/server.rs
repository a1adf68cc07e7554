//! The network transport and its graceful shutdown.
//!
//! A [`Transport`] is attached to a controller once, when the app is built,
//! and receives a [`Dispatcher`] it hands every decoded request to. The
//! default transport is [`Server`], a hyper server speaking HTTP/1.1 and
//! HTTP/2.
//!
//! # Shutdown sequence
//!
//! 1. Stop `listener.accept()`; no new connections are made.
//! 2. Ask every open connection to finish its in-flight request and close.
//! 3. Wait for connection tasks until the deadline.
//! 4. Abort whatever is still running. Dropping a task's future also returns
//!    its request context to the pool.
//!
//! Under Kubernetes, keep `terminationGracePeriodSeconds` above the shutdown
//! timeout so step 4 happens before SIGKILL does.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::{Dispatcher, State};
use crate::error::{Error, Result};
use crate::handler::BoxFuture;

/// Drain budget used when the accept loop stops without a shutdown call.
const FALLBACK_DRAIN: Duration = Duration::from_secs(10);

/// Plugs a network front-end into a controller.
pub trait Transport: Send + Sync + 'static {
    /// Called once, while the app is being built.
    fn attach(&mut self, dispatcher: Dispatcher);

    /// Serves until shut down. Resolves once in-flight work has drained.
    fn start(&self) -> BoxFuture<'_, Result<()>>;

    /// Stops accepting and drains until `deadline`. Returns
    /// [`Error::ShutdownTimeout`] if work had to be aborted.
    fn shutdown(&self, deadline: Instant) -> BoxFuture<'_, Result<()>>;
}

#[derive(Debug, Clone, Copy)]
enum Drain {
    Clean,
    Forced(usize),
}

/// The hyper-backed HTTP transport.
pub struct Server {
    addr: SocketAddr,
    listener: Mutex<Option<std::net::TcpListener>>,
    dispatcher: Option<Dispatcher>,
    stop: CancellationToken,
    deadline: Mutex<Option<Instant>>,
    serving: AtomicBool,
    drained: watch::Sender<Option<Drain>>,
}

impl Server {
    /// A server that binds `addr` when started.
    ///
    /// ```rust
    /// use bough::Server;
    /// let server = Server::bind("127.0.0.1:3000").unwrap();
    /// assert_eq!(server.local_addr().port(), 3000);
    /// ```
    pub fn bind(addr: &str) -> Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address `{addr}`: {e}")))?;
        Ok(Self::with_parts(addr, None))
    }

    /// A server over an already bound listener. Useful for port 0 in tests.
    pub fn from_listener(listener: std::net::TcpListener) -> Result<Self> {
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        Ok(Self::with_parts(addr, Some(listener)))
    }

    fn with_parts(addr: SocketAddr, listener: Option<std::net::TcpListener>) -> Self {
        Self {
            addr,
            listener: Mutex::new(listener),
            dispatcher: None,
            stop: CancellationToken::new(),
            deadline: Mutex::new(None),
            serving: AtomicBool::new(false),
            drained: watch::Sender::new(None),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn serve(&self) -> Result<()> {
        let Some(dispatcher) = self.dispatcher.clone() else {
            return Err(Error::InvalidState { action: "serve", state: State::Created });
        };

        let pre_bound = self.listener.lock().take();
        let listener = match pre_bound {
            Some(std) => TcpListener::from_std(std)?,
            None => TcpListener::bind(self.addr).await?,
        };
        let addr = listener.local_addr()?;
        self.serving.store(true, Ordering::Release);
        info!(%addr, "listening");

        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                // Shutdown is checked first so queued connections are not
                // accepted once it has been requested.
                biased;

                () = self.stop.cancelled() => break,

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    tasks.spawn(connection(stream, peer, dispatcher.clone(), self.stop.clone()));
                }

                // Reap finished connection tasks.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }
        drop(listener);

        let deadline = (*self.deadline.lock()).unwrap_or_else(|| Instant::now() + FALLBACK_DRAIN);
        info!(in_flight = tasks.len(), "draining connections");

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        let outcome = match tokio::time::timeout_at(deadline, drain).await {
            Ok(()) => Drain::Clean,
            Err(_) => {
                let aborted = tasks.len();
                warn!(aborted, "drain deadline passed, aborting connections");
                tasks.shutdown().await;
                Drain::Forced(aborted)
            }
        };

        self.drained.send_replace(Some(outcome));
        info!(%addr, "listener closed");
        Ok(())
    }

    async fn stop_serving(&self, deadline: Instant) -> Result<()> {
        *self.deadline.lock() = Some(deadline);
        self.stop.cancel();

        if !self.serving.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut rx = self.drained.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => *outcome,
            Err(_) => None,
        };
        match outcome {
            Some(Drain::Forced(n)) => Err(Error::ShutdownTimeout(n)),
            _ => Ok(()),
        }
    }
}

impl Transport for Server {
    fn attach(&mut self, dispatcher: Dispatcher) {
        self.dispatcher = Some(dispatcher);
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.serve())
    }

    fn shutdown(&self, deadline: Instant) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.stop_serving(deadline))
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("serving", &self.serving.load(Ordering::Relaxed))
            .finish()
    }
}

/// Serves one connection until it closes or shutdown asks it to.
async fn connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    stop: CancellationToken,
) {
    // Called once per request on the connection.
    let svc = service_fn(move |req| {
        let dispatcher = dispatcher.clone();
        async move { Ok::<_, Infallible>(dispatch(dispatcher, req).await) }
    });

    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    let mut closing = false;
    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(%peer, "connection error: {e}");
                }
                break;
            }
            () = stop.cancelled(), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Buffers the body and hands the request to the controller.
async fn dispatch(dispatcher: Dispatcher, req: hyper::Request<Incoming>) -> http::Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("request body error: {e}");
            let mut resp = http::Response::new(Full::new(Bytes::new()));
            *resp.status_mut() = http::StatusCode::BAD_REQUEST;
            return resp;
        }
    };
    dispatcher.dispatch(http::Request::from_parts(parts, body)).await
}
