//! Process signals and the callbacks that react to them.
//!
//! [`wait`] is the loop: it reads [`SignalKind`]s off a channel, drops the
//! kinds it was not asked to watch, and hands the rest to a callback. The
//! callback returns `true` to stop waiting or `false` to keep going.
//! [`listen`] feeds that loop from the operating system; tests feed it from a
//! plain `mpsc` channel.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use bough::signal::{self, SignalKind};
//!
//! # async fn run(ctl: bough::Controller) -> bough::Result<()> {
//! signal::listen(
//!     &[SignalKind::Interrupt, SignalKind::Terminate],
//!     signal::graceful(ctl, Duration::from_secs(10)),
//! )
//! .await
//! # }
//! ```

use std::fmt;
use std::future::{Future, Ready, ready};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::app::Controller;
use crate::error::Result;
use crate::handler::BoxFuture;

/// The process events a controller reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// `SIGINT`, Ctrl-C.
    Interrupt,
    /// `SIGTERM`.
    Terminate,
    /// `SIGQUIT`.
    Quit,
    /// `SIGHUP`.
    Hangup,
}

impl SignalKind {
    pub const ALL: [SignalKind; 4] = [Self::Interrupt, Self::Terminate, Self::Quit, Self::Hangup];
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Quit => "SIGQUIT",
            Self::Hangup => "SIGHUP",
        })
    }
}

/// Feeds every event in `kinds` to `on_signal` until it returns `true` or
/// the channel closes. An empty `kinds` watches everything.
pub async fn wait<F, Fut>(mut events: mpsc::Receiver<SignalKind>, kinds: &[SignalKind], mut on_signal: F)
where
    F: FnMut(SignalKind) -> Fut,
    Fut: Future<Output = bool>,
{
    while let Some(kind) = events.recv().await {
        if !kinds.is_empty() && !kinds.contains(&kind) {
            debug!(signal = %kind, "ignoring unwatched signal");
            continue;
        }
        info!(signal = %kind, "signal received");
        if on_signal(kind).await {
            break;
        }
    }
}

/// Subscribes to `kinds` at the operating system and runs [`wait`] on them.
///
/// Fails if a signal handler cannot be installed.
pub async fn listen<F, Fut>(kinds: &[SignalKind], on_signal: F) -> Result<()>
where
    F: FnMut(SignalKind) -> Fut,
    Fut: Future<Output = bool>,
{
    let watched: &[SignalKind] = if kinds.is_empty() { &SignalKind::ALL } else { kinds };
    let (tx, rx) = mpsc::channel(watched.len());

    // Forwarders stop when the set is dropped.
    let mut forwarders = JoinSet::new();
    for &kind in watched {
        subscribe(kind, tx.clone(), &mut forwarders)?;
    }
    drop(tx);

    wait(rx, watched, on_signal).await;
    forwarders.shutdown().await;
    Ok(())
}

#[cfg(unix)]
fn subscribe(kind: SignalKind, tx: mpsc::Sender<SignalKind>, set: &mut JoinSet<()>) -> Result<()> {
    use tokio::signal::unix;

    let mut stream = unix::signal(match kind {
        SignalKind::Interrupt => unix::SignalKind::interrupt(),
        SignalKind::Terminate => unix::SignalKind::terminate(),
        SignalKind::Quit => unix::SignalKind::quit(),
        SignalKind::Hangup => unix::SignalKind::hangup(),
    })?;
    set.spawn(async move {
        while stream.recv().await.is_some() {
            if tx.send(kind).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}

// Only Ctrl-C exists outside unix; the other kinds never fire.
#[cfg(not(unix))]
fn subscribe(kind: SignalKind, tx: mpsc::Sender<SignalKind>, set: &mut JoinSet<()>) -> Result<()> {
    if kind == SignalKind::Interrupt {
        set.spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(kind).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(())
}

/// Stops waiting at once.
pub fn quit() -> impl FnMut(SignalKind) -> Ready<bool> {
    |_| ready(true)
}

/// Shuts `controller` down within `timeout`, then stops waiting.
pub fn graceful(controller: Controller, timeout: Duration) -> impl FnMut(SignalKind) -> BoxFuture<'static, bool> {
    move |kind| {
        let controller = controller.clone();
        Box::pin(async move {
            info!(signal = %kind, ?timeout, "starting graceful shutdown");
            if let Err(e) = controller.shutdown(timeout).await {
                error!(error = %e, "graceful shutdown incomplete");
            }
            true
        })
    }
}

/// Reloads `controller`'s plugins and keeps waiting.
pub fn reload(controller: Controller) -> impl FnMut(SignalKind) -> Ready<bool> {
    move |_| {
        controller.reload();
        ready(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unwatched_kinds_never_reach_the_callback() {
        let (tx, rx) = mpsc::channel(8);
        for kind in [SignalKind::Hangup, SignalKind::Quit, SignalKind::Terminate, SignalKind::Interrupt] {
            tx.send(kind).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        wait(rx, &[SignalKind::Terminate, SignalKind::Interrupt], |kind| {
            seen.push(kind);
            ready(false)
        })
        .await;

        assert_eq!(seen, [SignalKind::Terminate, SignalKind::Interrupt]);
    }

    #[tokio::test]
    async fn returning_true_stops_the_loop() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(SignalKind::Hangup).await.unwrap();
        tx.send(SignalKind::Quit).await.unwrap();
        tx.send(SignalKind::Hangup).await.unwrap();

        let mut calls = 0;
        wait(rx, &[], |kind| {
            calls += 1;
            ready(kind == SignalKind::Quit)
        })
        .await;

        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn quit_stops_on_first_event() {
        let (tx, rx) = mpsc::channel(1);
        tx.send(SignalKind::Quit).await.unwrap();
        wait(rx, &[SignalKind::Quit], quit()).await;
    }
}
