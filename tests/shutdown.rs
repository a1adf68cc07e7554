//! Serving over a loopback socket and shutting down under load.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bough::signal::{self, SignalKind};
use bough::{App, Controller, Error, Server, State, handler, handler_fn};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};

/// A controller on an ephemeral port whose `/sleep` handler announces itself
/// on `entered` and then sleeps for `nap`.
fn sleepy(nap: Duration, entered: Arc<Notify>) -> (Controller, std::net::SocketAddr) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let server = Server::from_listener(listener).unwrap();
    let addr = server.local_addr();

    let mut app = App::new().with_transport(server);
    app.get(
        "/sleep",
        handler(move |c| {
            let entered = Arc::clone(&entered);
            Box::pin(async move {
                entered.notify_one();
                tokio::time::sleep(nap).await;
                c.string(StatusCode::OK, "rested")
            })
        }),
    )
    .unwrap();
    app.get("/ping", handler_fn(|c| c.string(StatusCode::OK, "pong"))).unwrap();
    (app.build().unwrap(), addr)
}

async fn request(addr: std::net::SocketAddr, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = format!("GET {path} HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();
    stream
}

async fn read_to_end(mut stream: TcpStream) -> String {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn serves_requests_over_tcp() {
    let (ctl, addr) = sleepy(Duration::ZERO, Arc::new(Notify::new()));
    let serving = tokio::spawn({
        let ctl = ctl.clone();
        async move { ctl.start().await }
    });

    let response = read_to_end(request(addr, "/ping").await).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("pong"), "{response}");

    ctl.shutdown(Duration::from_secs(2)).await.unwrap();
    serving.await.unwrap().unwrap();
    assert_eq!(ctl.state(), State::Stopped);
}

#[tokio::test]
async fn in_flight_requests_finish_when_they_fit_the_timeout() {
    let entered = Arc::new(Notify::new());
    let (ctl, addr) = sleepy(Duration::from_millis(100), entered.clone());
    let serving = tokio::spawn({
        let ctl = ctl.clone();
        async move { ctl.start().await }
    });

    let stream = request(addr, "/sleep").await;
    entered.notified().await;

    ctl.shutdown(Duration::from_secs(5)).await.unwrap();
    let response = read_to_end(stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("rested"), "{response}");

    serving.await.unwrap().unwrap();
    assert_eq!(ctl.idle_contexts(), 1);
}

#[tokio::test]
async fn slow_requests_are_aborted_at_the_deadline() {
    let entered = Arc::new(Notify::new());
    let (ctl, addr) = sleepy(Duration::from_secs(30), entered.clone());
    let serving = tokio::spawn({
        let ctl = ctl.clone();
        async move { ctl.start().await }
    });

    let stream = request(addr, "/sleep").await;
    entered.notified().await;

    let started = Instant::now();
    let result = ctl.shutdown(Duration::from_millis(200)).await;
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert!(matches!(result, Err(Error::ShutdownTimeout(1))), "{result:?}");

    // The connection was dropped without a response and its context came back.
    assert_eq!(read_to_end(stream).await, "");
    assert_eq!(ctl.idle_contexts(), 1);
    serving.await.unwrap().unwrap();
    assert_eq!(ctl.state(), State::Stopped);
}

#[tokio::test]
async fn terminate_signal_drives_a_graceful_shutdown() {
    let (ctl, _addr) = sleepy(Duration::ZERO, Arc::new(Notify::new()));
    let serving = tokio::spawn({
        let ctl = ctl.clone();
        async move { ctl.start().await }
    });
    while ctl.state() != State::Started {
        tokio::task::yield_now().await;
    }

    let (tx, rx) = mpsc::channel(4);
    // Hangup is not watched here and must not stop the loop.
    tx.send(SignalKind::Hangup).await.unwrap();
    tx.send(SignalKind::Terminate).await.unwrap();

    signal::wait(
        rx,
        &[SignalKind::Interrupt, SignalKind::Terminate],
        signal::graceful(ctl.clone(), Duration::from_secs(1)),
    )
    .await;

    assert_eq!(ctl.state(), State::Stopped);
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let (ctl, _addr) = sleepy(Duration::ZERO, Arc::new(Notify::new()));
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
}
