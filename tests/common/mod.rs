#![allow(dead_code)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use relayhub::api::{router, AppState};
use relayhub::hub::Hub;
use relayhub::protocol::{CommandKind, Frame, RegisterMsg};
use relayhub::server;
use relayhub::transport::{ConnId, DeliveryError, Outbox, Transport};

/// Transport that records every send and fails for selected connections.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(ConnId, CommandKind, Bytes)>>,
    failing: Mutex<HashSet<ConnId>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, conn: ConnId) {
        self.failing.lock().insert(conn);
    }

    pub fn sent(&self) -> Vec<(ConnId, CommandKind, Bytes)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, conn: ConnId) -> Vec<CommandKind> {
        self.sent
            .lock()
            .iter()
            .filter(|(c, _, _)| *c == conn)
            .map(|(_, kind, _)| *kind)
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, conn: ConnId, kind: CommandKind, payload: Bytes) -> Result<(), DeliveryError> {
        if self.failing.lock().contains(&conn) {
            return Err(DeliveryError::Closed(conn));
        }
        self.sent.lock().push((conn, kind, payload));
        Ok(())
    }
}

/// A hub with both listeners bound to ephemeral localhost ports.
pub struct TestHub {
    pub hub: Hub,
    pub service_addr: SocketAddr,
    pub web_addr: SocketAddr,
    pub shutdown: CancellationToken,
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn start_hub() -> TestHub {
    let hub = Hub::new(Outbox::new());
    let shutdown = CancellationToken::new();

    let worker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let service_addr = worker_listener.local_addr().unwrap();
    tokio::spawn(server::serve(
        hub.clone(),
        worker_listener,
        Duration::from_secs(2),
        shutdown.clone(),
    ));

    let web_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let web_addr = web_listener.local_addr().unwrap();
    let app = router(AppState {
        hub: hub.clone(),
        shutdown: shutdown.clone(),
    });
    let http_shutdown = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(web_listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
            .unwrap();
    });

    TestHub {
        hub,
        service_addr,
        web_addr,
        shutdown,
    }
}

/// Connect a worker and complete the Register handshake.
pub async fn connect_worker(addr: SocketAddr, group: &str, nickname: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    Frame::control(
        CommandKind::Register,
        &RegisterMsg {
            group: group.into(),
            nickname: nickname.into(),
        },
    )
    .unwrap()
    .write_to(&mut stream)
    .await
    .unwrap();
    let ack = read_frame(&mut stream).await;
    assert_eq!(ack.kind, CommandKind::Registered);
    stream
}

pub async fn read_frame(stream: &mut TcpStream) -> Frame {
    tokio::time::timeout(Duration::from_secs(3), Frame::read_from(stream))
        .await
        .expect("timed out waiting for worker frame")
        .expect("worker stream closed")
}

pub async fn write_frame<T: serde::Serialize>(stream: &mut TcpStream, kind: CommandKind, msg: &T) {
    Frame::control(kind, msg)
        .unwrap()
        .write_to(stream)
        .await
        .unwrap();
}

pub type FrontEnd = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect_frontend(addr: SocketAddr) -> FrontEnd {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    ws
}

pub async fn send_ws<T: serde::Serialize>(ws: &mut FrontEnd, kind: CommandKind, msg: &T) {
    let frame = Frame::control(kind, msg).unwrap();
    ws.send(Message::Binary(frame.encode())).await.unwrap();
}

/// Next hub frame on a front-end socket, skipping control messages.
pub async fn recv_ws(ws: &mut FrontEnd) -> Frame {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("timed out waiting for front-end frame")
            .expect("front-end socket closed")
            .expect("websocket error");
        match msg {
            Message::Binary(data) => return Frame::decode(&data).expect("valid frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected websocket message: {other:?}"),
        }
    }
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
