//! A relay served on a loopback port, plus clients for its two surfaces.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::time::Duration;

use blobs::{Created, Joined, Relay, RelayConfig};
use blobs_proto::Message;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Token signing secret of every test relay.
pub const SECRET: &str = "hunter2";

/// How long a test waits for a frame before giving up.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side of a relay WebSocket.
pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A running relay. Dropping it starts a graceful shutdown.
pub struct Server {
    /// Where it listens.
    pub addr: SocketAddr,
    /// The relay behind the router, for looking at tunnels directly.
    pub relay: Relay,
    /// Dropped to stop the server.
    _shutdown: oneshot::Sender<()>,
}

/// Default settings with a signing secret.
pub fn config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.secret = SECRET.into();
    config
}

/// Binds a free loopback port and serves `config` on it.
pub async fn start(config: RelayConfig) -> Server {
    let relay = Relay::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, stopped) = oneshot::channel::<()>();
    tokio::spawn(blobs::serve(relay.clone(), listener, async {
        let _ = stopped.await;
    }));
    Server {
        addr,
        relay,
        _shutdown: shutdown,
    }
}

impl Server {
    /// `http://` URL of `path`.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// `ws://` URL of `path`.
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }

    /// `PUT /new` from the loopback address.
    pub async fn create(&self) -> Created {
        let response = reqwest::Client::new()
            .put(self.url("/new"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.unwrap()
    }

    /// `PUT /join?s=` from the loopback address.
    pub async fn join(&self, secret: &str) -> Joined {
        let response = reqwest::Client::new()
            .put(self.url(&format!("/join?s={secret}")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.unwrap()
    }

    /// Opens the peer socket `token` grants.
    pub async fn attach(&self, token: &str) -> Socket {
        let url = self.ws_url(&format!("/tunnel?t={}", escape(token)));
        let (socket, _) = connect_async(url).await.unwrap();
        socket
    }
}

/// Percent-encodes a token for a query string.
pub fn escape(token: &str) -> String {
    token
        .replace('|', "%7C")
        .replace('+', "%2B")
        .replace('/', "%2F")
}

/// Writes one binary protocol frame.
pub async fn send(socket: &mut Socket, msg: &Message) {
    let frame = blobs_proto::encode(msg).unwrap();
    socket.send(WsMessage::binary(frame)).await.unwrap();
}

/// Reads the next protocol message. `None` once the relay closed the
/// socket.
pub async fn recv(socket: &mut Socket) -> Option<Message> {
    loop {
        let frame = next_frame(socket).await?;
        if frame.is_binary() {
            return Some(blobs_proto::decode(&frame.into_data()).unwrap());
        }
    }
}

/// Reads the next text frame of a waiting-room socket.
pub async fn recv_text(socket: &mut Socket) -> Option<String> {
    loop {
        let frame = next_frame(socket).await?;
        if frame.is_text() {
            return Some(frame.to_text().unwrap().to_owned());
        }
    }
}

/// Next data frame, skipping control frames. `None` on close.
async fn next_frame(socket: &mut Socket) -> Option<WsMessage> {
    loop {
        let next = tokio::time::timeout(FRAME_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a frame");
        match next {
            Some(Ok(frame)) if frame.is_close() => return None,
            Some(Ok(frame)) if frame.is_binary() || frame.is_text() => return Some(frame),
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return None,
        }
    }
}
