//! Connection halves the hub and the peer client drive.
//!
//! The hub only sees [`FrameSource`] and [`FrameSink`]; the WebSocket
//! libraries stay behind these impls.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WireMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use deltasync_core::wire::MAX_MESSAGE_BYTES;

/// Largest WebSocket message or frame either end accepts: the version
/// byte plus the biggest envelope body. Envelopes go out as one frame.
pub const MAX_WS_MESSAGE: usize = MAX_MESSAGE_BYTES as usize + 1;

/// One WebSocket message, library independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

#[async_trait]
pub trait FrameSource: Send {
    /// Next frame; `None` once the connection is gone.
    async fn recv(&mut self) -> Option<Result<Frame>>;
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Send a close frame and flush.
    async fn close(&mut self) -> Result<()>;
}

// ── axum (server side) ────────────────────────────────────────────────────────

pub struct WsSource(pub SplitStream<WebSocket>);
pub struct WsSink(pub SplitSink<WebSocket, AxumMessage>);

/// Split an upgraded socket into hub-facing halves.
pub fn split_axum(socket: WebSocket) -> (WsSource, WsSink) {
    let (sink, stream) = socket.split();
    (WsSource(stream), WsSink(sink))
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        let msg = match self.0.next().await? {
            Ok(msg) => msg,
            Err(e) => return Some(Err(e).context("websocket read failed")),
        };
        Some(Ok(match msg {
            AxumMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
            AxumMessage::Binary(data) => Frame::Binary(data),
            AxumMessage::Ping(data) => Frame::Ping(data),
            AxumMessage::Pong(data) => Frame::Pong(data),
            AxumMessage::Close(_) => Frame::Close,
        }))
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Text(text) => AxumMessage::Text(text.into()),
            Frame::Binary(data) => AxumMessage::Binary(data),
            Frame::Ping(data) => AxumMessage::Ping(data),
            Frame::Pong(data) => AxumMessage::Pong(data),
            Frame::Close => AxumMessage::Close(None),
        };
        self.0.send(msg).await.context("websocket write failed")
    }

    async fn close(&mut self) -> Result<()> {
        SinkExt::close(&mut self.0).await.context("websocket close failed")
    }
}

// ── tokio-tungstenite (client side) ───────────────────────────────────────────

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct ClientSource(pub SplitStream<ClientStream>);
pub struct ClientSink(pub SplitSink<ClientStream, WireMessage>);

fn client_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_WS_MESSAGE))
        .max_frame_size(Some(MAX_WS_MESSAGE))
}

/// Dial `url` and split the connection.
pub async fn connect(url: &str) -> Result<(ClientSource, ClientSink)> {
    let (ws, _response) =
        tokio_tungstenite::connect_async_with_config(url, Some(client_config()), true)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
    let (sink, stream) = ws.split();
    Ok((ClientSource(stream), ClientSink(sink)))
}

#[async_trait]
impl FrameSource for ClientSource {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            let msg = match self.0.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e).context("websocket read failed")),
            };
            return Some(Ok(match msg {
                WireMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
                WireMessage::Binary(data) => Frame::Binary(data),
                WireMessage::Ping(data) => Frame::Ping(data),
                WireMessage::Pong(data) => Frame::Pong(data),
                WireMessage::Close(_) => Frame::Close,
                // Raw frames only surface when reading with a custom config.
                WireMessage::Frame(_) => continue,
            }));
        }
    }
}

#[async_trait]
impl FrameSink for ClientSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Text(text) => WireMessage::Text(text.into()),
            Frame::Binary(data) => WireMessage::Binary(data),
            Frame::Ping(data) => WireMessage::Ping(data),
            Frame::Pong(data) => WireMessage::Pong(data),
            Frame::Close => WireMessage::Close(None),
        };
        self.0.send(msg).await.context("websocket write failed")
    }

    async fn close(&mut self) -> Result<()> {
        SinkExt::close(&mut self.0).await.context("websocket close failed")
    }
}

// ── In-memory halves for tests ────────────────────────────────────────────────
