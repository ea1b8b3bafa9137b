//! Message transports for the bridge engine.
//!
//! The engine only sees text frames. A [`Transport`] splits into a
//! [`FrameSource`] read by the dispatch loop and a [`FrameSink`] owned by the
//! writer task. Implementations:
//! - **MemoryTransport**: in-process channel pair, for embedding and tests
//! - **FramedTransport**: any AsyncRead/AsyncWrite pair with length-prefixed frames
//! - **WebSocketTransport**: one text frame per message over a WebSocket client

use std::io;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::TextFrameCodec;
use crate::error::BridgeError;

/// Inbound half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next text frame, `None` once the peer has closed.
    async fn next_frame(&mut self) -> Option<io::Result<String>>;
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: String) -> io::Result<()>;

    /// Close with a status code and reason. Best-effort.
    async fn close(&mut self, code: u16, reason: &str) -> io::Result<()>;
}

pub trait Transport: Send + 'static {
    type Source: FrameSource + 'static;
    type Sink: FrameSink + 'static;

    fn split(self) -> (Self::Source, Self::Sink);
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// What the engine did, as seen from the peer end of a memory transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Frame(String),
    Closed { code: u16, reason: String },
}

/// Engine end of an in-memory transport.
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<PeerEvent>,
}

/// Backend end of an in-memory transport.
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<PeerEvent>,
}

/// Create a connected engine/peer pair.
pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    let (to_engine, inbound) = mpsc::unbounded_channel();
    let (outbound, from_engine) = mpsc::unbounded_channel();
    (
        MemoryTransport { inbound, outbound },
        MemoryPeer {
            tx: Some(to_engine),
            rx: from_engine,
        },
    )
}

impl MemoryPeer {
    /// Send a raw text frame to the engine. Returns false once hung up.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        match &self.tx {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.send(value.to_string())
    }

    /// Next event from the engine, `None` once the engine dropped its sink.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.rx.recv().await
    }

    /// Next frame parsed as JSON. Skips nothing: a close event yields `None`.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        match self.rx.recv().await? {
            PeerEvent::Frame(frame) => serde_json::from_str(&frame).ok(),
            PeerEvent::Closed { .. } => None,
        }
    }

    /// Close the backend side; the engine sees end-of-stream.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }
}

impl Transport for MemoryTransport {
    type Source = MemorySource;
    type Sink = MemorySink;

    fn split(self) -> (Self::Source, Self::Sink) {
        (
            MemorySource { rx: self.inbound },
            MemorySink {
                tx: self.outbound,
            },
        )
    }
}

pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<io::Result<String>> {
        self.rx.recv().await.map(Ok)
    }
}

pub struct MemorySink {
    tx: mpsc::UnboundedSender<PeerEvent>,
}

fn peer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped")
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: String) -> io::Result<()> {
        self.tx.send(PeerEvent::Frame(frame)).map_err(|_| peer_gone())
    }

    async fn close(&mut self, code: u16, reason: &str) -> io::Result<()> {
        self.tx
            .send(PeerEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| peer_gone())
    }
}

// ---------------------------------------------------------------------------
// Length-prefixed byte stream
// ---------------------------------------------------------------------------

/// Transport over any byte stream pair (pipes, unix sockets, TCP).
///
/// There is no close handshake on a raw stream: `close` flushes and shuts the
/// writer down.
pub struct FramedTransport<R, W> {
    reader: FramedRead<R, TextFrameCodec>,
    writer: FramedWrite<W, TextFrameCodec>,
}

impl<R, W> FramedTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, TextFrameCodec::new()),
            writer: FramedWrite::new(writer, TextFrameCodec::new()),
        }
    }
}

impl<R, W> Transport for FramedTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Source = FramedRead<R, TextFrameCodec>;
    type Sink = FramedWrite<W, TextFrameCodec>;

    fn split(self) -> (Self::Source, Self::Sink) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl<R> FrameSource for FramedRead<R, TextFrameCodec>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_frame(&mut self) -> Option<io::Result<String>> {
        self.next().await
    }
}

#[async_trait]
impl<W> FrameSink for FramedWrite<W, TextFrameCodec>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: String) -> io::Result<()> {
        self.send(frame).await
    }

    async fn close(&mut self, code: u16, reason: &str) -> io::Result<()> {
        tracing::debug!(code, reason, "Closing framed transport");
        SinkExt::<String>::close(self).await
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client transport.
pub struct WebSocketTransport {
    stream: WsStream,
}

impl WebSocketTransport {
    /// Perform the WebSocket handshake. Failure here is fatal to the bridge.
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        tracing::debug!(url, "Connecting");
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| BridgeError::Connect(format!("{}: {}", url, e)))?;
        tracing::info!(url, status = %response.status(), "WebSocket connected");
        Ok(Self { stream })
    }
}

impl Transport for WebSocketTransport {
    type Source = WebSocketSource;
    type Sink = WebSocketSink;

    fn split(self) -> (Self::Source, Self::Sink) {
        let (sink, stream) = self.stream.split();
        (WebSocketSource { stream }, WebSocketSink { sink })
    }
}

pub struct WebSocketSource {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn next_frame(&mut self) -> Option<io::Result<String>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(io::Error::other(e))),
            };
            match msg {
                WsMessage::Text(text) => return Some(Ok(text.as_str().to_owned())),
                WsMessage::Binary(bytes) => {
                    return Some(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
                    );
                }
                WsMessage::Close(frame) => {
                    tracing::debug!(?frame, "Peer sent close frame");
                    return None;
                }
                // Ping/pong are answered by tungstenite itself.
                _ => continue,
            }
        }
    }
}

pub struct WebSocketSink {
    sink: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_frame(&mut self, frame: String) -> io::Result<()> {
        self.sink
            .send(WsMessage::Text(frame.into()))
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self, code: u16, reason: &str) -> io::Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.sink
            .send(WsMessage::Close(Some(frame)))
            .await
            .map_err(io::Error::other)?;
        self.sink.close().await.map_err(io::Error::other)
    }
}
