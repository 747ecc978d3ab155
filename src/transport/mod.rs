//! Socket seam between the connection manager and the wire.
//!
//! [`Connector`] yields an independent writer/reader pair so the read loop
//! and the dispatcher can use the socket full duplex. Production code uses
//! [`WebSocketConnector`]; tests substitute an in-memory double.

mod websocket;

pub use websocket::WebSocketConnector;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

pub type Socket = (Box<dyn FrameWriter>, Box<dyn FrameReader>);

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Socket, TransportError>;
}

#[async_trait]
pub trait FrameWriter: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait FrameReader: Send {
    /// Next text frame, or `None` once the peer has closed the socket.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
}
