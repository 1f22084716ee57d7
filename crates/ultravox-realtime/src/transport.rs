//! The connection a session runs over.
//!
//! [`Connector`] opens a [`Transport`] for a join URL. The production
//! implementation is a `tokio-tungstenite` WebSocket; [`memory`] provides an
//! in-process pair for tests and replays.

use crate::error::TransportError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, protocol::Message as WsMessage},
};
use tracing::{debug, info};

/// One WebSocket frame as seen by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Raw audio. The session does not decode it.
    Binary(Vec<u8>),
}

/// A connected, bidirectional frame stream.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the remote end is gone.
    ///
    /// Must be cancel-safe: the session polls it inside `select!` and drops
    /// the future whenever another branch wins.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Flushes and closes the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports for join URLs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// Connects over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        info!(status = %response.status(), "Connected to call WebSocket.");
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(data) => WsMessage::Binary(data),
        };
        self.stream.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            };
            match message {
                WsMessage::Text(text) => return Some(Ok(Frame::Text(text))),
                WsMessage::Binary(data) => return Some(Ok(Frame::Binary(data))),
                WsMessage::Close(close_frame) => {
                    debug!(?close_frame, "Call WebSocket closed by server.");
                    let (code, reason) = close_frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((1005, String::new()));
                    return Some(Err(TransportError::RemoteClosed { code, reason }));
                }
                // tungstenite answers pings on its own.
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub mod memory {
    //! An in-process transport.
    //!
    //! [`MemoryConnector::new`] returns the connector a session uses plus a
    //! [`RemoteEnd`] that plays the server: it injects inbound frames and
    //! observes everything the session sends.

    use super::{Connector, Frame, Transport};
    use crate::error::TransportError;
    use async_trait::async_trait;
    use std::sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    };
    use tokio::sync::mpsc;

    type Inbound = Result<Frame, TransportError>;

    enum Handshake {
        Accept,
        Reject(String),
        Hang,
    }

    pub struct MemoryConnector {
        transport: Mutex<Option<MemoryTransport>>,
        handshake: Handshake,
    }

    impl MemoryConnector {
        pub fn new() -> (Self, RemoteEnd) {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let closes = Arc::new(AtomicUsize::new(0));
            let transport = MemoryTransport {
                inbound: inbound_rx,
                outbound: outbound_tx,
                closes: closes.clone(),
                closed: false,
            };
            let remote = RemoteEnd {
                inbound: Some(inbound_tx),
                outbound: outbound_rx,
                closes,
            };
            let connector = Self {
                transport: Mutex::new(Some(transport)),
                handshake: Handshake::Accept,
            };
            (connector, remote)
        }

        /// A connector whose handshake always fails with `reason`.
        pub fn rejecting(reason: impl Into<String>) -> Self {
            Self {
                transport: Mutex::new(None),
                handshake: Handshake::Reject(reason.into()),
            }
        }

        /// A connector whose handshake never completes.
        pub fn unresponsive() -> Self {
            Self {
                transport: Mutex::new(None),
                handshake: Handshake::Hang,
            }
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, TransportError> {
            match &self.handshake {
                Handshake::Accept => {}
                Handshake::Reject(reason) => return Err(TransportError::Handshake(reason.clone())),
                Handshake::Hang => std::future::pending::<()>().await,
            }
            let transport = self
                .transport
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or_else(|| TransportError::Handshake("transport already taken".to_string()))?;
            Ok(Box::new(transport))
        }
    }

    pub struct MemoryTransport {
        inbound: mpsc::UnboundedReceiver<Inbound>,
        outbound: mpsc::UnboundedSender<Frame>,
        closes: Arc<AtomicUsize>,
        closed: bool,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
            if self.closed {
                return Err(TransportError::Closed);
            }
            self.outbound.send(frame).map_err(|_| TransportError::Closed)
        }

        async fn recv(&mut self) -> Option<Inbound> {
            self.inbound.recv().await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closed = true;
            Ok(())
        }
    }

    /// The server side of a [`MemoryConnector`].
    pub struct RemoteEnd {
        inbound: Option<mpsc::UnboundedSender<Inbound>>,
        outbound: mpsc::UnboundedReceiver<Frame>,
        closes: Arc<AtomicUsize>,
    }

    impl RemoteEnd {
        /// Delivers a text frame to the session. Returns `false` once the
        /// session has dropped its transport.
        pub fn send_text(&self, text: impl Into<String>) -> bool {
            self.push(Ok(Frame::Text(text.into())))
        }

        pub fn send_binary(&self, data: Vec<u8>) -> bool {
            self.push(Ok(Frame::Binary(data)))
        }

        /// Delivers a transport error to the session.
        pub fn fail(&self, error: TransportError) -> bool {
            self.push(Err(error))
        }

        /// Hangs up: the session's next `recv` returns `None`.
        pub fn disconnect(&mut self) {
            self.inbound = None;
        }

        fn push(&self, item: Inbound) -> bool {
            self.inbound
                .as_ref()
                .is_some_and(|inbound| inbound.send(item).is_ok())
        }

        /// Waits for the next frame the session sent.
        pub async fn next_outbound(&mut self) -> Option<Frame> {
            self.outbound.recv().await
        }

        pub fn try_next_outbound(&mut self) -> Option<Frame> {
            self.outbound.try_recv().ok()
        }

        /// How many times the session closed its transport.
        pub fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_frames_flow_both_ways() {
            let (connector, mut remote) = MemoryConnector::new();
            let mut transport = connector.connect("memory://call").await.unwrap();

            assert!(remote.send_text("ping"));
            assert_eq!(
                transport.recv().await.unwrap().unwrap(),
                Frame::Text("ping".to_string())
            );

            transport
                .send(Frame::Text("pong".to_string()))
                .await
                .unwrap();
            assert_eq!(
                remote.next_outbound().await,
                Some(Frame::Text("pong".to_string()))
            );

            transport.close().await.unwrap();
            assert_eq!(remote.close_count(), 1);
            assert!(matches!(
                transport.send(Frame::Text("late".to_string())).await,
                Err(TransportError::Closed)
            ));

            remote.disconnect();
            assert!(transport.recv().await.is_none());
        }

        #[tokio::test]
        async fn test_second_connect_and_rejection_fail_handshake() {
            let (connector, _remote) = MemoryConnector::new();
            assert!(connector.connect("memory://call").await.is_ok());
            assert!(matches!(
                connector.connect("memory://call").await,
                Err(TransportError::Handshake(_))
            ));

            let rejecting = MemoryConnector::rejecting("401 Unauthorized");
            match rejecting.connect("memory://call").await {
                Err(TransportError::Handshake(reason)) => assert_eq!(reason, "401 Unauthorized"),
                other => panic!("expected handshake failure, got {:?}", other.err()),
            }
        }
    }
}
